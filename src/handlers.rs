//! Presence event handling.
//!
//! Turns inbound transport events into durable account state. Each event
//! variant is independent and idempotent: replaying an event produces the
//! same final account row. Events for different addresses run concurrently;
//! events for the same bare address feed one FIFO worker queue and apply in
//! arrival order, so a presence change and its follow-up arriving close
//! together cannot land swapped and leave the row showing stale state.

use crate::address::BareAddress;
use crate::db::{AccountPatch, Database, Feature, FeatureSet, MatchKey, PresenceState};
use crate::error::Error;
use crate::registration::RegistrationMessenger;
use crate::transport::{Event, Transport};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Feature identifiers that mark a client video-capable.
const VIDEO_FEATURES: [&str; 2] = [
    "urn:xmpp:jingle:apps:rtp:video",
    "http://www.google.com/xmpp/protocol/video",
];

/// Feature identifiers that mark a client voice-capable.
const VOICE_FEATURES: [&str; 2] = [
    "urn:xmpp:jingle:apps:rtp:audio",
    "http://www.google.com/xmpp/protocol/voice",
];

/// Per-address FIFO queue and the task draining it.
struct AddressWorker {
    queue: mpsc::UnboundedSender<Event>,
    task: JoinHandle<()>,
}

/// Handles inbound presence/chat events against the account store.
pub struct PresenceHandler {
    db: Database,
    transport: Arc<dyn Transport>,
    messenger: Arc<RegistrationMessenger>,
    workers: DashMap<String, AddressWorker>,
}

impl PresenceHandler {
    pub fn new(
        db: Database,
        transport: Arc<dyn Transport>,
        messenger: Arc<RegistrationMessenger>,
    ) -> Self {
        Self {
            db,
            transport,
            messenger,
            workers: DashMap::new(),
        }
    }

    /// Drain the inbound event stream until the transport closes it, then
    /// let every per-address queue finish before returning.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<Event>) {
        while let Some(event) = events.recv().await {
            self.route(event);
        }
        info!("Event stream closed, draining per-address queues");

        let keys: Vec<String> = self.workers.iter().map(|w| w.key().clone()).collect();
        for key in keys {
            if let Some((_, worker)) = self.workers.remove(&key) {
                drop(worker.queue);
                if worker.task.await.is_err() {
                    error!(address = %key, "Presence worker panicked");
                }
            }
        }
    }

    /// Route one event to its address queue.
    ///
    /// Events for the same bare address apply in arrival order; different
    /// addresses proceed independently. Worker entries live until the stream
    /// ends, so the map stays bounded by the contact population.
    fn route(self: &Arc<Self>, event: Event) {
        let key = event
            .sender()
            .and_then(|raw| BareAddress::parse(raw).ok())
            .map(|bare| bare.as_str().to_string());
        let Some(key) = key else {
            // Addressless or unparseable sender: no ordering domain.
            let handler = Arc::clone(self);
            tokio::spawn(async move {
                handler.dispatch(event).await;
            });
            return;
        };

        let worker = self.workers.entry(key).or_insert_with(|| self.spawn_worker());
        if worker.queue.send(event).is_err() {
            error!("Presence worker queue closed early");
        }
    }

    fn spawn_worker(self: &Arc<Self>) -> AddressWorker {
        let (queue, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                handler.dispatch(event).await;
            }
        });
        AddressWorker { queue, task }
    }

    /// Handle one event.
    ///
    /// Failures are terminal for the event: logged, never retried. The next
    /// event for the same contact is self-contained and will converge the
    /// row again.
    pub async fn dispatch(&self, event: Event) {
        crate::metrics::record_event(event.kind());

        if let Err(e) = self.handle_event(&event).await {
            error!(kind = event.kind(), error = %e, "Event handling failed");
        }
    }

    async fn handle_event(&self, event: &Event) -> Result<(), Error> {
        match event {
            Event::ChatMessage { sender, body } => self.on_chat_message(sender, body.as_deref()).await,
            Event::Presence {
                sender,
                available,
                state,
                status_text,
            } => {
                self.on_presence(sender, *available, state.as_deref(), status_text.clone())
                    .await
            }
            Event::SubscriptionRequest { sender } => self.on_subscription_request(sender).await,
            Event::CapabilityReport { sender, features } => {
                self.on_capability_report(sender, features).await
            }
            Event::Error { detail } => {
                error!(detail = %detail, "Error frame from transport");
                Ok(())
            }
        }
    }

    /// A chat message from a contact re-sends their registration link.
    ///
    /// Receiving any message from a still-unregistered contact is treated as
    /// a nudge to finish registration.
    async fn on_chat_message(&self, sender: &str, body: Option<&str>) -> Result<(), Error> {
        let Some(body) = body.filter(|b| !b.is_empty()) else {
            // Bodyless frame: protocol control traffic, not user content.
            debug!(sender = %sender, "Ignoring chat message without body");
            return Ok(());
        };

        let address = BareAddress::parse(sender)?;
        info!(address = %address, body = %body, "Chat message received");

        match self.db.accounts().find_by_address(address.as_str()).await? {
            Some(account) => {
                self.messenger
                    .send_registration_message(&address, account.account_code.as_deref())
                    .await
            }
            None => {
                // Terminal no-op: nothing to nudge for an unknown contact.
                info!(address = %address, "Chat message from unknown contact, ignoring");
                Ok(())
            }
        }
    }

    /// Persist a presence change to the account row for the bare address.
    ///
    /// Unavailable always forces `offline` with no status text; offline
    /// frames carry no meaningful status.
    async fn on_presence(
        &self,
        sender: &str,
        available: bool,
        state: Option<&str>,
        status_text: Option<String>,
    ) -> Result<(), Error> {
        let address = BareAddress::parse(sender)?;

        let (state, status_text) = if available {
            let state = state
                .map(PresenceState::parse)
                .unwrap_or(PresenceState::Online);
            (state, status_text)
        } else {
            (PresenceState::Offline, None)
        };

        info!(
            address = %address,
            state = %state.as_str(),
            status = status_text.as_deref().unwrap_or(""),
            "Presence change"
        );

        let patch = AccountPatch {
            state: Some(state),
            status_text: Some(status_text),
            ..AccountPatch::for_address(address.as_str())
        };
        self.db
            .accounts()
            .reconcile(&[MatchKey::Address], &patch)
            .await?;
        Ok(())
    }

    /// Accept a subscription unconditionally, subscribe back, then send the
    /// registration link (minting a code, since none is known yet).
    async fn on_subscription_request(&self, sender: &str) -> Result<(), Error> {
        let address = BareAddress::parse(sender)?;
        info!(address = %address, "Accepting subscription request");

        self.transport.accept_subscription(address.as_str()).await?;
        self.transport
            .request_subscription(address.as_str())
            .await?;

        self.messenger
            .send_registration_message(&address, None)
            .await
    }

    /// Map reported feature identifiers onto the tracked capability flags.
    ///
    /// Each flag updates independently against the bitset held in the
    /// fetched row; a report can never clobber a flag it does not speak to.
    async fn on_capability_report(&self, sender: &str, features: &[String]) -> Result<(), Error> {
        let address = BareAddress::parse(sender)?;

        let base = self
            .db
            .accounts()
            .find_by_address(address.as_str())
            .await?
            .map(|account| account.features)
            .unwrap_or_else(FeatureSet::empty);

        // Each flag updates independently against the fetched bitset; a
        // report that says nothing about a family leaves that flag at its
        // stored value.
        let has_any = |ids: &[&str]| features.iter().any(|f| ids.contains(&f.as_str()));
        let mut updated = base;
        if has_any(&VIDEO_FEATURES) {
            updated.set(Feature::Video, true);
        }
        if has_any(&VOICE_FEATURES) {
            updated.set(Feature::Voice, true);
        }

        if updated == base {
            debug!(address = %address, "Capability report matches stored flags");
        }

        let patch = AccountPatch {
            features: Some(updated),
            ..AccountPatch::for_address(address.as_str())
        };
        self.db
            .accounts()
            .reconcile(&[MatchKey::Address], &patch)
            .await?;
        Ok(())
    }
}
