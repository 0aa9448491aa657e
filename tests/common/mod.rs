//! Integration test common infrastructure.
//!
//! Provides an in-memory account store and a recording transport double that
//! captures outgoing operations instead of hitting a network.

use async_trait::async_trait;
use mystatusd::config::SiteConfig;
use mystatusd::db::Database;
use mystatusd::handlers::PresenceHandler;
use mystatusd::registration::RegistrationMessenger;
use mystatusd::transport::{Transport, TransportError};
use std::sync::Arc;
use tokio::sync::Mutex;

/// One captured outgoing operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Message { to: String, body: String },
    AcceptSubscription(String),
    RequestSubscription(String),
    Keepalive,
}

/// Transport double recording every outgoing operation in order.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<Sent>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Drain and return everything sent so far.
    pub async fn take(&self) -> Vec<Sent> {
        std::mem::take(&mut *self.sent.lock().await)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_message(&self, to: &str, body: &str) -> Result<(), TransportError> {
        self.sent.lock().await.push(Sent::Message {
            to: to.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }

    async fn accept_subscription(&self, to: &str) -> Result<(), TransportError> {
        self.sent
            .lock()
            .await
            .push(Sent::AcceptSubscription(to.to_string()));
        Ok(())
    }

    async fn request_subscription(&self, to: &str) -> Result<(), TransportError> {
        self.sent
            .lock()
            .await
            .push(Sent::RequestSubscription(to.to_string()));
        Ok(())
    }

    async fn keepalive(&self) -> Result<(), TransportError> {
        self.sent.lock().await.push(Sent::Keepalive);
        Ok(())
    }
}

/// Site config used by the messenger in tests.
pub fn test_site() -> SiteConfig {
    toml::from_str(r#"base_url = "https://status.example.org/""#).expect("test site config")
}

/// Fresh in-memory store.
pub async fn test_db() -> Database {
    Database::new(":memory:")
        .await
        .expect("in-memory database")
}

/// Fully wired pipeline against an in-memory store and recording transport.
pub struct TestBot {
    pub db: Database,
    pub transport: Arc<RecordingTransport>,
    pub messenger: Arc<RegistrationMessenger>,
    pub handler: PresenceHandler,
}

#[allow(dead_code)]
pub async fn test_bot() -> TestBot {
    let db = test_db().await;
    let transport = RecordingTransport::new();
    let transport_dyn: Arc<dyn Transport> = transport.clone();
    let messenger = Arc::new(RegistrationMessenger::new(
        db.clone(),
        Arc::clone(&transport_dyn),
        test_site(),
    ));
    let handler = PresenceHandler::new(db.clone(), Arc::clone(&transport_dyn), Arc::clone(&messenger));
    TestBot {
        db,
        transport,
        messenger,
        handler,
    }
}
