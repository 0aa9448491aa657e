//! Transport capability consumed by the presence pipeline.
//!
//! The daemon does not implement the federated wire protocol; it consumes a
//! capability that emits [`Event`]s and accepts outgoing operations. The
//! capability is injected into the handler as a trait object, so tests can
//! substitute a recording double instead of hitting a network.

pub mod bridge;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Inbound events delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Event {
    /// A chat message from a contact. Bodyless frames are protocol control
    /// traffic, not user content.
    ChatMessage {
        sender: String,
        #[serde(default)]
        body: Option<String>,
    },
    /// A contact's availability changed.
    Presence {
        sender: String,
        available: bool,
        #[serde(default)]
        state: Option<String>,
        #[serde(default)]
        status_text: Option<String>,
    },
    /// A contact asked to subscribe to the bot's presence.
    SubscriptionRequest { sender: String },
    /// The contact's client reported its supported feature identifiers.
    CapabilityReport {
        sender: String,
        #[serde(default)]
        features: Vec<String>,
    },
    /// An error frame from the transport.
    Error { detail: String },
}

impl Event {
    /// The raw sender address this event concerns, if any.
    pub fn sender(&self) -> Option<&str> {
        match self {
            Self::ChatMessage { sender, .. }
            | Self::Presence { sender, .. }
            | Self::SubscriptionRequest { sender }
            | Self::CapabilityReport { sender, .. } => Some(sender),
            Self::Error { .. } => None,
        }
    }

    /// Event kind for logging and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ChatMessage { .. } => "chat_message",
            Self::Presence { .. } => "presence",
            Self::SubscriptionRequest { .. } => "subscription_request",
            Self::CapabilityReport { .. } => "capability_report",
            Self::Error { .. } => "error",
        }
    }
}

/// Outgoing operations accepted by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Outgoing {
    Message { to: String, body: String },
    AcceptSubscription { to: String },
    RequestSubscription { to: String },
    Keepalive,
}

/// Transport delivery errors. Logged by callers, never retried here.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport connection closed")]
    Closed,
    #[error("gateway i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("gateway codec error: {0}")]
    Codec(String),
}

/// Outgoing side of the transport capability.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a chat message to a contact.
    async fn send_message(&self, to: &str, body: &str) -> Result<(), TransportError>;

    /// Accept a pending subscription request from a contact.
    async fn accept_subscription(&self, to: &str) -> Result<(), TransportError>;

    /// Ask a contact for a reciprocal presence subscription.
    async fn request_subscription(&self, to: &str) -> Result<(), TransportError>;

    /// Periodic liveness no-op keeping the underlying connection alive.
    async fn keepalive(&self) -> Result<(), TransportError>;
}
