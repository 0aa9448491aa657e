//! mystatusd - MyStatus presence daemon.
//!
//! Tracks contacts' presence on a federated chat network and exposes it as a
//! JSON status feed. The pipeline: the transport gateway delivers an event,
//! the presence handler classifies it, reads/writes the account store, and
//! may send replies or registration links back through the transport.

pub mod address;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod http;
pub mod metrics;
pub mod registration;
pub mod transport;
