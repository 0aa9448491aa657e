//! Unified error handling for mystatusd.
//!
//! Three caller-visible failure classes: validation (rejected before any
//! write), store (persistence failed, no retry), transport (outgoing send
//! failed, not retried here). Insert races on a unique key are recovered
//! inside the store's reconcile loop and never reach this level.

use crate::db::DbError;
use crate::transport::TransportError;
use axum::http::StatusCode;
use thiserror::Error;

/// Errors surfaced by the presence pipeline and web layer.
#[derive(Debug, Error)]
pub enum Error {
    #[error("validation failed on {field}: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },

    #[error("store error: {0}")]
    Store(#[from] DbError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl Error {
    /// Construct a validation error for a named field.
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    /// Get a static error code string for metrics labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Store(_) => "store",
            Self::Transport(_) => "transport",
        }
    }

    /// Map to an HTTP status for the web layer.
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Store(DbError::Conflict(_)) => StatusCode::CONFLICT,
            Self::Store(_) | Self::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
