//! Error types for beacon-relay

use thiserror::Error;

/// Relay error type
#[derive(Debug, Error)]
pub enum Error {
    /// Storage layer failure
    #[error("store error: {0}")]
    Store(#[from] beacon_store::Error),

    /// A stored payload was not valid JSON
    #[error("corrupt event payload: {0}")]
    CorruptPayload(#[from] serde_json::Error),

    /// The session actor is no longer running
    #[error("session actor unavailable")]
    SessionUnavailable,

    /// Anything else
    #[error("{0}")]
    Internal(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
