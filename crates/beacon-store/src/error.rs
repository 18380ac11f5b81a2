//! Error types for beacon-store

use thiserror::Error;

/// Storage error type
#[derive(Debug, Error)]
pub enum Error {
    /// Record not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Execution not found
    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
