//! Error types for the shipway state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    /// Table open, read, or write failure inside a transaction.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("failed to encode record: {0}")]
    Encode(String),

    #[error("failed to decode record {key}: {reason}")]
    Decode { key: String, reason: String },

    #[error("deployment not found: {0}")]
    NotFound(String),
}
