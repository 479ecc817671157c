//! Errors of the scavenge map store.
//!
//! Backend failures are surfaced to the caller of the map operation; nothing here is retried.
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MapError {
    #[error("Key `{0}` already exists")]
    DuplicateKey(String),

    #[error("No transaction is in progress")]
    NoTransaction,

    #[error("A transaction is already in progress")]
    TransactionInProgress,

    #[error("Failed to decode `{0}`")]
    Codec(String),

    #[error("Backend error: {0}")]
    Backend(String),
}
