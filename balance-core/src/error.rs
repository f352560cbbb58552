//! Error types for the balance engine

use thiserror::Error;

/// Result type for balance operations
pub type Result<T> = std::result::Result<T, Error>;

/// Balance engine errors
#[derive(Error, Debug)]
pub enum Error {
    /// Unknown account or hold
    #[error("Not found: {0}")]
    NotFound(String),

    /// A hold already exists for this (account, transaction) key
    #[error("Duplicate hold: account {account_id}, transaction {transaction_id}")]
    DuplicateHold {
        /// Account the hold belongs to
        account_id: String,
        /// Transaction the hold reserves for
        transaction_id: String,
    },

    /// Durable store call failed (retried by the flusher, surfaced to readers)
    #[error("Transient store failure: {0}")]
    TransientStoreFailure(String),

    /// Cache backend unreachable (callers fall back to the durable store)
    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    /// Hold or final amount is not positive
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Limits / warnings evaluation error
    #[error("Velocity error: {0}")]
    Velocity(#[from] velocity_engine::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether a retry may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientStoreFailure(_) | Error::CacheUnavailable(_))
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::TransientStoreFailure(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::TransientStoreFailure(format!("serialization: {}", err))
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::CacheUnavailable(err.to_string())
    }
}
