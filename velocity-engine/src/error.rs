//! Error types for velocity engine

use thiserror::Error;

/// Velocity engine error
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid limit configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Program name not recognised by strict parsing
    #[error("Unknown program type: {0}")]
    UnknownProgram(String),
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;
