//! Error types for the coordination engine

use thiserror::Error;

/// Coordination error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Cluster API error: {0}")]
    Cluster(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Malformed message on {channel}: {reason}")]
    MalformedMessage { channel: String, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl From<podroute_core::Error> for Error {
    fn from(e: podroute_core::Error) -> Self {
        match e {
            podroute_core::Error::Configuration(msg) => Self::Configuration(msg),
            other => Self::Serialization(other.to_string()),
        }
    }
}

/// Result type for coordination operations
pub type Result<T> = std::result::Result<T, Error>;
