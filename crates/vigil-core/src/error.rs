//! Error types for the Vigil moderation core.

use thiserror::Error;

/// Result type alias for core operations.
pub type VigilResult<T> = Result<T, VigilError>;

/// Errors that can occur inside the moderation core.
///
/// None of these are fatal to the process: component boundaries (bus dispatch,
/// join batches, classification) log them and treat the signal as absent.
#[derive(Error, Debug)]
pub enum VigilError {
    #[error("unknown rule category: {0}")]
    UnknownCategory(String),

    #[error("invalid pattern in {category}: {reason}")]
    InvalidPattern { category: String, reason: String },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("invalid bus key: {0}")]
    InvalidKey(String),

    #[error("invalid payload for {route}: {reason}")]
    Payload { route: String, reason: String },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<sled::Error> for VigilError {
    fn from(err: sled::Error) -> Self {
        VigilError::Persistence(err.to_string())
    }
}

impl From<config::ConfigError> for VigilError {
    fn from(err: config::ConfigError) -> Self {
        VigilError::Config(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for VigilError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        VigilError::LockPoisoned(err.to_string())
    }
}

/// Failures reported by the external transport collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("send failed: {0}")]
    Send(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("lookup failed: {0}")]
    Lookup(String),

    #[error("not supported by this transport: {0}")]
    Unsupported(&'static str),
}
