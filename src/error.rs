//! Error types for fanout-fetch
//!
//! Fetch failures are modelled as [`Fault`](crate::fault::Fault) trees (see
//! [`crate::fault`]).
//! This module holds the crate-wide [`Error`] used for everything around a run:
//! loading configuration, building the HTTP client, persisting metrics.

use thiserror::Error;

/// Result type alias for fanout-fetch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for fanout-fetch
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "retry.max_attempts")
        key: Option<String>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client construction failed
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl Error {
    /// Build a configuration error for the given key
    pub fn config(key: &str, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }

    /// The configuration key this error refers to, if any
    pub fn config_key(&self) -> Option<&str> {
        match self {
            Error::Config { key, .. } => key.as_deref(),
            _ => None,
        }
    }
}
