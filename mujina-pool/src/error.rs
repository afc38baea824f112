//! Common error types for mujina-pool.
//!
//! This module provides a centralized Error enum using thiserror,
//! with conversions from underlying error types used throughout the crate.
//! Subsystems with errors callers need to match on (share rejections, store
//! failures) define their own enums next to the code that raises them.

use thiserror::Error;

/// Main error type for mujina-pool operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Upstream (job source) errors
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Share store errors
    #[error("Store error: {0}")]
    Store(String),

    /// Generic errors for development
    #[error("{0}")]
    Other(String),
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
