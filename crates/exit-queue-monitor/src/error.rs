//! Error types for the exit-queue monitor.

use std::io;

use thiserror::Error;

/// Errors that can occur in the exit-queue monitor.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to load or validate configuration.
    #[error("config error: {0}")]
    Config(String),

    /// HTTP request failed (connection, timeout or body decoding).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status returned by the beacon node.
    #[error("beacon API error {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body.
        message: String,
    },

    /// Failed to parse response.
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// URL parsing failed.
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Database operation failed.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// A blocking database task panicked or was cancelled.
    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TOML parsing error.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml_edit::de::Error),
}

impl Error {
    /// Returns `true` for upstream failures that only cost the current tick.
    ///
    /// Anything else terminates the task that hit it.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Http(_) | Self::Api { .. } | Self::Parse(_))
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
