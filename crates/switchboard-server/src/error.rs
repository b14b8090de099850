//! Error types for the Switchboard server.

use switchboard_store::StoreError;
use switchboard_stream::StreamError;

use crate::config::ConfigError;

/// Errors that can occur while running the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The persisted state could not be loaded or written.
    #[error("state error: {0}")]
    Store(#[from] StoreError),

    /// An operator stream failed.
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// The listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested listen address.
        addr: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The listener failed in a way that cannot be retried.
    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),
}
