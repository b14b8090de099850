//! Error types for the document store.
//!
//! All errors are propagated via [`StoreError`], which keeps the path of the
//! backing file alongside the underlying I/O or JSON failure.

use std::path::PathBuf;

/// Errors that can occur while loading or persisting a document.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing file exists but could not be read.
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        /// Backing file path.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The backing file does not hold a valid document.
    #[error("failed to decode {}: {source}", .path.display())]
    Decode {
        /// Backing file path.
        path: PathBuf,
        /// The underlying JSON error.
        source: serde_json::Error,
    },

    /// The in-memory document could not be serialized.
    #[error("failed to encode document: {0}")]
    Encode(#[from] serde_json::Error),

    /// Writing or replacing the backing file failed.
    #[error("failed to write {}: {source}", .path.display())]
    Write {
        /// Backing file path.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The blocking write task panicked or was cancelled.
    #[error("write task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// The store runs purely in memory.
    #[error("no backing file configured")]
    NoFile,
}
