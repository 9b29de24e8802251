//! Error types for hub-store.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading or writing the snapshot file failed.
    #[error("storage io error at {path}: {source}")]
    Io {
        /// The file or directory involved.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The snapshot could not be serialized or parsed.
    #[error("corrupt snapshot {path}: {source}")]
    Snapshot {
        /// The snapshot file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// A journal line other than the last one could not be parsed.
    #[error("corrupt journal {path} at line {line}: {source}")]
    Journal {
        /// The journal file.
        path: PathBuf,
        /// One-based line number.
        line: usize,
        /// The underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// A change could not be serialized for the journal.
    #[error("failed to serialize change: {0}")]
    Encode(#[source] serde_json::Error),
}
