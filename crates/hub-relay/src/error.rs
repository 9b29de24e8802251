//! Error types for hub-relay.

use std::time::Duration;

use hub_proto::{CodecError, PeerRole};
use hub_store::StoreError;
use thiserror::Error;

/// Errors from the worker pool.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The queue stayed full for the whole submission timeout.
    #[error("worker pool saturated: queue still full after {timeout:?}")]
    Saturated {
        /// How long the submitter waited.
        timeout: Duration,
    },

    /// The pool has been shut down.
    #[error("worker pool is shut down")]
    Closed,

    /// The pool configuration is unusable.
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}

/// Errors that can occur in relay operations.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Two configured names resolved to the same address within one role.
    #[error("{role} peers {first:?} and {second:?} both resolve to {address}")]
    DuplicatePeer {
        /// The role both entries were configured under.
        role: PeerRole,
        /// The shared resolved address.
        address: String,
        /// The entry resolved first.
        first: String,
        /// The conflicting entry.
        second: String,
    },

    /// A listening or outbound socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address that could not be bound.
        addr: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// A storage call on the blocking pool panicked or was cancelled.
    #[error("storage call did not complete: {0}")]
    Blocking(String),

    /// Worker pool error.
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    /// The dispatcher task died without returning.
    #[error("dispatcher failed: {0}")]
    Dispatcher(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saturated_display_includes_timeout() {
        let err = PoolError::Saturated {
            timeout: Duration::from_secs(32),
        };
        assert!(err.to_string().contains("32s"));
    }

    #[test]
    fn test_duplicate_peer_display() {
        let err = RelayError::DuplicatePeer {
            role: PeerRole::Source,
            address: "10.0.0.1".to_string(),
            first: "a.example".to_string(),
            second: "b.example".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("source"));
        assert!(msg.contains("10.0.0.1"));
        assert!(msg.contains("a.example"));
        assert!(msg.contains("b.example"));
    }

    #[test]
    fn test_pool_error_converts() {
        let err: RelayError = PoolError::Closed.into();
        assert!(err.to_string().contains("shut down"));
    }
}
