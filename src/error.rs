//! Error types for the computation value cache

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the computation value cache
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Persistent backend failure (open, read, write or commit)
    #[error("Storage error: {0}")]
    Storage(#[from] redb::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The storage environment still has open stores
    #[error("Storage environment still has {open_stores} open store(s)")]
    EnvironmentInUse { open_stores: usize },

    /// Write to a store after it was deleted
    #[error("Store {store} was deleted")]
    StoreDeleted { store: String },

    // =========================================================================
    // Serialization Errors
    // =========================================================================
    /// Malformed value or message bytes
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    Compression { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    Decompression { algorithm: String, reason: String },

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// No response arrived within the request timeout
    #[error("Request timed out after {after:?}")]
    Timeout { after: Duration },

    /// The connection dropped before a response arrived
    #[error("Connection closed")]
    ConnectionClosed,

    /// The server failed to process the request
    #[error("Remote cache error: {0}")]
    Remote(String),

    /// The server answered with the wrong response type
    #[error("Unexpected response: expected {expected}, got {actual}")]
    UnexpectedResponse {
        expected: &'static str,
        actual: String,
    },

    // =========================================================================
    // Front Cache Errors
    // =========================================================================
    /// The shared in-flight fetch for a key failed; every waiter sees this
    #[error("In-flight fetch failed: {0}")]
    Fetch(Arc<Error>),

    // =========================================================================
    // General Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap any engine-level error from the persistent backend.
    pub(crate) fn storage(err: impl Into<redb::Error>) -> Self {
        Error::Storage(err.into())
    }

    /// True for failures of the connection rather than of the request.
    pub fn is_transport(&self) -> bool {
        match self {
            Error::Timeout { .. } | Error::ConnectionClosed => true,
            Error::Fetch(inner) => inner.is_transport(),
            _ => false,
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Internal(format!("blocking storage task failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(Error::ConnectionClosed.is_transport());
        assert!(Error::Timeout {
            after: Duration::from_secs(1)
        }
        .is_transport());
        assert!(Error::Fetch(Arc::new(Error::ConnectionClosed)).is_transport());
        assert!(!Error::Remote("boom".into()).is_transport());
    }

    #[test]
    fn test_display() {
        let err = Error::UnexpectedResponse {
            expected: "Identifier",
            actual: "Stored".into(),
        };
        assert_eq!(
            err.to_string(),
            "Unexpected response: expected Identifier, got Stored"
        );
    }
}
