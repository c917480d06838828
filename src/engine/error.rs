//! Error types for the transcript engine
//!
//! Domain errors use thiserror; bootstrap and CLI code converts them through
//! anyhow at the boundary. Nothing in here is raised for stream content:
//! malformed frames and protocol inconsistencies are logged and skipped.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use super::slice::SessionId;

/// Top-level engine error
#[derive(Debug, Error)]
pub enum EngineError {
    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Transport-related errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The session has a stream in flight
    #[error("Session {0} is streaming")]
    Streaming(SessionId),
}

/// Storage-specific errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// Path not found
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    /// Atomic write failed
    #[error("Atomic write failed for {path}: {detail}")]
    AtomicWriteFailed {
        /// Path where write failed
        path: PathBuf,
        /// Error details
        detail: String,
    },

    /// Stored document could not be decoded
    #[error("Corrupt session document {path}: {detail}")]
    Corrupt {
        /// Document path
        path: PathBuf,
        /// Decoder message
        detail: String,
    },

    /// Stored document was written by an incompatible format version
    #[error("Unsupported session document version {found} (expected {expected})")]
    UnsupportedVersion {
        /// Version found on disk
        found: u32,
        /// Version this build writes
        expected: u32,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience result alias for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Transport-specific errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP client failure (connect, TLS, body read)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The service answered with a non-success status
    #[error("Unexpected status {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body excerpt
        body: String,
    },

    /// IO error (fixture files, sockets)
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The caller cancelled before the stream was established
    #[error("Cancelled before the stream opened")]
    Cancelled,
}

impl TransportError {
    /// Whether opening the stream again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Http(err) => err.is_connect() || err.is_timeout() || err.is_request(),
            TransportError::Status { status, .. } => *status >= 500 || *status == 429,
            TransportError::Io(_) => true,
            TransportError::Cancelled => false,
        }
    }
}

/// Convenience result alias for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_retryable() {
        let err = TransportError::Status {
            status: 503,
            body: String::new(),
        };
        assert!(err.is_retryable());

        let err = TransportError::Status {
            status: 404,
            body: "missing".into(),
        };
        assert!(!err.is_retryable());
        assert!(!TransportError::Cancelled.is_retryable());
    }
}
