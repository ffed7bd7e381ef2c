//! Steep Error Types

use thiserror::Error;

use crate::model::{InitState, Lsn};

/// Result type alias for steep-repl operations
pub type Result<T> = std::result::Result<T, Error>;

/// steep-repl error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Control errors
    #[error("Invalid state: cannot {action} node {node} while {state}")]
    InvalidState {
        node: String,
        state: InitState,
        action: &'static str,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    // Transient I/O (chunk level, retried)
    #[error("Transient I/O error: {0}")]
    Transient(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    // Per-table integrity
    #[error("Checksum mismatch for table {table}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        table: String,
        expected: String,
        actual: String,
    },

    // Session-wide structural failures
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Sequence error: {0}")]
    Sequences(String),

    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    // Divergence
    #[error("Required history unavailable: need WAL from {required}, oldest retained is {oldest}")]
    HistoryUnavailable { required: Lsn, oldest: Lsn },

    // Backends
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("State store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Decompression failed: {0}")]
    Decompress(#[from] lz4_flex::block::DecompressError),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable at the chunk level
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transient(_) | Error::Timeout(_) => true,
            Error::Database(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut
            ),
            Error::Io(_) => true,
            _ => false,
        }
    }

    /// Check if this error means the source can no longer reconcile the target
    pub fn is_divergence(&self) -> bool {
        matches!(self, Error::HistoryUnavailable { .. })
    }

    /// Check if this error is an operator cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(Error::Transient("reset by peer".into()).is_retryable());
        assert!(Error::Timeout("chunk 3".into()).is_retryable());
        assert!(!Error::Schema("bad ddl".into()).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn test_divergence_is_distinct() {
        let err = Error::HistoryUnavailable {
            required: Lsn(0x100),
            oldest: Lsn(0x200),
        };
        assert!(err.is_divergence());
        assert!(!err.is_retryable());
        assert!(!Error::SourceUnavailable("down".into()).is_divergence());
    }

    #[test]
    fn test_invalid_state_message() {
        let err = Error::InvalidState {
            node: "replica-1".into(),
            state: InitState::Copying,
            action: "start",
        };
        assert_eq!(
            err.to_string(),
            "Invalid state: cannot start node replica-1 while copying"
        );
    }
}
