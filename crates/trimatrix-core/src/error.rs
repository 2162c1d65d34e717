use thiserror::Error;

/// Node-wide error types for the Trimatrix protocol.
#[derive(Debug, Error)]
pub enum MatrixError {
    /// Operation attempted before the startup load completed.
    #[error("Matrix store not initialized")]
    NotInitialized,

    /// Malformed triad data, creator id, validator id, or triad id.
    /// Rejected synchronously, never retried.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Unknown triad id.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Storage layer error (RocksDB read/write/iteration).
    #[error("Storage error: {0}")]
    Storage(String),

    /// Transport-level network error (broken connection, timeout).
    #[error("Network error: {0}")]
    Network(String),

    /// Protocol-level peer error (malformed or unknown message).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The ledger collaborator is not accepting new writers.
    #[error("Ledger writer unavailable")]
    WriterUnavailable,

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid state transition or configuration.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl From<serde_json::Error> for MatrixError {
    fn from(e: serde_json::Error) -> Self {
        MatrixError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for MatrixError {
    fn from(e: std::io::Error) -> Self {
        MatrixError::Network(e.to_string())
    }
}
