//! Error types for coalescekv
//!
//! Provides a unified error type for all operations. The type is `Clone`
//! because a single failure (a lost connection, a bad stored value) is fanned
//! out to every caller waiting on the affected batch or key.

use thiserror::Error;

/// Result type alias using CacheError
pub type Result<T> = std::result::Result<T, CacheError>;

/// Unified error type for coalescekv operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    /// Invalid or missing connection parameters. Raised at construction only.
    #[error("Configuration error: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Connection Errors
    // -------------------------------------------------------------------------
    /// The link to the backing store failed or is not established.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The connection has been closed; nothing more will be dispatched.
    #[error("Connection closed")]
    Closed,

    // -------------------------------------------------------------------------
    // Command Errors
    // -------------------------------------------------------------------------
    /// The backing store rejected one command of a batch.
    #[error("Command error: {0}")]
    Command(String),

    /// The store answered with bytes that do not follow the wire format.
    #[error("Protocol error: {0}")]
    Protocol(String),

    // -------------------------------------------------------------------------
    // Payload Errors
    // -------------------------------------------------------------------------
    /// A stored record could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// A payload could not be encoded before buffering.
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Delivery Errors
    // -------------------------------------------------------------------------
    /// The operation's completion was dropped before it fired: the write was
    /// superseded inside its buffering window, or the connection closed with
    /// the operation still buffered.
    #[error("Operation dropped before completion")]
    Dropped,
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Connection(err.to_string())
    }
}

impl CacheError {
    /// True for failures of the link itself rather than of one command.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, CacheError::Connection(_) | CacheError::Closed)
    }
}
