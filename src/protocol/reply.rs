//! Reply definitions
//!
//! Represents one answer from the backing store.

use bytes::Bytes;

use crate::error::{CacheError, Result};

/// A reply to one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Simple status such as `OK` or `PONG`
    Status(String),

    /// The command failed; siblings in the same batch are unaffected
    Error(String),

    /// Integer reply (e.g. number of keys deleted)
    Integer(i64),

    /// Bulk value; `None` is the nil reply for a missing key
    Bulk(Option<Bytes>),

    /// Array reply; `None` is the nil array
    Array(Option<Vec<Reply>>),
}

impl Reply {
    /// Create an OK status reply
    pub fn ok() -> Self {
        Reply::Status("OK".to_string())
    }

    /// Create a nil bulk reply
    pub fn nil() -> Self {
        Reply::Bulk(None)
    }

    /// Create a bulk reply carrying a value
    pub fn bulk(value: impl Into<Bytes>) -> Self {
        Reply::Bulk(Some(value.into()))
    }

    /// Create an ERROR reply
    pub fn error(message: &str) -> Self {
        Reply::Error(message.to_string())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Turn an error reply into a per-command `CacheError::Command`
    pub fn into_result(self) -> Result<Reply> {
        match self {
            Reply::Error(message) => Err(CacheError::Command(message)),
            other => Ok(other),
        }
    }

    /// Elements of an array reply
    pub fn into_array(self) -> Result<Vec<Reply>> {
        match self {
            Reply::Array(Some(items)) => Ok(items),
            Reply::Array(None) => Ok(Vec::new()),
            Reply::Error(message) => Err(CacheError::Command(message)),
            other => Err(CacheError::Protocol(format!(
                "Expected array reply, got {:?}",
                other
            ))),
        }
    }

    /// Value of a bulk reply
    pub fn into_bulk(self) -> Result<Option<Bytes>> {
        match self {
            Reply::Bulk(value) => Ok(value),
            Reply::Error(message) => Err(CacheError::Command(message)),
            other => Err(CacheError::Protocol(format!(
                "Expected bulk reply, got {:?}",
                other
            ))),
        }
    }

    /// Value of an integer reply
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(n) => Some(*n),
            _ => None,
        }
    }
}
