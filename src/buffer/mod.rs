//! Buffer Module
//!
//! Operations collected between two flushes.
//!
//! ## Responsibilities
//! - Keep at most one pending write per record (last writer wins)
//! - Group every pending read of a record behind one lookup
//! - Track the combined size for the high-water mark
//! - Carry the "flush already scheduled" latch
//!
//! A superseded write is dropped together with its callback; the callback is
//! never invoked.

mod table;

pub use table::OpBuffer;

use bytes::Bytes;

use crate::error::Result;
use crate::record::Record;

/// Completion callback of a write (set or delete)
pub type WriteCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Completion callback of a read
pub type ReadCallback<V> = Box<dyn FnOnce(Result<Record<V>>) + Send + 'static>;

/// What a pending write does to its record
#[derive(Debug, Clone, PartialEq)]
pub enum WriteAction {
    /// Store an encoded payload under a version
    Set { version: i64, payload: Bytes },

    /// Remove both halves of the record
    Delete,
}

/// A buffered write and the callback awaiting it
pub struct PendingWrite {
    pub action: WriteAction,
    pub callback: WriteCallback,
}

impl PendingWrite {
    pub fn new(action: WriteAction, callback: WriteCallback) -> Self {
        Self { action, callback }
    }
}

/// Every callback waiting on one record's lookup, in arrival order
pub struct PendingRead<V> {
    pub callbacks: Vec<ReadCallback<V>>,
}

impl<V> Default for PendingRead<V> {
    fn default() -> Self {
        Self {
            callbacks: Vec::new(),
        }
    }
}
