//! Operation buffer implementation
//!
//! Two hash maps keyed by record name, the scheduling latch and the window
//! hold. Not synchronized; the engine keeps it behind its own mutex.

use std::collections::HashMap;

use super::{PendingRead, PendingWrite, ReadCallback};

/// Pending writes and reads awaiting the next flush
pub struct OpBuffer<V> {
    writes: HashMap<String, PendingWrite>,
    reads: HashMap<String, PendingRead<V>>,
    /// A flush is scheduled and has not run yet
    armed: bool,
    /// Sequence number of the open window, bumped by every `take`
    window: u64,
    /// An issuer of the open window has not awaited its results yet
    held: bool,
}

impl<V> OpBuffer<V> {
    pub fn new() -> Self {
        Self {
            writes: HashMap::new(),
            reads: HashMap::new(),
            armed: false,
            window: 0,
            held: false,
        }
    }

    /// Buffer a write, returning the write it superseded
    pub fn insert_write(&mut self, record_name: String, write: PendingWrite) -> Option<PendingWrite> {
        self.writes.insert(record_name, write)
    }

    /// True if a write is buffered for the record
    pub fn has_write(&self, record_name: &str) -> bool {
        self.writes.contains_key(record_name)
    }

    /// Add a read callback, returning how many now wait on the record
    pub fn push_read(&mut self, record_name: String, callback: ReadCallback<V>) -> usize {
        let pending = self.reads.entry(record_name).or_default();
        pending.callbacks.push(callback);
        pending.callbacks.len()
    }

    /// Number of buffered writes
    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    /// Number of records with buffered reads
    pub fn read_count(&self) -> usize {
        self.reads.len()
    }

    /// Combined size checked against the high-water mark
    pub fn len(&self) -> usize {
        self.writes.len() + self.reads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.reads.is_empty()
    }

    /// Set the latch; true if it was not already set
    pub fn arm(&mut self) -> bool {
        !std::mem::replace(&mut self.armed, true)
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Keep the open window from being flushed; returns its sequence number
    pub fn hold(&mut self) -> u64 {
        self.held = true;
        self.window
    }

    /// Let window `window` be flushed; false if it is gone or not held
    pub fn release(&mut self, window: u64) -> bool {
        if self.window != window || !self.held {
            return false;
        }
        self.held = false;
        true
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Sequence number of the open window
    pub fn window(&self) -> u64 {
        self.window
    }

    /// Take everything buffered, leaving both maps empty and opening a new
    /// window
    pub fn take(&mut self) -> (HashMap<String, PendingWrite>, HashMap<String, PendingRead<V>>) {
        self.window += 1;
        self.held = false;
        (
            std::mem::take(&mut self.writes),
            std::mem::take(&mut self.reads),
        )
    }
}

impl<V> Default for OpBuffer<V> {
    fn default() -> Self {
        Self::new()
    }
}
