//! Store Module
//!
//! The seam between the coalescing engine and the backing store's client.
//!
//! ## Responsibilities
//! - Execute a batch of commands as one round trip ([`Store::execute`])
//! - Answer with exactly one reply per command, in command order
//! - Report per-command failures as [`Reply::Error`] and reserve `Err` for
//!   failures of the whole round trip (lost link, protocol violation)
//! - Report a link lost while idle ([`Store::closed`])
//! - (Re)establish links on demand ([`Connector`])
//!
//! ## Implementations
//! - [`MemoryStore`]: in-process store with expiry, stats and fault injection
//! - [`RespStore`]: one TCP link speaking RESP2
//! - [`ClusterStore`]: hash-slot routing over any set of stores

use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};

use crate::error::{CacheError, Result};
use crate::protocol::{Command, Reply};

mod memory;
mod resp;
mod cluster;

pub use memory::{MemoryStore, StoreStats};
pub use resp::{RespConnector, RespStore};
pub use cluster::{key_slot, ClusterStore, SlotRange, SLOT_COUNT};

/// A connected backing store
pub trait Store: Send + Sync + 'static {
    /// Execute all commands in one round trip
    ///
    /// On success the returned vector has one reply per command, in order.
    fn execute(&self, commands: Vec<Command>) -> BoxFuture<'_, Result<Vec<Reply>>>;

    /// Gracefully end the link
    fn quit(&self) -> BoxFuture<'_, Result<()>>;

    /// Resolve with the cause once the link is lost
    ///
    /// Polled only while no batch is in flight, and dropped as soon as the
    /// next batch arrives. Stores with nothing to watch never resolve.
    fn closed(&self) -> BoxFuture<'_, CacheError> {
        future::pending().boxed()
    }
}

/// Produces connected stores for a connection's dispatch worker
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn Store>>>;
}
