//! # CoalesceKV
//!
//! A write/read-coalescing front end for Redis-style key-value stores:
//! - Operations issued in the same scheduling window share one round trip
//! - Last writer wins per record within a window
//! - Repeated reads of a record share one lookup
//! - Versioned records with optional expiry
//! - Single node or hash-slot routed cluster
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Callers                              │
//! │          (set / get / delete / callbacks or futures)        │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                   CacheEngine                               │
//! │        (OpBuffer behind one Mutex, flush latch)             │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ one Pipeline per flush
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                   Connection                                │
//! │        (dispatch worker, state observable)                  │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┼────────────┐
//!          ▼            ▼            ▼
//!   ┌────────────┐ ┌──────────┐ ┌──────────────┐
//!   │ RespStore  │ │ Cluster  │ │ MemoryStore  │
//!   │  (RESP2)   │ │  Store   │ │ (in-process) │
//!   └────────────┘ └──────────┘ └──────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod codec;

pub mod protocol;
pub mod store;
pub mod connection;
pub mod record;
pub mod buffer;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{CacheError, Result};
pub use config::{CacheConfig, ClusterNode, ConnectionConfig, NodeAddress, Topology};
pub use codec::{BincodeCodec, Codec, JsonCodec, RawCodec};
pub use connection::{Connection, ConnectionState, Pipeline};
pub use record::{HeadBulk, Record, MISSING_VERSION};
pub use engine::{CacheEngine, EngineOptions};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of CoalesceKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
