//! Connection Module
//!
//! Supervises one logical link to the backing store.
//!
//! ## Architecture
//! - One dispatch worker task per connection owns the store link
//! - Pipelines are queued to the worker over an unbounded channel, so
//!   queueing never blocks and batches run strictly in submission order
//! - State transitions are published on a `watch` channel
//!
//! ## States
//! ```text
//!  Connecting ──► Ready ◄──► Degraded
//!       │           │           │
//!       └───────────┴─────┬─────┘
//!                         ▼
//!                       Closed
//! ```
//! The ready latch is set on the first Ready transition and never cleared;
//! `when_ready` waits on the latch, not on the current state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};

use crate::config::ConnectionConfig;
use crate::error::{CacheError, Result};
use crate::store::{Connector, RespConnector, Store};

mod pipeline;
mod worker;

pub use pipeline::{CommandCallback, Pipeline};

pub(crate) use worker::Batch;

use worker::{Message, Worker};

/// Reconnect delay for connections opened without a config
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Observable state of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Link not established yet
    Connecting,

    /// Link up
    Ready,

    /// The link failed; carries the error message. Batches fail until the
    /// worker reconnects.
    Degraded(String),

    /// Closed on request; terminal
    Closed,
}

/// State shared between connection handles and the worker
pub(crate) struct Shared {
    state: watch::Sender<ConnectionState>,
    ready: AtomicBool,
}

impl Shared {
    fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            state,
            ready: AtomicBool::new(false),
        }
    }

    pub(crate) fn mark_ready(&self) {
        let first = !self.ready.swap(true, Ordering::SeqCst);
        self.state.send_replace(ConnectionState::Ready);
        if first {
            tracing::info!("Cache connection ready");
        } else {
            tracing::info!("Cache connection re-established");
        }
    }

    pub(crate) fn degrade(&self, err: &CacheError) {
        tracing::error!("Cache connection error: {}", err);
        self.state
            .send_replace(ConnectionState::Degraded(err.to_string()));
    }

    pub(crate) fn mark_closed(&self) {
        self.state.send_replace(ConnectionState::Closed);
        tracing::debug!("Cache connection closed");
    }
}

/// Handle to one supervised link
///
/// Cheap to clone; all clones share the same worker.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
    dispatch: mpsc::UnboundedSender<Message>,
    runtime: Handle,
}

impl Connection {
    /// Connect over RESP to the node or cluster in `config`
    pub fn connect(config: &ConnectionConfig) -> Result<Self> {
        Self::open_with(
            RespConnector::new(config.clone()),
            config.reconnect_delay(),
        )
    }

    /// Supervise links produced by any connector
    pub fn open(connector: impl Connector) -> Result<Self> {
        Self::open_with(connector, DEFAULT_RECONNECT_DELAY)
    }

    /// Wrap an already connected store
    pub fn with_store(store: Arc<dyn Store>) -> Result<Self> {
        Self::open(FixedConnector(store))
    }

    /// Supervise links produced by `connector`, retrying after `reconnect_delay`
    ///
    /// Must be called from within a tokio runtime.
    pub fn open_with(connector: impl Connector, reconnect_delay: Duration) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| {
            CacheError::Config("A connection must be created inside a tokio runtime".to_string())
        })?;

        let shared = Arc::new(Shared::new());
        let (dispatch, inbox) = mpsc::unbounded_channel();

        let worker = Worker::new(Box::new(connector), inbox, Arc::clone(&shared), reconnect_delay);
        runtime.spawn(worker.run());

        Ok(Self {
            shared,
            dispatch,
            runtime,
        })
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    /// True once the link has been ready at least once
    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::SeqCst)
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Resolve once the link has been ready
    ///
    /// Resolves immediately if it already has. Fails with `Closed` if the
    /// connection closes first.
    pub async fn when_ready(&self) -> Result<()> {
        let mut states = self.subscribe();
        let ready = &self.shared.ready;
        states
            .wait_for(|state| {
                ready.load(Ordering::SeqCst) || *state == ConnectionState::Closed
            })
            .await
            .map_err(|_| CacheError::Closed)?;

        if self.is_ready() {
            Ok(())
        } else {
            Err(CacheError::Closed)
        }
    }

    /// Gracefully end the link
    ///
    /// Batches already dispatched run first; the future resolves once the
    /// link has ended. Operations still buffered in an engine are not
    /// flushed. Calling it again is harmless.
    pub async fn close(&self) -> Result<()> {
        let mut states = self.subscribe();
        // Fails only if the worker is already gone
        let _ = self.dispatch.send(Message::Close);
        states
            .wait_for(|state| *state == ConnectionState::Closed)
            .await
            .map_err(|_| CacheError::Closed)?;
        Ok(())
    }

    /// Start a pipeline on this connection
    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(self.dispatch.clone(), self.runtime.clone())
    }
}

/// Hands out the same store every time
struct FixedConnector(Arc<dyn Store>);

impl Connector for FixedConnector {
    fn connect(&self) -> futures::future::BoxFuture<'_, Result<Arc<dyn Store>>> {
        let store = Arc::clone(&self.0);
        Box::pin(async move { Ok(store) })
    }
}
