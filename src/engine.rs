//! Engine Module
//!
//! The coalescing front end that callers talk to.
//!
//! ## Responsibilities
//! - Buffer writes and reads issued within one scheduling window
//! - Collapse writes per record (last writer wins) and reads per record
//!   (one lookup answers every waiting caller)
//! - Flush each window as a single pipelined round trip
//! - Force a synchronous flush once the buffer passes the high-water mark
//!
//! ## Flush Cycle
//! ```text
//!   set / delete / get
//!          │
//!          ▼
//!   ┌─────────────┐   size > high-water mark   ┌─────────┐
//!   │  OpBuffer   │ ─────────────────────────► │  flush  │ (caller's context)
//!   │  (Mutex)    │                            └────┬────┘
//!   └──────┬──────┘                                 │
//!          │ latch not armed: arm + spawn           │
//!          ▼                                        ▼
//!   ┌─────────────┐                          ┌────────────┐
//!   │ flush task  │ ───────────────────────► │  Pipeline  │ ──► dispatch worker
//!   └─────────────┘                          └────────────┘
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch, Notify};

use crate::buffer::{OpBuffer, PendingRead, PendingWrite, WriteAction, WriteCallback};
use crate::codec::{Codec, JsonCodec};
use crate::config::{CacheConfig, DEFAULT_HIGH_WATER_MARK};
use crate::connection::{Connection, ConnectionState, Pipeline};
use crate::error::{CacheError, Result};
use crate::protocol::Reply;
use crate::record::{
    data_key, decode_heads, decode_record, version_key, HeadBulk, Record, MISSING_VERSION,
};

/// Longest a deferred flush waits for a held window to be released
const MAX_WINDOW_HOLD: Duration = Duration::from_millis(50);

/// Engine tuning taken from [`CacheConfig`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Expiry applied to both halves of every write, in seconds
    pub ttl: Option<u64>,

    /// Combined buffer size above which `schedule_flush` flushes inline
    pub high_water_mark: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            ttl: None,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

impl From<&CacheConfig> for EngineOptions {
    fn from(config: &CacheConfig) -> Self {
        Self {
            ttl: config.ttl,
            high_water_mark: config.high_water_mark,
        }
    }
}

/// Write/read-coalescing cache engine
///
/// Cheap to clone; clones share the buffers and the connection.
///
/// ## Concurrency Model
///
/// - Both buffers and the scheduling latch sit behind one mutex
/// - A flush drains and dispatches while holding it, so flush N always
///   reaches the dispatch worker before flush N+1
/// - Operations never block on I/O; results arrive through callbacks
///   (or the futures returned by [`fetch`](Self::fetch) and friends)
///
/// ## Windows
///
/// The deferred flush yields once before draining. Futures returned by
/// [`fetch`](Self::fetch), [`store`](Self::store) and
/// [`remove`](Self::remove) also hold their window open until one of them
/// is first polled or dropped, so everything a task issues before its next
/// `.await` shares one round trip even when the flush task runs on another
/// worker thread. A window is never held longer than 50ms.
pub struct CacheEngine<C: Codec = JsonCodec> {
    inner: Arc<EngineInner<C>>,
}

struct EngineInner<C: Codec> {
    connection: Connection,
    codec: Arc<C>,
    options: EngineOptions,

    /// Pending operations of the current window
    buffer: Mutex<OpBuffer<C::Value>>,

    /// Runtime that deferred flushes and callbacks are spawned on
    runtime: Handle,

    /// Non-empty flushes dispatched so far
    flushes: AtomicU64,

    /// Signalled when a held window is released
    window_released: Notify,
}

impl<C: Codec> Clone for CacheEngine<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl CacheEngine<JsonCodec> {
    /// Connect to the node or cluster in `config`, storing JSON documents
    ///
    /// Must be called from within a tokio runtime. Returns before the link is
    /// up; use [`when_ready`](Self::when_ready) to wait for it.
    pub fn connect(config: &CacheConfig) -> Result<Self> {
        Self::connect_with_codec(config, JsonCodec)
    }
}

impl<C: Codec> CacheEngine<C> {
    /// Connect to the node or cluster in `config` with a custom payload codec
    pub fn connect_with_codec(config: &CacheConfig, codec: C) -> Result<Self> {
        let connection = Connection::connect(&config.connection)?;
        Self::new(connection, codec, EngineOptions::from(config))
    }

    /// Build an engine over an existing connection
    pub fn new(connection: Connection, codec: C, options: EngineOptions) -> Result<Self> {
        if options.high_water_mark == 0 {
            return Err(CacheError::Config(
                "highWaterMark must be at least 1".to_string(),
            ));
        }
        let runtime = Handle::try_current().map_err(|_| {
            CacheError::Config("A cache engine must be created inside a tokio runtime".to_string())
        })?;

        Ok(Self {
            inner: Arc::new(EngineInner {
                connection,
                codec: Arc::new(codec),
                options,
                buffer: Mutex::new(OpBuffer::new()),
                runtime,
                flushes: AtomicU64::new(0),
                window_released: Notify::new(),
            }),
        })
    }

    // =========================================================================
    // Buffered Operations
    // =========================================================================

    /// Store `data` under `version`
    ///
    /// A later write to the same record in the same window replaces this
    /// one; the replaced callback is dropped without being called.
    pub fn set<F>(&self, record_name: &str, version: i64, data: &C::Value, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let payload = match self.inner.codec.encode(data) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::debug!("Failed to encode record {}: {}", record_name, err);
                self.defer(move || callback(Err(err)));
                return;
            }
        };

        self.buffer_write(
            record_name,
            WriteAction::Set { version, payload },
            Box::new(callback),
        );
    }

    /// Remove a record
    pub fn delete<F>(&self, record_name: &str, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.buffer_write(record_name, WriteAction::Delete, Box::new(callback));
    }

    /// Look a record up
    ///
    /// Every get of the same record in one window shares one lookup. Reads
    /// go to the store even when a write for the record is buffered.
    pub fn get<F>(&self, record_name: &str, callback: F)
    where
        F: FnOnce(Result<Record<C::Value>>) + Send + 'static,
    {
        {
            let mut buffer = self.inner.buffer.lock();
            if buffer.has_write(record_name) {
                tracing::debug!(
                    "Read of {} while a write for it is buffered; the read is not served from the buffer",
                    record_name
                );
            }
            if buffer.push_read(record_name.to_string(), Box::new(callback)) == 2 {
                tracing::warn!(
                    "MULTIPLE_CACHE_GETS: multiple cache gets for record {} in one flush window",
                    record_name
                );
            }
        }
        self.schedule_flush();
    }

    fn buffer_write(&self, record_name: &str, action: WriteAction, callback: WriteCallback) {
        {
            let mut buffer = self.inner.buffer.lock();
            let superseded =
                buffer.insert_write(record_name.to_string(), PendingWrite::new(action, callback));
            if superseded.is_some() {
                tracing::debug!("Write to {} supersedes a buffered write", record_name);
            }
        }
        self.schedule_flush();
    }

    // =========================================================================
    // Unbuffered Operations
    // =========================================================================

    /// Remove several records with one dedicated round trip
    ///
    /// Skips the buffer. The callback fires once, with the first error if
    /// any. An empty list succeeds without touching the store.
    pub fn delete_bulk<S, F>(&self, record_names: &[S], callback: F)
    where
        S: AsRef<str>,
        F: FnOnce(Result<()>) + Send + 'static,
    {
        if record_names.is_empty() {
            self.defer(move || callback(Ok(())));
            return;
        }

        let version_keys = record_names.iter().map(|n| version_key(n.as_ref())).collect();
        let data_keys = record_names.iter().map(|n| data_key(n.as_ref())).collect();

        let ack = Ack::new(2, Box::new(callback));
        let mut pipeline = self.inner.connection.pipeline();
        pipeline.del(version_keys, ack.part());
        pipeline.del(data_keys, ack.part());
        pipeline.execute();
    }

    /// Versions of several records, without their payloads
    pub fn head_bulk<S, F>(&self, record_names: &[S], callback: F)
    where
        S: AsRef<str>,
        F: FnOnce(Result<HeadBulk>) + Send + 'static,
    {
        if record_names.is_empty() {
            self.defer(move || callback(Ok(HeadBulk::default())));
            return;
        }

        let names: Vec<String> = record_names.iter().map(|n| n.as_ref().to_string()).collect();
        let keys = names.iter().map(|n| version_key(n)).collect();

        let mut pipeline = self.inner.connection.pipeline();
        pipeline.mget(keys, move |reply| callback(decode_heads(names, reply)));
        pipeline.execute();
    }

    /// Version of one record, or [`MISSING_VERSION`]
    pub fn head<F>(&self, record_name: &str, callback: F)
    where
        F: FnOnce(Result<i64>) + Send + 'static,
    {
        let name = record_name.to_string();
        self.head_bulk(&[record_name], move |heads| {
            callback(heads.map(|heads| {
                heads
                    .versions
                    .get(&name)
                    .copied()
                    .unwrap_or(MISSING_VERSION)
            }))
        });
    }

    // =========================================================================
    // Flushing
    // =========================================================================

    /// Make sure the buffered operations get flushed
    ///
    /// Flushes inline once the buffer passes the high-water mark; otherwise
    /// spawns at most one flush task per window.
    pub fn schedule_flush(&self) {
        let (flush_now, spawn) = {
            let mut buffer = self.inner.buffer.lock();
            if buffer.len() > self.inner.options.high_water_mark {
                (true, false)
            } else {
                (false, buffer.arm())
            }
        };

        if flush_now {
            tracing::trace!("High-water mark exceeded, flushing inline");
            self.flush();
        } else if spawn {
            let engine = self.clone();
            self.inner.runtime.spawn(async move { engine.deferred_flush().await });
        }
    }

    async fn deferred_flush(self) {
        // Let the issuing task finish its current step first
        tokio::task::yield_now().await;
        if tokio::time::timeout(MAX_WINDOW_HOLD, self.window_released())
            .await
            .is_err()
        {
            tracing::debug!("Window still held after {:?}, flushing anyway", MAX_WINDOW_HOLD);
        }
        self.flush();
    }

    /// Resolve once the open window is not held
    async fn window_released(&self) {
        loop {
            let released = self.inner.window_released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            if !self.inner.buffer.lock().is_held() {
                return;
            }
            released.await;
        }
    }

    fn hold_window(&self) -> WindowHold<C> {
        let window = self.inner.buffer.lock().hold();
        WindowHold {
            engine: self.clone(),
            window,
        }
    }

    fn release_window(&self, window: u64) {
        if self.inner.buffer.lock().release(window) {
            self.inner.window_released.notify_waiters();
        }
    }

    /// Send every buffered operation as one pipeline
    ///
    /// Does nothing when the buffer is empty.
    pub fn flush(&self) {
        let rejected = {
            let mut buffer = self.inner.buffer.lock();
            buffer.disarm();
            if buffer.is_empty() {
                return;
            }

            let (writes, reads) = buffer.take();
            tracing::trace!(
                "Flushing {} writes and {} reads",
                writes.len(),
                reads.len()
            );

            let mut pipeline = self.inner.connection.pipeline();
            for (record_name, write) in writes {
                self.queue_write(&mut pipeline, &record_name, write);
            }
            for (record_name, read) in reads {
                self.queue_read(&mut pipeline, record_name, read);
            }
            self.inner.flushes.fetch_add(1, Ordering::Relaxed);

            pipeline.submit().err()
        };

        if let Some(batch) = rejected {
            self.defer(move || batch.fail(&CacheError::Closed));
        }
    }

    fn queue_write(&self, pipeline: &mut Pipeline, record_name: &str, write: PendingWrite) {
        let PendingWrite { action, callback } = write;
        let version_key = version_key(record_name);
        let data_key = data_key(record_name);

        match action {
            WriteAction::Set { version, payload } => {
                let version = Bytes::from(version.to_string());
                match self.inner.options.ttl {
                    Some(ttl) => {
                        let ack = Ack::new(2, callback);
                        pipeline.setex(version_key, ttl, version, ack.part());
                        pipeline.setex(data_key, ttl, payload, ack.part());
                    }
                    None => {
                        pipeline.mset(vec![(version_key, version), (data_key, payload)], move |reply| {
                            callback(reply.map(|_| ()))
                        });
                    }
                }
            }
            WriteAction::Delete => {
                pipeline.del(vec![version_key, data_key], move |reply| {
                    callback(reply.map(|_| ()))
                });
            }
        }
    }

    fn queue_read(&self, pipeline: &mut Pipeline, record_name: String, read: PendingRead<C::Value>) {
        let keys = vec![version_key(&record_name), data_key(&record_name)];
        let codec = Arc::clone(&self.inner.codec);

        pipeline.mget(keys, move |reply| {
            let record = decode_record(codec.as_ref(), reply);
            if let Err(err) = &record {
                tracing::debug!("Read of {} failed: {}", record_name, err);
            }
            for callback in read.callbacks {
                callback(record.clone());
            }
        });
    }

    /// Run `f` on the runtime instead of the caller's stack
    fn defer<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.runtime.spawn(async move { f() });
    }

    // =========================================================================
    // Future-based API
    // =========================================================================

    /// [`get`](Self::get) as a future
    ///
    /// The read is buffered when this is called, not when the future is
    /// first polled.
    pub fn fetch(&self, record_name: &str) -> impl Future<Output = Result<Record<C::Value>>> + Send {
        let hold = self.hold_window();
        let (callback, completion) = completion();
        self.get(record_name, callback);
        hold.until_polled(completion)
    }

    /// [`set`](Self::set) as a future
    ///
    /// Resolves to `CacheError::Dropped` if a later write supersedes it.
    pub fn store(
        &self,
        record_name: &str,
        version: i64,
        data: &C::Value,
    ) -> impl Future<Output = Result<()>> + Send {
        let hold = self.hold_window();
        let (callback, completion) = completion();
        self.set(record_name, version, data, callback);
        hold.until_polled(completion)
    }

    /// [`delete`](Self::delete) as a future
    pub fn remove(&self, record_name: &str) -> impl Future<Output = Result<()>> + Send {
        let hold = self.hold_window();
        let (callback, completion) = completion();
        self.delete(record_name, callback);
        hold.until_polled(completion)
    }

    /// [`delete_bulk`](Self::delete_bulk) as a future
    pub fn remove_bulk<S: AsRef<str>>(&self, record_names: &[S]) -> impl Future<Output = Result<()>> + Send {
        let (callback, completion) = completion();
        self.delete_bulk(record_names, callback);
        completion
    }

    /// [`head`](Self::head) as a future
    pub fn version(&self, record_name: &str) -> impl Future<Output = Result<i64>> + Send {
        let (callback, completion) = completion();
        self.head(record_name, callback);
        completion
    }

    /// [`head_bulk`](Self::head_bulk) as a future
    pub fn versions<S: AsRef<str>>(&self, record_names: &[S]) -> impl Future<Output = Result<HeadBulk>> + Send {
        let (callback, completion) = completion();
        self.head_bulk(record_names, callback);
        completion
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Resolve once the connection has been ready
    pub async fn when_ready(&self) -> Result<()> {
        self.inner.connection.when_ready().await
    }

    /// Close the connection
    ///
    /// Already flushed operations complete first. Operations still buffered
    /// fail with `CacheError::Closed` when their flush runs.
    pub async fn close(&self) -> Result<()> {
        self.inner.connection.close().await
    }

    /// True once the connection has been ready
    pub fn is_ready(&self) -> bool {
        self.inner.connection.is_ready()
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Observe connection state transitions
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.subscribe()
    }

    /// Human-readable name and version
    pub fn description(&self) -> String {
        format!("Coalescing Cache Engine {}", crate::VERSION)
    }

    /// Operations waiting for the next flush (writes plus read keys)
    pub fn pending(&self) -> usize {
        self.inner.buffer.lock().len()
    }

    /// Non-empty flushes dispatched so far
    pub fn flush_count(&self) -> u64 {
        self.inner.flushes.load(Ordering::Relaxed)
    }

    pub fn options(&self) -> EngineOptions {
        self.inner.options
    }

    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }
}

/// A callback feeding a oneshot, and the future reading it
fn completion<T: Send + 'static>() -> (
    impl FnOnce(Result<T>) + Send + 'static,
    impl Future<Output = Result<T>> + Send,
) {
    let (tx, rx) = oneshot::channel();
    let callback = move |result: Result<T>| {
        let _ = tx.send(result);
    };
    let completion = async move { rx.await.unwrap_or(Err(CacheError::Dropped)) };
    (callback, completion)
}

/// Keeps one window from being flushed until released or dropped
struct WindowHold<C: Codec> {
    engine: CacheEngine<C>,
    window: u64,
}

impl<C: Codec> WindowHold<C> {
    /// Wrap `completion` so the hold ends on its first poll
    fn until_polled<T>(self, completion: impl Future<Output = T> + Send) -> impl Future<Output = T> + Send {
        async move {
            drop(self);
            completion.await
        }
    }
}

impl<C: Codec> Drop for WindowHold<C> {
    fn drop(&mut self) {
        self.engine.release_window(self.window);
    }
}

// =============================================================================
// Multi-part acknowledgement
// =============================================================================

/// Joins several command replies into one write callback
///
/// The callback fires when the last part completes, with the first error
/// any part reported.
struct Ack {
    state: Arc<Mutex<AckState>>,
}

struct AckState {
    remaining: usize,
    first_error: Option<CacheError>,
    callback: Option<WriteCallback>,
}

impl Ack {
    fn new(parts: usize, callback: WriteCallback) -> Self {
        Self {
            state: Arc::new(Mutex::new(AckState {
                remaining: parts,
                first_error: None,
                callback: Some(callback),
            })),
        }
    }

    fn part(&self) -> impl FnOnce(Result<Reply>) + Send + 'static {
        let state = Arc::clone(&self.state);
        move |reply| {
            let done = {
                let mut state = state.lock();
                if let Err(err) = reply {
                    state.first_error.get_or_insert(err);
                }
                state.remaining -= 1;
                if state.remaining == 0 {
                    state
                        .callback
                        .take()
                        .map(|callback| (callback, state.first_error.take()))
                } else {
                    None
                }
            };

            if let Some((callback, first_error)) = done {
                callback(match first_error {
                    Some(err) => Err(err),
                    None => Ok(()),
                });
            }
        }
    }
}
