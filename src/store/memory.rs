//! In-process store
//!
//! A HashMap-backed store that executes batches under one write lock, so a
//! batch is atomic relative to other batches. Expiry uses tokio's clock,
//! which lets tests pause and advance time.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Connector, Store};
use crate::error::{CacheError, Result};
use crate::protocol::{Command, CommandType, Reply};

/// One stored value
#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Counters describing the traffic a store has seen
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of `execute` calls (round trips)
    pub batches: u64,

    /// Commands executed, by type
    pub commands: HashMap<CommandType, u64>,

    /// Times each key was read by GET or MGET
    pub key_reads: HashMap<String, u64>,
}

impl StoreStats {
    pub fn commands_of(&self, command_type: CommandType) -> u64 {
        self.commands.get(&command_type).copied().unwrap_or(0)
    }

    pub fn reads_of(&self, key: &str) -> u64 {
        self.key_reads.get(key).copied().unwrap_or(0)
    }
}

#[derive(Default)]
struct MemoryInner {
    data: RwLock<HashMap<String, Entry>>,
    stats: Mutex<StoreStats>,
    failing_keys: Mutex<HashMap<String, String>>,
    offline: AtomicBool,
    /// Wakes idle links when the store goes offline
    went_offline: Notify,
}

/// In-process backing store
///
/// Clones share the same data, so a test can keep a handle for inspection
/// while a connection owns another.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Fault injection
    // =========================================================================

    /// Make every command touching `key` fail with `message`
    pub fn fail_key(&self, key: impl Into<String>, message: impl Into<String>) {
        self.inner
            .failing_keys
            .lock()
            .insert(key.into(), message.into());
    }

    /// Stop failing commands on `key`
    pub fn heal_key(&self, key: &str) {
        self.inner.failing_keys.lock().remove(key);
    }

    /// While offline, connects and round trips fail as a lost link would
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
        if offline {
            self.inner.went_offline.notify_waiters();
        }
    }

    pub fn is_offline(&self) -> bool {
        self.inner.offline.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Snapshot of the traffic counters
    pub fn stats(&self) -> StoreStats {
        self.inner.stats.lock().clone()
    }

    /// Zero the traffic counters
    pub fn reset_stats(&self) {
        *self.inner.stats.lock() = StoreStats::default();
    }

    /// Raw value of a key, if present and not expired
    pub fn raw_get(&self, key: &str) -> Option<Bytes> {
        let now = Instant::now();
        self.inner
            .data
            .read()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
    }

    /// Remaining time to live of a key
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.inner
            .data
            .read()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .and_then(|entry| entry.expires_at)
            .map(|at| at - now)
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .data
            .read()
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Execute a batch synchronously
    ///
    /// Used by `Store::execute` and by in-test servers that front this store.
    pub fn apply(&self, commands: Vec<Command>) -> Result<Vec<Reply>> {
        if self.is_offline() {
            return Err(CacheError::Connection("store offline".to_string()));
        }

        let now = Instant::now();
        let failing = self.inner.failing_keys.lock().clone();
        let mut data = self.inner.data.write();
        let mut replies = Vec::with_capacity(commands.len());

        {
            let mut stats = self.inner.stats.lock();
            stats.batches += 1;
            for command in &commands {
                *stats.commands.entry(command.command_type()).or_insert(0) += 1;
                if matches!(command, Command::Get { .. } | Command::MGet { .. }) {
                    for key in command.keys() {
                        *stats.key_reads.entry(key.to_string()).or_insert(0) += 1;
                    }
                }
            }
        }

        for command in commands {
            if let Some(message) = command.keys().iter().find_map(|k| failing.get(*k)) {
                replies.push(Reply::error(message));
                continue;
            }
            replies.push(apply_one(&mut data, command, now));
        }

        Ok(replies)
    }
}

fn lookup(data: &mut HashMap<String, Entry>, key: &str, now: Instant) -> Option<Bytes> {
    let expired = match data.get(key) {
        Some(entry) if entry.is_live(now) => return Some(entry.value.clone()),
        Some(_) => true,
        None => false,
    };
    if expired {
        // Lazily purge expired entries
        data.remove(key);
    }
    None
}

fn apply_one(data: &mut HashMap<String, Entry>, command: Command, now: Instant) -> Reply {
    match command {
        Command::Get { key } => Reply::Bulk(lookup(data, &key, now)),
        Command::MGet { keys } => Reply::Array(Some(
            keys.iter()
                .map(|key| Reply::Bulk(lookup(data, key, now)))
                .collect(),
        )),
        Command::Set { key, value } => {
            data.insert(
                key,
                Entry {
                    value,
                    expires_at: None,
                },
            );
            Reply::ok()
        }
        Command::SetEx { key, ttl, value } => {
            if ttl == 0 {
                return Reply::error("ERR invalid expire time in 'setex' command");
            }
            data.insert(
                key,
                Entry {
                    value,
                    expires_at: Some(now + Duration::from_secs(ttl)),
                },
            );
            Reply::ok()
        }
        Command::MSet { pairs } => {
            for (key, value) in pairs {
                data.insert(
                    key,
                    Entry {
                        value,
                        expires_at: None,
                    },
                );
            }
            Reply::ok()
        }
        Command::Del { keys } => {
            let unique: HashSet<String> = keys.into_iter().collect();
            let mut removed = 0;
            for key in unique {
                if lookup(data, &key, now).is_some() {
                    data.remove(&key);
                    removed += 1;
                }
            }
            Reply::Integer(removed)
        }
        Command::Auth { .. } | Command::Select { .. } | Command::Quit => Reply::ok(),
        Command::Ping => Reply::Status("PONG".to_string()),
        Command::ClusterSlots => {
            Reply::error("ERR This instance has cluster support disabled")
        }
    }
}

impl Store for MemoryStore {
    fn execute(&self, commands: Vec<Command>) -> BoxFuture<'_, Result<Vec<Reply>>> {
        future::ready(self.apply(commands)).boxed()
    }

    fn quit(&self) -> BoxFuture<'_, Result<()>> {
        future::ready(Ok(())).boxed()
    }

    fn closed(&self) -> BoxFuture<'_, CacheError> {
        async move {
            loop {
                let went_offline = self.inner.went_offline.notified();
                tokio::pin!(went_offline);
                went_offline.as_mut().enable();
                if self.is_offline() {
                    return CacheError::Connection("store offline".to_string());
                }
                went_offline.await;
            }
        }
        .boxed()
    }
}

impl Connector for MemoryStore {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn Store>>> {
        let result: Result<Arc<dyn Store>> = if self.is_offline() {
            Err(CacheError::Connection("store offline".to_string()))
        } else {
            Ok(Arc::new(self.clone()))
        };
        future::ready(result).boxed()
    }
}
