//! Cluster routing
//!
//! Routes every key to the shard that owns its hash slot. Multi-key commands
//! are split per slot (a clustered server rejects cross-slot commands), the
//! per-shard batches run concurrently, and the partial replies are merged
//! back into one reply per original command.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};

use super::{Connector, Store};
use crate::error::{CacheError, Result};
use crate::protocol::{Command, Reply};

/// Number of hash slots in a cluster
pub const SLOT_COUNT: u16 = 16384;

/// Hash slot of a key, honoring `{tag}` hash tags
pub fn key_slot(key: &str) -> u16 {
    let bytes = key.as_bytes();
    let hashed = match bytes.iter().position(|&b| b == b'{') {
        Some(open) => match bytes[open + 1..].iter().position(|&b| b == b'}') {
            Some(len) if len > 0 => &bytes[open + 1..open + 1 + len],
            _ => bytes,
        },
        None => bytes,
    };
    crc16(hashed) % SLOT_COUNT
}

/// CRC16/XMODEM, the checksum cluster slots are defined on
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// An inclusive slot range served by one shard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
    pub shard: usize,
}

/// Where one piece of an original command went
#[derive(Debug, Clone, Copy)]
struct Part {
    shard: usize,
    index: usize,
}

/// How to rebuild one reply from its parts
enum Merge {
    Single(Part),
    /// MGET pieces scattered back to their key positions
    Gather { total: usize, parts: Vec<(Part, Vec<usize>)> },
    /// MSET pieces: OK unless one failed
    AllOk(Vec<Part>),
    /// DEL pieces: counts summed
    Sum(Vec<Part>),
    Failed(String),
}

/// Store that spreads keys over shards by hash slot
#[derive(Clone)]
pub struct ClusterStore {
    shards: Arc<Vec<Arc<dyn Store>>>,
    /// Owning shard of each slot
    slots: Arc<Vec<Option<usize>>>,
}

impl ClusterStore {
    /// Spread the slots evenly over the shards
    pub fn new(shards: Vec<Arc<dyn Store>>) -> Result<Self> {
        let count = shards.len();
        if count == 0 {
            return Err(CacheError::Config(
                "A cluster needs at least one shard".to_string(),
            ));
        }

        let ranges = (0..count)
            .map(|shard| SlotRange {
                start: (shard * SLOT_COUNT as usize / count) as u16,
                end: ((shard + 1) * SLOT_COUNT as usize / count - 1) as u16,
                shard,
            })
            .collect();

        Self::with_ranges(shards, ranges)
    }

    /// Use an explicit slot layout (as reported by `CLUSTER SLOTS`)
    ///
    /// Slots no range covers answer with a CLUSTERDOWN error.
    pub fn with_ranges(shards: Vec<Arc<dyn Store>>, ranges: Vec<SlotRange>) -> Result<Self> {
        if shards.is_empty() {
            return Err(CacheError::Config(
                "A cluster needs at least one shard".to_string(),
            ));
        }

        let mut slots = vec![None; SLOT_COUNT as usize];
        for range in ranges {
            if range.shard >= shards.len() || range.start > range.end || range.end >= SLOT_COUNT {
                return Err(CacheError::Config(format!(
                    "Invalid slot range {}-{} for shard {}",
                    range.start, range.end, range.shard
                )));
            }
            for slot in range.start..=range.end {
                slots[slot as usize] = Some(range.shard);
            }
        }

        Ok(Self {
            shards: Arc::new(shards),
            slots: Arc::new(slots),
        })
    }

    /// Number of shards
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard owning `key`, if its slot is served
    pub fn shard_for(&self, key: &str) -> Option<usize> {
        self.slots[key_slot(key) as usize]
    }

    /// Split one command into per-shard pieces
    fn plan(&self, command: Command, batches: &mut [Vec<Command>]) -> Merge {
        let mut push = |shard: usize, command: Command| {
            batches[shard].push(command);
            Part {
                shard,
                index: batches[shard].len() - 1,
            }
        };

        match command {
            Command::Get { .. } | Command::Set { .. } | Command::SetEx { .. } => {
                let key = command.keys()[0].to_string();
                match self.shard_for(&key) {
                    Some(shard) => Merge::Single(push(shard, command)),
                    None => Merge::Failed(unserved(&key)),
                }
            }
            Command::MGet { keys } => {
                let total = keys.len();
                let mut groups: BTreeMap<u16, (Vec<String>, Vec<usize>)> = BTreeMap::new();
                for (position, key) in keys.into_iter().enumerate() {
                    let group = groups.entry(key_slot(&key)).or_default();
                    group.0.push(key);
                    group.1.push(position);
                }

                let mut parts = Vec::with_capacity(groups.len());
                for (slot, (keys, positions)) in groups {
                    let shard = match self.slots[slot as usize] {
                        Some(shard) => shard,
                        None => return Merge::Failed(unserved(&keys[0])),
                    };
                    parts.push((push(shard, Command::MGet { keys }), positions));
                }
                Merge::Gather { total, parts }
            }
            Command::MSet { pairs } => {
                let mut groups: BTreeMap<u16, Vec<_>> = BTreeMap::new();
                for (key, value) in pairs {
                    groups.entry(key_slot(&key)).or_default().push((key, value));
                }

                let mut parts = Vec::with_capacity(groups.len());
                for (slot, pairs) in groups {
                    let shard = match self.slots[slot as usize] {
                        Some(shard) => shard,
                        None => return Merge::Failed(unserved(&pairs[0].0)),
                    };
                    parts.push(push(shard, Command::MSet { pairs }));
                }
                Merge::AllOk(parts)
            }
            Command::Del { keys } => {
                let mut groups: BTreeMap<u16, Vec<String>> = BTreeMap::new();
                for key in keys {
                    groups.entry(key_slot(&key)).or_default().push(key);
                }

                let mut parts = Vec::with_capacity(groups.len());
                for (slot, keys) in groups {
                    let shard = match self.slots[slot as usize] {
                        Some(shard) => shard,
                        None => return Merge::Failed(unserved(&keys[0])),
                    };
                    parts.push(push(shard, Command::Del { keys }));
                }
                Merge::Sum(parts)
            }
            // Keyless commands go to the first shard
            other => Merge::Single(push(0, other)),
        }
    }
}

fn unserved(key: &str) -> String {
    format!("CLUSTERDOWN Hash slot {} not served", key_slot(key))
}

fn reply_at(results: &[Result<Vec<Reply>>], part: Part) -> Reply {
    match &results[part.shard] {
        Ok(replies) => replies
            .get(part.index)
            .cloned()
            .unwrap_or_else(|| Reply::error("ERR shard returned too few replies")),
        Err(err) => Reply::Error(err.to_string()),
    }
}

fn merge(plan: Merge, results: &[Result<Vec<Reply>>]) -> Reply {
    match plan {
        Merge::Single(part) => reply_at(results, part),
        Merge::Failed(message) => Reply::Error(message),
        Merge::Gather { total, parts } => {
            let mut items = vec![Reply::nil(); total];
            for (part, positions) in parts {
                let values = match reply_at(results, part) {
                    Reply::Array(Some(values)) if values.len() == positions.len() => values,
                    Reply::Error(message) => return Reply::Error(message),
                    other => {
                        return Reply::Error(format!("ERR unexpected MGET reply {:?}", other))
                    }
                };
                for (value, position) in values.into_iter().zip(positions) {
                    items[position] = value;
                }
            }
            Reply::Array(Some(items))
        }
        Merge::AllOk(parts) => {
            for part in parts {
                if let Reply::Error(message) = reply_at(results, part) {
                    return Reply::Error(message);
                }
            }
            Reply::ok()
        }
        Merge::Sum(parts) => {
            let mut total = 0;
            for part in parts {
                match reply_at(results, part) {
                    Reply::Integer(n) => total += n,
                    Reply::Error(message) => return Reply::Error(message),
                    other => {
                        return Reply::Error(format!("ERR unexpected DEL reply {:?}", other))
                    }
                }
            }
            Reply::Integer(total)
        }
    }
}

impl Store for ClusterStore {
    fn execute(&self, commands: Vec<Command>) -> BoxFuture<'_, Result<Vec<Reply>>> {
        async move {
            let mut batches: Vec<Vec<Command>> = vec![Vec::new(); self.shards.len()];
            let plans: Vec<Merge> = commands
                .into_iter()
                .map(|command| self.plan(command, &mut batches))
                .collect();

            let used: Vec<bool> = batches.iter().map(|b| !b.is_empty()).collect();
            let results = future::join_all(batches.into_iter().enumerate().map(
                |(shard, batch)| async move {
                    if batch.is_empty() {
                        Ok(Vec::new())
                    } else {
                        self.shards[shard].execute(batch).await
                    }
                },
            ))
            .await;

            // Losing every shard that was involved is a lost link, not a
            // per-command failure
            let used_count = used.iter().filter(|u| **u).count();
            let failed: Vec<&CacheError> = results
                .iter()
                .zip(&used)
                .filter(|(_, used)| **used)
                .filter_map(|(result, _)| result.as_ref().err())
                .collect();
            if used_count > 0 && failed.len() == used_count {
                return Err(failed[0].clone());
            }

            Ok(plans.into_iter().map(|plan| merge(plan, &results)).collect())
        }
        .boxed()
    }

    fn quit(&self) -> BoxFuture<'_, Result<()>> {
        async move {
            let results = future::join_all(self.shards.iter().map(|shard| shard.quit())).await;
            results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
        }
        .boxed()
    }

    /// Losing any one master ends the whole link
    fn closed(&self) -> BoxFuture<'_, CacheError> {
        future::select_all(self.shards.iter().map(|shard| shard.closed()))
            .map(|(err, _, _)| err)
            .boxed()
    }
}

impl Connector for ClusterStore {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn Store>>> {
        let store: Arc<dyn Store> = Arc::new(self.clone());
        future::ready(Ok(store)).boxed()
    }
}
