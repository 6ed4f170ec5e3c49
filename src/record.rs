//! Record representation
//!
//! Each record is stored as two sibling keys sharing one expiry:
//!
//! ```text
//! <name>_v   decimal version
//! <name>_d   codec payload
//! ```
//!
//! Both halves are always written, read and deleted by the same command or
//! the same batch.

use std::collections::HashMap;

use crate::codec::Codec;
use crate::error::{CacheError, Result};
use crate::protocol::Reply;

/// Version reported for a record that does not exist
pub const MISSING_VERSION: i64 = -1;

const VERSION_SUFFIX: &str = "_v";
const DATA_SUFFIX: &str = "_d";

/// Key holding a record's version
pub fn version_key(record_name: &str) -> String {
    format!("{}{}", record_name, VERSION_SUFFIX)
}

/// Key holding a record's payload
pub fn data_key(record_name: &str) -> String {
    format!("{}{}", record_name, DATA_SUFFIX)
}

/// The outcome of a read
#[derive(Debug, Clone, PartialEq)]
pub struct Record<V> {
    /// Stored version, or [`MISSING_VERSION`]
    pub version: i64,

    /// Stored payload; `None` when the record is missing
    pub data: Option<V>,
}

impl<V> Record<V> {
    pub fn new(version: i64, data: V) -> Self {
        Self {
            version,
            data: Some(data),
        }
    }

    /// The "not found" outcome
    pub fn missing() -> Self {
        Self {
            version: MISSING_VERSION,
            data: None,
        }
    }

    pub fn is_missing(&self) -> bool {
        self.version == MISSING_VERSION && self.data.is_none()
    }
}

/// Versions of several records, looked up without their payloads
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeadBulk {
    /// Version of each record that exists
    pub versions: HashMap<String, i64>,

    /// Records that do not exist, in request order
    pub missing: Vec<String>,
}

pub(crate) fn parse_version(raw: &[u8]) -> Result<i64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| {
            CacheError::Decode(format!(
                "Invalid record version {:?}",
                String::from_utf8_lossy(raw)
            ))
        })
}

/// Turn the reply to `MGET <name>_v <name>_d` into a record
pub(crate) fn decode_record<C: Codec>(codec: &C, reply: Result<Reply>) -> Result<Record<C::Value>> {
    let mut halves = reply?.into_array()?.into_iter();
    let version = halves.next().map(Reply::into_bulk).transpose()?.flatten();
    let data = halves.next().map(Reply::into_bulk).transpose()?.flatten();

    let version = match version {
        Some(raw) => parse_version(&raw)?,
        None => return Ok(Record::missing()),
    };
    let data = data.ok_or_else(|| {
        CacheError::Decode(format!("Record at version {} has no payload", version))
    })?;

    Ok(Record::new(version, codec.decode(&data)?))
}

/// Turn the reply to `MGET <name>_v ...` into versions and misses
pub(crate) fn decode_heads(record_names: Vec<String>, reply: Result<Reply>) -> Result<HeadBulk> {
    let versions = reply?.into_array()?;
    if versions.len() != record_names.len() {
        return Err(CacheError::Protocol(format!(
            "Expected {} versions, got {}",
            record_names.len(),
            versions.len()
        )));
    }

    let mut heads = HeadBulk::default();
    for (name, version) in record_names.into_iter().zip(versions) {
        match version.into_bulk()? {
            Some(raw) => {
                heads.versions.insert(name, parse_version(&raw)?);
            }
            None => heads.missing.push(name),
        }
    }
    Ok(heads)
}
