//! Payload codecs
//!
//! The engine stores opaque bytes. A [`Codec`] turns the caller's value into
//! those bytes on `set` and back on `get`, so the coalescing core never
//! depends on a payload format.

use std::fmt;
use std::marker::PhantomData;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CacheError, Result};

/// Bytes in, bytes out contract for record payloads
pub trait Codec: Send + Sync + 'static {
    /// The caller-facing value type
    type Value: Clone + Send + 'static;

    /// Encode a value for storage
    fn encode(&self, value: &Self::Value) -> Result<Bytes>;

    /// Decode a stored payload
    fn decode(&self, bytes: &[u8]) -> Result<Self::Value>;
}

// =============================================================================
// JSON
// =============================================================================

/// Arbitrary JSON documents (the default codec)
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    type Value = serde_json::Value;

    fn encode(&self, value: &serde_json::Value) -> Result<Bytes> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value> {
        serde_json::from_slice(bytes).map_err(|e| CacheError::Decode(e.to_string()))
    }
}

// =============================================================================
// Bincode
// =============================================================================

/// Compact binary encoding of a typed value
pub struct BincodeCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for BincodeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for BincodeCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for BincodeCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BincodeCodec")
    }
}

impl<T> Codec for BincodeCodec<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + 'static,
{
    type Value = T;

    fn encode(&self, value: &T) -> Result<Bytes> {
        bincode::serialize(value)
            .map(Bytes::from)
            .map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        bincode::deserialize(bytes).map_err(|e| CacheError::Decode(e.to_string()))
    }
}

// =============================================================================
// Raw
// =============================================================================

/// Payloads are already bytes
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    type Value = Bytes;

    fn encode(&self, value: &Bytes) -> Result<Bytes> {
        Ok(value.clone())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(bytes))
    }
}
