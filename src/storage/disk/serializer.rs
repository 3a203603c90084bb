//! Value serializers for the disk cache
//!
//! The storage core only sees bytes. A region is handed an
//! [`ElementSerializer`] to turn values into payloads and back.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::marker::PhantomData;

/// Converts cached values to and from record payloads
pub trait ElementSerializer<V>: Send + Sync {
    fn serialize(&self, value: &V) -> Result<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8]) -> Result<V>;
}

/// JSON payloads via serde_json
pub struct JsonSerializer<V> {
    _marker: PhantomData<fn() -> V>,
}

impl<V> JsonSerializer<V> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<V> Default for JsonSerializer<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Serialize + DeserializeOwned> ElementSerializer<V> for JsonSerializer<V> {
    fn serialize(&self, value: &V) -> Result<Vec<u8>> {
        serde_json::to_vec(value)
            .map_err(|e| Error::SerializationError(format!("Failed to serialize value: {}", e)))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<V> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::SerializationError(format!("Failed to deserialize value: {}", e)))
    }
}

/// Wraps another serializer and zstd-compresses its output
pub struct CompressingSerializer<S> {
    inner: S,
    level: i32,
}

impl<S> CompressingSerializer<S> {
    /// Compression level 3, zstd's default
    pub fn new(inner: S) -> Self {
        Self::with_level(inner, 3)
    }

    pub fn with_level(inner: S, level: i32) -> Self {
        Self { inner, level }
    }
}

impl<V, S: ElementSerializer<V>> ElementSerializer<V> for CompressingSerializer<S> {
    fn serialize(&self, value: &V) -> Result<Vec<u8>> {
        let raw = self.inner.serialize(value)?;
        compress(&raw, self.level)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<V> {
        let raw = decompress(bytes)?;
        self.inner.deserialize(&raw)
    }
}

/// Compress a buffer with zstd
pub fn compress(data: &[u8], level: i32) -> Result<Vec<u8>> {
    let mut encoder = zstd::Encoder::new(Vec::new(), level)
        .map_err(|e| Error::SerializationError(format!("Failed to create zstd encoder: {}", e)))?;
    encoder
        .write_all(data)
        .map_err(|e| Error::SerializationError(format!("Failed to compress: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| Error::SerializationError(format!("Failed to finish compression: {}", e)))
}

/// Decompress a zstd buffer
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    zstd::decode_all(data)
        .map_err(|e| Error::SerializationError(format!("Failed to decompress: {}", e)))
}
