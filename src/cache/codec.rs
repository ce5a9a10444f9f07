//! Value Codecs
//!
//! [`JsonCodec`] serializes any serde value. [`Lz4Codec`] wraps another codec
//! and compresses large encodings with LZ4.
//!
//! # Example
//!
//! ```
//! use viewcache::cache::codec::{JsonCodec, Lz4Codec};
//! use viewcache::domain::ValueCodec;
//!
//! let codec = Lz4Codec::new(JsonCodec::<Vec<f64>>::new());
//!
//! let curve = vec![0.01; 4096];
//! let encoded = codec.encode(&curve).unwrap();
//! assert_eq!(codec.decode(&encoded).unwrap(), curve);
//! ```

use std::io;
use std::marker::PhantomData;

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::domain::ValueCodec;
use crate::error::{Error, Result};

// =============================================================================
// JSON Codec
// =============================================================================

/// serde_json value codec
pub struct JsonCodec<V> {
    _value: PhantomData<fn() -> V>,
}

impl<V> JsonCodec<V> {
    pub fn new() -> Self {
        Self {
            _value: PhantomData,
        }
    }
}

impl<V> Default for JsonCodec<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Writer that only counts bytes
#[derive(Default)]
struct ByteCounter(usize);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<V> ValueCodec<V> for JsonCodec<V>
where
    V: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &V) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn decode(&self, data: &[u8]) -> Result<V> {
        Ok(serde_json::from_slice(data)?)
    }

    fn estimate_size(&self, value: &V) -> usize {
        let mut counter = ByteCounter::default();
        match serde_json::to_writer(&mut counter, value) {
            Ok(()) => counter.0,
            Err(_) => 0,
        }
    }
}

// =============================================================================
// LZ4 Codec
// =============================================================================

const TAG_RAW: u8 = 0;
const TAG_LZ4: u8 = 1;

/// LZ4 settings for [`Lz4Codec`]
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Encodings smaller than this are stored uncompressed
    pub min_size_bytes: usize,
    /// LZ4 high-compression level
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            min_size_bytes: 1024,
            level: 4,
        }
    }
}

/// Compressing decorator over another codec.
///
/// Every blob starts with a one-byte tag (raw or LZ4). Compression is skipped
/// for small encodings and whenever it does not shrink the data.
pub struct Lz4Codec<C> {
    inner: C,
    config: CompressionConfig,
}

impl<C> Lz4Codec<C> {
    pub fn new(inner: C) -> Self {
        Self::with_config(inner, CompressionConfig::default())
    }

    pub fn with_config(inner: C, config: CompressionConfig) -> Self {
        Self { inner, config }
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(
                self.config.level,
            )),
            true,
        )
        .map_err(|e| Error::Compression {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }

    fn tagged(tag: u8, data: &[u8]) -> Bytes {
        let mut out = BytesMut::with_capacity(data.len() + 1);
        out.put_u8(tag);
        out.put_slice(data);
        out.freeze()
    }
}

impl<V, C> ValueCodec<V> for Lz4Codec<C>
where
    C: ValueCodec<V>,
{
    fn encode(&self, value: &V) -> Result<Bytes> {
        let raw = self.inner.encode(value)?;
        if raw.len() < self.config.min_size_bytes {
            return Ok(Self::tagged(TAG_RAW, &raw));
        }
        let compressed = self.compress(&raw)?;
        if compressed.len() < raw.len() {
            Ok(Self::tagged(TAG_LZ4, &compressed))
        } else {
            Ok(Self::tagged(TAG_RAW, &raw))
        }
    }

    fn decode(&self, data: &[u8]) -> Result<V> {
        let decompression_error = |reason: String| Error::Decompression {
            algorithm: "LZ4".into(),
            reason,
        };
        match data.split_first() {
            Some((&TAG_RAW, rest)) => self.inner.decode(rest),
            Some((&TAG_LZ4, rest)) => {
                let raw = lz4::block::decompress(rest, None)
                    .map_err(|e| decompression_error(e.to_string()))?;
                self.inner.decode(&raw)
            }
            Some((tag, _)) => Err(decompression_error(format!("unknown tag {}", tag))),
            None => Err(decompression_error("empty blob".into())),
        }
    }

    fn estimate_size(&self, value: &V) -> usize {
        self.inner.estimate_size(value) + 1
    }
}

// =============================================================================
// Tests
// =============================================================================
