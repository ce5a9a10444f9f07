//! Domain Ports (Port/Adapter Pattern)
//!
//! The abstractions every cache layer is written against. Local, persistent
//! and remote implementations live in [`crate::cache`] and [`crate::remote`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Ports (Traits)                          │
//! │  IdentifierMap │ BinaryDataStore │ ComputationCache │ Codec  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Adapters (Impls)                           │
//! │  InMemory* │ Persistent* (redb) │ Remote* │ WriteThrough     │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::value::{CacheKey, CacheSelectHint, ComputedValue, Identifier, Partition, ValueKey};
use crate::error::Result;

/// One `(key, value-or-absent)` pair per requested key.
pub type CachedValues<K, V> = Vec<(K, Option<Arc<V>>)>;

// =============================================================================
// Identifier Map Port
// =============================================================================

/// Port for interning value keys into compact identifiers.
///
/// For the lifetime of one map instance, equal keys map to equal identifiers
/// and distinct keys to distinct identifiers. Concurrent callers asking for the
/// same unseen key all observe the single identifier assigned to it.
#[async_trait]
pub trait IdentifierMap<K: ValueKey>: Send + Sync {
    /// Get (assigning if needed) the identifier of a key.
    async fn get_identifier(&self, key: &K) -> Result<Identifier>;

    /// Get identifiers for many keys. Every requested key is present in the
    /// result; repeated keys share one entry.
    async fn get_identifiers(&self, keys: &[K]) -> Result<HashMap<K, Identifier>>;
}

// =============================================================================
// Binary Data Store Port
// =============================================================================

/// Port for an identifier-keyed byte store scoped to one cache partition.
///
/// Implementations must be safe under concurrent readers and writers; a read
/// returns either nothing or one complete previously written blob.
#[async_trait]
pub trait BinaryDataStore: Send + Sync {
    /// Name of the store, `"{run}/{config}/{partition}"`.
    fn name(&self) -> &str;

    /// Open or prepare storage. No-op if already started.
    async fn start(&self) -> Result<()>;

    /// Release resources held by the store without deleting its entries.
    async fn stop(&self) -> Result<()>;

    /// Store one blob.
    async fn put(&self, id: Identifier, data: Bytes) -> Result<()>;

    /// Store many blobs.
    async fn put_all(&self, entries: HashMap<Identifier, Bytes>) -> Result<()>;

    /// Read one blob.
    async fn get(&self, id: Identifier) -> Result<Option<Bytes>>;

    /// Read many blobs. Absent identifiers are omitted from the result.
    async fn get_all(&self, ids: &[Identifier]) -> Result<HashMap<Identifier, Bytes>>;

    /// Irrevocably remove all entries and reclaim the storage.
    async fn delete(&self) -> Result<()>;
}

impl std::fmt::Debug for dyn BinaryDataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryDataStore")
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

/// Port for creating binary data stores; selects the backend.
pub trait BinaryDataStoreFactory: Send + Sync {
    /// Create the (unstarted) store for one partition of a cache.
    fn create_store(
        &self,
        cache_key: &CacheKey,
        partition: Partition,
    ) -> Result<Arc<dyn BinaryDataStore>>;
}

// =============================================================================
// Value Codec Port
// =============================================================================

/// Port for value serialization, supplied by the surrounding system.
pub trait ValueCodec<V>: Send + Sync {
    /// Serialize a value.
    fn encode(&self, value: &V) -> Result<Bytes>;

    /// Deserialize a value. Malformed input is an error, never a default.
    fn decode(&self, data: &[u8]) -> Result<V>;

    /// Estimated encoded size in bytes, cheaper than a full encode.
    fn estimate_size(&self, value: &V) -> usize;
}

// =============================================================================
// Computation Cache Port
// =============================================================================

/// Port for reading and writing computed values by key.
///
/// Writes name their partition explicitly or through a hint. Hinted reads
/// consult only the hinted partition; unhinted reads consult private, then
/// shared.
#[async_trait]
pub trait ComputationCache<K: ValueKey, V: Send + Sync + 'static>: Send + Sync {
    /// Read a value from either partition.
    async fn get_value(&self, key: &K) -> Result<Option<Arc<V>>>;

    /// Read a value from the partition the hint assigns to it.
    async fn get_value_with_hint(
        &self,
        key: &K,
        hint: &CacheSelectHint<K>,
    ) -> Result<Option<Arc<V>>>;

    /// Read many values from either partition.
    async fn get_values(&self, keys: &[K]) -> Result<CachedValues<K, V>>;

    /// Read many values, each from the partition the hint assigns to it.
    async fn get_values_with_hint(
        &self,
        keys: &[K],
        hint: &CacheSelectHint<K>,
    ) -> Result<CachedValues<K, V>>;

    async fn put_shared_value(&self, value: &ComputedValue<K, V>) -> Result<()>;

    async fn put_private_value(&self, value: &ComputedValue<K, V>) -> Result<()>;

    async fn put_value(&self, value: &ComputedValue<K, V>, hint: &CacheSelectHint<K>)
        -> Result<()>;

    async fn put_shared_values(&self, values: &[ComputedValue<K, V>]) -> Result<()>;

    async fn put_private_values(&self, values: &[ComputedValue<K, V>]) -> Result<()>;

    async fn put_values(
        &self,
        values: &[ComputedValue<K, V>],
        hint: &CacheSelectHint<K>,
    ) -> Result<()>;

    /// Estimated stored size of a value, for memory accounting.
    fn estimate_value_size(&self, value: &ComputedValue<K, V>) -> usize;
}

// =============================================================================
// Cache Source Port
// =============================================================================

/// Port for locating the cache of a (run, configuration) pair.
///
/// The source owns the lifecycle of the stores behind the caches it hands out:
/// they are created on first use and deleted when the cache is released.
#[async_trait]
pub trait ComputationCacheSource<K: ValueKey, V: Send + Sync + 'static>: Send + Sync {
    /// Get or create the cache for a key.
    async fn get_cache(&self, cache_key: &CacheKey) -> Result<Arc<dyn ComputationCache<K, V>>>;

    /// Delete the stores of one cache.
    async fn release_cache(&self, cache_key: &CacheKey) -> Result<()>;

    /// Delete the stores of every cache belonging to a run.
    async fn release_caches(&self, run_id: &str) -> Result<()>;
}
