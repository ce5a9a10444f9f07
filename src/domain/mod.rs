//! Domain Layer
//!
//! Value objects and the port traits that the cache layers implement.
//!
//! - **Values** (`value.rs`) - cache keys, partitions, hints, computed values
//! - **Ports** (`ports.rs`) - identifier maps, stores, caches, codecs, sources
//!
//! # Usage
//!
//! ```ignore
//! use viewcache::domain::{CacheKey, ComputationCache, ComputedValue};
//!
//! async fn publish<C>(cache: &C, value: &ComputedValue<Spec, f64>) -> Result<()>
//! where
//!     C: ComputationCache<Spec, f64>,
//! {
//!     cache.put_shared_value(value).await
//! }
//! ```

pub mod ports;
pub mod value;

pub use ports::{
    BinaryDataStore, BinaryDataStoreFactory, CachedValues, ComputationCache,
    ComputationCacheSource, IdentifierMap, ValueCodec,
};
pub use value::{
    CacheKey, CacheSelectHint, ComputedValue, Identifier, Partition, ValueKey,
    ValueSpecification,
};
