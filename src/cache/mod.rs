//! Cache Layer
//!
//! Local implementations of the domain ports:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  WriteThroughCache (front, single-flight memo)           │
//! └──────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │  DefaultComputationCache (identifier map + codec)        │
//! └──────────────────────────────────────────────────────────┘
//!               │                            │
//!               ▼                            ▼
//! ┌──────────────────────────┐  ┌────────────────────────────┐
//! │  shared store            │  │  private store             │
//! │  (memory | redb | remote)│  │  (memory | redb)           │
//! └──────────────────────────┘  └────────────────────────────┘
//! ```
//!
//! Stores are owned by a [`StoreRegistry`] and handed out through a
//! [`DefaultCacheSource`].

pub mod codec;
pub mod computation;
pub mod front;
pub mod identifier;
pub mod memory;
pub mod metrics;
pub mod persistent;
pub mod source;

pub use codec::{CompressionConfig, JsonCodec, Lz4Codec};
pub use computation::DefaultComputationCache;
pub use front::WriteThroughCache;
pub use identifier::{CachingIdentifierMap, InMemoryIdentifierMap};
pub use memory::{InMemoryDataStore, InMemoryStoreFactory, InMemoryStoreStats};
pub use metrics::{FrontCacheMetrics, FrontCacheSnapshot};
pub use persistent::{
    PersistentDataStore, PersistentIdentifierMap, PersistentStoreFactory, StorageEnvironment,
};
pub use source::{DefaultCacheSource, StorePair, StoreRegistry};
