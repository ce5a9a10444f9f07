//! viewcache - Computation Value Cache
//!
//! Stores the intermediate and final values produced while evaluating a
//! dependency graph of calculations, so that independent calculation
//! processes can publish results once and read each other's results many
//! times during one evaluation cycle.
//!
//! # Architecture
//!
//! ```text
//! ValueKey ──► IdentifierMap ──► Identifier
//!                                   │
//! ComputedValue ──► ValueCodec ──► bytes ──► BinaryDataStore (shared | private)
//! ```
//!
//! - Keys are interned into compact identifiers, one authority per deployment
//! - Values live in a shared or a private partition per (run, configuration)
//! - A write-through front cache collapses concurrent reads of one key into a
//!   single fetch
//! - A request/response protocol lets many processes share one server
//!
//! # Modules
//!
//! - [`domain`] - Value objects and port traits
//! - [`cache`] - Identifier maps, stores, codecs, computation and front caches
//! - [`remote`] - Wire protocol, transports, server and client
//! - [`config`] - Service configuration
//! - [`metrics`] - Prometheus metrics of the server
//! - [`error`] - Error types

pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod remote;

// Re-export commonly used types
pub use cache::{DefaultCacheSource, StoreRegistry, WriteThroughCache};
pub use config::{BackendKind, CacheServiceConfig};
pub use domain::{
    CacheKey, CacheSelectHint, ComputationCache, ComputationCacheSource, ComputedValue,
    Identifier, Partition, ValueSpecification,
};
pub use error::{Error, Result};
pub use remote::{CacheServer, RemoteCacheClient, RemoteCacheSource};
