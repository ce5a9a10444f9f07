//! In-Memory Binary Data Store
//!
//! Process-local store for single-process deployments and tests.
//!
//! # Design
//!
//! - `DashMap` sharding, so readers of one identifier never block writers of
//!   another
//! - `Bytes` values: a read clones a reference-counted handle to a complete
//!   blob, never a partially written one

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::debug;

use crate::domain::{BinaryDataStore, BinaryDataStoreFactory, CacheKey, Identifier, Partition};
use crate::error::Result;

/// In-memory store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InMemoryStoreStats {
    /// Entries currently held
    pub entry_count: u64,
    /// Bytes currently held
    pub total_bytes: u64,
    /// Read operations (one per requested identifier)
    pub reads: u64,
    /// Write operations (one per stored identifier)
    pub writes: u64,
}

/// In-memory binary data store
pub struct InMemoryDataStore {
    name: String,
    entries: DashMap<Identifier, Bytes>,
    started: AtomicBool,
    total_bytes: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl InMemoryDataStore {
    /// Create an empty store
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: DashMap::new(),
            started: AtomicBool::new(false),
            total_bytes: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Whether `start` has been called since creation or the last `stop`
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Get store statistics
    pub fn stats(&self) -> InMemoryStoreStats {
        InMemoryStoreStats {
            entry_count: self.entries.len() as u64,
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }

    fn insert(&self, id: Identifier, data: Bytes) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let size = data.len() as u64;

        match self.entries.insert(id, data) {
            Some(old) => {
                let old_size = old.len() as u64;
                if size > old_size {
                    self.total_bytes
                        .fetch_add(size - old_size, Ordering::Relaxed);
                } else {
                    self.total_bytes
                        .fetch_sub(old_size - size, Ordering::Relaxed);
                }
            }
            None => {
                self.total_bytes.fetch_add(size, Ordering::Relaxed);
            }
        }
    }
}

#[async_trait]
impl BinaryDataStore for InMemoryDataStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<()> {
        if !self.started.swap(true, Ordering::AcqRel) {
            debug!(store = %self.name, "started in-memory store");
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.started.store(false, Ordering::Release);
        Ok(())
    }

    async fn put(&self, id: Identifier, data: Bytes) -> Result<()> {
        self.insert(id, data);
        Ok(())
    }

    async fn put_all(&self, entries: HashMap<Identifier, Bytes>) -> Result<()> {
        for (id, data) in entries {
            self.insert(id, data);
        }
        Ok(())
    }

    async fn get(&self, id: Identifier) -> Result<Option<Bytes>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.entries.get(&id).map(|data| data.clone()))
    }

    async fn get_all(&self, ids: &[Identifier]) -> Result<HashMap<Identifier, Bytes>> {
        self.reads.fetch_add(ids.len() as u64, Ordering::Relaxed);
        Ok(ids
            .iter()
            .filter_map(|id| self.entries.get(id).map(|data| (*id, data.clone())))
            .collect())
    }

    async fn delete(&self) -> Result<()> {
        let removed = self.entries.len();
        self.entries.clear();
        self.total_bytes.store(0, Ordering::Relaxed);
        debug!(store = %self.name, removed, "deleted in-memory store");
        Ok(())
    }
}

/// Factory handing out fresh in-memory stores
#[derive(Debug, Default, Clone)]
pub struct InMemoryStoreFactory;

impl InMemoryStoreFactory {
    pub fn new() -> Self {
        Self
    }
}

impl BinaryDataStoreFactory for InMemoryStoreFactory {
    fn create_store(
        &self,
        cache_key: &CacheKey,
        partition: Partition,
    ) -> Result<Arc<dyn BinaryDataStore>> {
        Ok(Arc::new(InMemoryDataStore::new(
            cache_key.store_name(partition),
        )))
    }
}

// =============================================================================
// Tests
// =============================================================================
