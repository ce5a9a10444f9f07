//! Identifier Maps
//!
//! Interning of value keys into compact identifiers.
//!
//! - [`InMemoryIdentifierMap`] is the authority for a single process
//! - [`CachingIdentifierMap`] memoizes a slower authority (usually the remote
//!   one) so each key crosses the wire once per process

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use crate::domain::{Identifier, IdentifierMap, ValueKey};
use crate::error::Result;

/// First identifier handed out by a fresh map
pub const FIRST_IDENTIFIER: Identifier = 1;

// =============================================================================
// In-Memory Identifier Map
// =============================================================================

/// Process-local identifier map.
///
/// Assignment goes through the `DashMap` entry API, so the shard lock makes
/// the lookup and the insert one step.
pub struct InMemoryIdentifierMap<K: ValueKey> {
    ids: DashMap<K, Identifier>,
    next: AtomicI64,
}

impl<K: ValueKey> InMemoryIdentifierMap<K> {
    pub fn new() -> Self {
        Self {
            ids: DashMap::new(),
            next: AtomicI64::new(FIRST_IDENTIFIER),
        }
    }

    /// Number of keys interned so far
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn intern(&self, key: &K) -> Identifier {
        if let Some(id) = self.ids.get(key) {
            return *id;
        }
        *self
            .ids
            .entry(key.clone())
            .or_insert_with(|| self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl<K: ValueKey> Default for InMemoryIdentifierMap<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K: ValueKey> IdentifierMap<K> for InMemoryIdentifierMap<K> {
    async fn get_identifier(&self, key: &K) -> Result<Identifier> {
        Ok(self.intern(key))
    }

    async fn get_identifiers(&self, keys: &[K]) -> Result<HashMap<K, Identifier>> {
        let mut result = HashMap::with_capacity(keys.len());
        for key in keys {
            if !result.contains_key(key) {
                result.insert(key.clone(), self.intern(key));
            }
        }
        Ok(result)
    }
}

// =============================================================================
// Caching Identifier Map
// =============================================================================

/// Memo in front of another identifier map.
///
/// Identifiers never change once assigned, so the memo needs no invalidation.
/// Bulk lookups forward only unmemoized keys, in one underlying call.
pub struct CachingIdentifierMap<K: ValueKey> {
    inner: Arc<dyn IdentifierMap<K>>,
    memo: DashMap<K, Identifier>,
}

impl<K: ValueKey> CachingIdentifierMap<K> {
    pub fn new(inner: Arc<dyn IdentifierMap<K>>) -> Self {
        Self {
            inner,
            memo: DashMap::new(),
        }
    }

    /// Number of memoized keys
    pub fn memoized(&self) -> usize {
        self.memo.len()
    }
}

#[async_trait]
impl<K: ValueKey> IdentifierMap<K> for CachingIdentifierMap<K> {
    async fn get_identifier(&self, key: &K) -> Result<Identifier> {
        if let Some(id) = self.memo.get(key) {
            return Ok(*id);
        }
        let id = self.inner.get_identifier(key).await?;
        self.memo.insert(key.clone(), id);
        Ok(id)
    }

    async fn get_identifiers(&self, keys: &[K]) -> Result<HashMap<K, Identifier>> {
        let mut result = HashMap::with_capacity(keys.len());
        let mut missing = Vec::new();
        let mut queued: HashSet<&K> = HashSet::new();
        for key in keys {
            if result.contains_key(key) {
                continue;
            }
            match self.memo.get(key) {
                Some(id) => {
                    result.insert(key.clone(), *id);
                }
                None => {
                    if queued.insert(key) {
                        missing.push(key.clone());
                    }
                }
            }
        }

        if !missing.is_empty() {
            trace!(missing = missing.len(), "forwarding identifier lookups");
            let fetched = self.inner.get_identifiers(&missing).await?;
            for (key, id) in fetched {
                self.memo.insert(key.clone(), id);
                result.insert(key, id);
            }
        }
        Ok(result)
    }
}

// =============================================================================
// Tests
// =============================================================================
