//! Write-Through Front Cache
//!
//! Process-local memo in front of a (usually remote) computation cache.
//!
//! # Design
//!
//! Each key moves `Unseen → Pending → Resolved`:
//!
//! ```text
//!   get ──► memo entry ──┬── Resolved(v) ─────────────► v
//!                        ├── Pending(fetch) ──► await ─► v
//!                        └── vacant ──► insert Pending, call inner once
//! ```
//!
//! - The pending fetch is a `Shared` future stored through the `DashMap`
//!   entry API, so only one caller per key ever creates it.
//! - The fetch itself records its outcome in the memo. A failed fetch removes
//!   the entry and hands every waiter the same error.
//! - Unseen keys of one batch share a single inner `get_values` call.
//! - Writes only forward to the inner cache. The memo has no notion of
//!   partitions, so a write never populates it.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::{trace, warn};

use super::metrics::FrontCacheMetrics;
use crate::domain::{CacheSelectHint, CachedValues, ComputationCache, ComputedValue, ValueKey};
use crate::error::{Error, Result};

type FetchResult<V> = std::result::Result<Option<Arc<V>>, Arc<Error>>;
type PendingFetch<V> = Shared<BoxFuture<'static, FetchResult<V>>>;
type BatchResult<K, V> = std::result::Result<Arc<HashMap<K, Option<Arc<V>>>>, Arc<Error>>;

enum MemoEntry<V> {
    Pending {
        generation: u64,
        fetch: PendingFetch<V>,
    },
    Resolved(Option<Arc<V>>),
}

/// Write-through, single-flight front cache
pub struct WriteThroughCache<K: ValueKey, V> {
    inner: Arc<dyn ComputationCache<K, V>>,
    memo: Arc<DashMap<K, MemoEntry<V>>>,
    generation: AtomicU64,
    metrics: Arc<FrontCacheMetrics>,
}

impl<K, V> WriteThroughCache<K, V>
where
    K: ValueKey,
    V: Send + Sync + 'static,
{
    pub fn new(inner: Arc<dyn ComputationCache<K, V>>) -> Self {
        Self {
            inner,
            memo: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
            metrics: Arc::new(FrontCacheMetrics::new()),
        }
    }

    pub fn metrics(&self) -> &FrontCacheMetrics {
        &self.metrics
    }

    /// Number of memoized or in-flight keys
    pub fn len(&self) -> usize {
        self.memo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memo.is_empty()
    }

    /// Drop the memo entry of one key; the next read goes to the inner cache.
    pub fn forget(&self, key: &K) {
        self.memo.remove(key);
    }

    /// Drop every memo entry.
    pub fn clear(&self) {
        self.memo.clear();
    }

    /// Wrap an inner fetch so that it records its own outcome in the memo.
    fn pending<F>(&self, key: K, generation: u64, fetch: F) -> PendingFetch<V>
    where
        F: Future<Output = FetchResult<V>> + Send + 'static,
    {
        let memo = self.memo.clone();
        let metrics = self.metrics.clone();
        async move {
            let result = fetch.await;
            if let Entry::Occupied(mut entry) = memo.entry(key) {
                let current = matches!(
                    entry.get(),
                    MemoEntry::Pending { generation: g, .. } if *g == generation
                );
                if current {
                    match &result {
                        Ok(value) => {
                            entry.insert(MemoEntry::Resolved(value.clone()));
                        }
                        Err(err) => {
                            warn!(key = ?entry.key(), error = %err, "front cache fetch failed");
                            metrics.record_failure();
                            entry.remove();
                        }
                    }
                }
            }
            result
        }
        .boxed()
        .shared()
    }

    async fn get_one(&self, key: &K, hint: Option<&CacheSelectHint<K>>) -> Result<Option<Arc<V>>> {
        let fetch = match self.memo.entry(key.clone()) {
            Entry::Occupied(entry) => match entry.get() {
                MemoEntry::Resolved(value) => {
                    self.metrics.record_hit();
                    return Ok(value.clone());
                }
                MemoEntry::Pending { fetch, .. } => {
                    self.metrics.record_coalesced();
                    fetch.clone()
                }
            },
            Entry::Vacant(entry) => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let inner = self.inner.clone();
                let metrics = self.metrics.clone();
                let owned_key = key.clone();
                let hint = hint.cloned();
                let fetch = self.pending(key.clone(), generation, async move {
                    let started = Instant::now();
                    let result = match &hint {
                        Some(hint) => inner.get_value_with_hint(&owned_key, hint).await,
                        None => inner.get_value(&owned_key).await,
                    };
                    metrics.record_inner_call(started.elapsed());
                    result.map_err(Arc::new)
                });
                entry.insert(MemoEntry::Pending {
                    generation,
                    fetch: fetch.clone(),
                });
                self.metrics.record_misses(1);
                fetch
            }
        };
        fetch.await.map_err(Error::Fetch)
    }

    async fn get_many(
        &self,
        keys: &[K],
        hint: Option<&CacheSelectHint<K>>,
    ) -> Result<CachedValues<K, V>> {
        let mut resolved: HashMap<K, Option<Arc<V>>> = HashMap::with_capacity(keys.len());
        let mut waiting: Vec<(K, PendingFetch<V>)> = Vec::new();
        let mut unseen: Vec<K> = Vec::new();
        let mut seen: HashSet<&K> = HashSet::with_capacity(keys.len());

        // Unseen keys wait on one batch fetch; the key list is sent once the
        // scan below has claimed all of them.
        let (keys_tx, keys_rx) = oneshot::channel::<Vec<K>>();
        let inner = self.inner.clone();
        let metrics = self.metrics.clone();
        let batch_hint = hint.cloned();
        let batch: Shared<BoxFuture<'static, BatchResult<K, V>>> = async move {
            let keys = keys_rx
                .await
                .map_err(|_| Arc::new(Error::Internal("batch fetch abandoned".into())))?;
            let started = Instant::now();
            let result = match &batch_hint {
                Some(hint) => inner.get_values_with_hint(&keys, hint).await,
                None => inner.get_values(&keys).await,
            };
            metrics.record_inner_call(started.elapsed());
            let values = result.map_err(Arc::new)?;
            Ok(Arc::new(values.into_iter().collect::<HashMap<_, _>>()))
        }
        .boxed()
        .shared();

        for key in keys {
            if !seen.insert(key) {
                continue;
            }
            match self.memo.entry(key.clone()) {
                Entry::Occupied(entry) => match entry.get() {
                    MemoEntry::Resolved(value) => {
                        self.metrics.record_hit();
                        resolved.insert(key.clone(), value.clone());
                    }
                    MemoEntry::Pending { fetch, .. } => {
                        self.metrics.record_coalesced();
                        waiting.push((key.clone(), fetch.clone()));
                    }
                },
                Entry::Vacant(entry) => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                    let lookup = key.clone();
                    let from_batch = batch.clone().map(move |result| {
                        result.map(|values| values.get(&lookup).cloned().flatten())
                    });
                    let fetch = self.pending(key.clone(), generation, from_batch);
                    entry.insert(MemoEntry::Pending {
                        generation,
                        fetch: fetch.clone(),
                    });
                    unseen.push(key.clone());
                    waiting.push((key.clone(), fetch));
                }
            }
        }

        if !unseen.is_empty() {
            trace!(unseen = unseen.len(), "front cache batch fetch");
            self.metrics.record_misses(unseen.len() as u64);
            // The receiver lives inside `batch`, which the memo holds on to
            let _ = keys_tx.send(unseen);
        }

        let (waiting_keys, fetches): (Vec<K>, Vec<PendingFetch<V>>) = waiting.into_iter().unzip();
        for (key, result) in waiting_keys.into_iter().zip(join_all(fetches).await) {
            resolved.insert(key, result.map_err(Error::Fetch)?);
        }

        Ok(keys
            .iter()
            .map(|key| (key.clone(), resolved.get(key).cloned().flatten()))
            .collect())
    }

}

#[async_trait]
impl<K, V> ComputationCache<K, V> for WriteThroughCache<K, V>
where
    K: ValueKey,
    V: Send + Sync + 'static,
{
    async fn get_value(&self, key: &K) -> Result<Option<Arc<V>>> {
        self.get_one(key, None).await
    }

    async fn get_value_with_hint(
        &self,
        key: &K,
        hint: &CacheSelectHint<K>,
    ) -> Result<Option<Arc<V>>> {
        self.get_one(key, Some(hint)).await
    }

    async fn get_values(&self, keys: &[K]) -> Result<CachedValues<K, V>> {
        self.get_many(keys, None).await
    }

    async fn get_values_with_hint(
        &self,
        keys: &[K],
        hint: &CacheSelectHint<K>,
    ) -> Result<CachedValues<K, V>> {
        self.get_many(keys, Some(hint)).await
    }

    async fn put_shared_value(&self, value: &ComputedValue<K, V>) -> Result<()> {
        self.inner.put_shared_value(value).await?;
        self.metrics.record_writes(1);
        Ok(())
    }

    async fn put_private_value(&self, value: &ComputedValue<K, V>) -> Result<()> {
        self.inner.put_private_value(value).await?;
        self.metrics.record_writes(1);
        Ok(())
    }

    async fn put_value(
        &self,
        value: &ComputedValue<K, V>,
        hint: &CacheSelectHint<K>,
    ) -> Result<()> {
        self.inner.put_value(value, hint).await?;
        self.metrics.record_writes(1);
        Ok(())
    }

    async fn put_shared_values(&self, values: &[ComputedValue<K, V>]) -> Result<()> {
        self.inner.put_shared_values(values).await?;
        self.metrics.record_writes(values.len() as u64);
        Ok(())
    }

    async fn put_private_values(&self, values: &[ComputedValue<K, V>]) -> Result<()> {
        self.inner.put_private_values(values).await?;
        self.metrics.record_writes(values.len() as u64);
        Ok(())
    }

    async fn put_values(
        &self,
        values: &[ComputedValue<K, V>],
        hint: &CacheSelectHint<K>,
    ) -> Result<()> {
        self.inner.put_values(values, hint).await?;
        self.metrics.record_writes(values.len() as u64);
        Ok(())
    }

    fn estimate_value_size(&self, value: &ComputedValue<K, V>) -> usize {
        self.inner.estimate_value_size(value)
    }
}

// =============================================================================
// Tests
// =============================================================================
