//! Cache Source
//!
//! [`StoreRegistry`] owns the stores of every live cache key: it creates and
//! starts them on first use and deletes them exactly once on release.
//! [`DefaultCacheSource`] builds computation caches on top of it.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use super::computation::DefaultComputationCache;
use crate::domain::{
    BinaryDataStore, BinaryDataStoreFactory, CacheKey, ComputationCache, ComputationCacheSource,
    IdentifierMap, Partition, ValueCodec, ValueKey,
};
use crate::error::Result;

// =============================================================================
// Store Registry
// =============================================================================

/// The two stores of one cache key
pub struct StorePair {
    pub shared: Arc<dyn BinaryDataStore>,
    pub private: Arc<dyn BinaryDataStore>,
}

impl StorePair {
    pub fn get(&self, partition: Partition) -> &Arc<dyn BinaryDataStore> {
        match partition {
            Partition::Shared => &self.shared,
            Partition::Private => &self.private,
        }
    }
}

/// Registry of live stores keyed by cache key
pub struct StoreRegistry {
    shared_factory: Arc<dyn BinaryDataStoreFactory>,
    private_factory: Arc<dyn BinaryDataStoreFactory>,
    stores: DashMap<CacheKey, Arc<StorePair>>,
}

impl StoreRegistry {
    /// Registry taking both partitions from one factory
    pub fn new(factory: Arc<dyn BinaryDataStoreFactory>) -> Self {
        Self::with_factories(factory.clone(), factory)
    }

    /// Registry with separate factories per partition
    pub fn with_factories(
        shared_factory: Arc<dyn BinaryDataStoreFactory>,
        private_factory: Arc<dyn BinaryDataStoreFactory>,
    ) -> Self {
        Self {
            shared_factory,
            private_factory,
            stores: DashMap::new(),
        }
    }

    /// Stores for a cache key, created and started on first use.
    pub async fn stores(&self, cache_key: &CacheKey) -> Result<Arc<StorePair>> {
        if let Some(pair) = self.stores.get(cache_key) {
            return Ok(pair.clone());
        }

        let (pair, created) = match self.stores.entry(cache_key.clone()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let pair = Arc::new(StorePair {
                    shared: self
                        .shared_factory
                        .create_store(cache_key, Partition::Shared)?,
                    private: self
                        .private_factory
                        .create_store(cache_key, Partition::Private)?,
                });
                entry.insert(pair.clone());
                (pair, true)
            }
        };

        if created {
            if let Err(err) = Self::start_pair(&pair).await {
                self.stores
                    .remove_if(cache_key, |_, live| Arc::ptr_eq(live, &pair));
                warn!(cache = %cache_key, error = %err, "failed to start cache stores");
                return Err(err);
            }
            info!(cache = %cache_key, "created cache stores");
        }
        Ok(pair)
    }

    async fn start_pair(pair: &StorePair) -> Result<()> {
        pair.shared.start().await?;
        if let Err(err) = pair.private.start().await {
            if let Err(stop_err) = pair.shared.stop().await {
                warn!(store = pair.shared.name(), error = %stop_err, "failed to stop store");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Store for one partition of a cache key.
    pub async fn store(
        &self,
        cache_key: &CacheKey,
        partition: Partition,
    ) -> Result<Arc<dyn BinaryDataStore>> {
        Ok(self.stores(cache_key).await?.get(partition).clone())
    }

    /// Delete both stores of a cache key. Returns false if none were live.
    pub async fn release(&self, cache_key: &CacheKey) -> Result<bool> {
        let Some((_, pair)) = self.stores.remove(cache_key) else {
            debug!(cache = %cache_key, "release of unknown cache");
            return Ok(false);
        };
        pair.shared.delete().await?;
        pair.private.delete().await?;
        info!(cache = %cache_key, "released cache stores");
        Ok(true)
    }

    /// Delete the stores of every cache key belonging to a run.
    pub async fn release_run(&self, run_id: &str) -> Result<usize> {
        let mut released = 0;
        for cache_key in self.keys_for_run(run_id) {
            if self.release(&cache_key).await? {
                released += 1;
            }
        }
        Ok(released)
    }

    /// Live cache keys of a run
    pub fn keys_for_run(&self, run_id: &str) -> Vec<CacheKey> {
        self.stores
            .iter()
            .filter(|entry| entry.key().run_id() == run_id)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    /// Stop every live store without deleting anything.
    pub async fn shutdown(&self) -> Result<()> {
        let pairs: Vec<Arc<StorePair>> = self.stores.iter().map(|e| e.value().clone()).collect();
        for pair in pairs {
            pair.shared.stop().await?;
            pair.private.stop().await?;
        }
        Ok(())
    }
}

// =============================================================================
// Default Cache Source
// =============================================================================

/// Cache source handing out [`DefaultComputationCache`]s
pub struct DefaultCacheSource<K: ValueKey, V> {
    identifiers: Arc<dyn IdentifierMap<K>>,
    registry: Arc<StoreRegistry>,
    codec: Arc<dyn ValueCodec<V>>,
    caches: DashMap<CacheKey, Arc<DefaultComputationCache<K, V>>>,
}

impl<K: ValueKey, V: Send + Sync + 'static> DefaultCacheSource<K, V> {
    pub fn new(
        identifiers: Arc<dyn IdentifierMap<K>>,
        registry: Arc<StoreRegistry>,
        codec: Arc<dyn ValueCodec<V>>,
    ) -> Self {
        Self {
            identifiers,
            registry,
            codec,
            caches: DashMap::new(),
        }
    }

    pub fn identifier_map(&self) -> &Arc<dyn IdentifierMap<K>> {
        &self.identifiers
    }

    pub fn registry(&self) -> &Arc<StoreRegistry> {
        &self.registry
    }
}

#[async_trait]
impl<K, V> ComputationCacheSource<K, V> for DefaultCacheSource<K, V>
where
    K: ValueKey,
    V: Send + Sync + 'static,
{
    async fn get_cache(&self, cache_key: &CacheKey) -> Result<Arc<dyn ComputationCache<K, V>>> {
        if let Some(cache) = self.caches.get(cache_key) {
            return Ok(cache.clone());
        }
        let stores = self.registry.stores(cache_key).await?;
        let cache = self
            .caches
            .entry(cache_key.clone())
            .or_insert_with(|| {
                Arc::new(DefaultComputationCache::new(
                    cache_key.clone(),
                    self.identifiers.clone(),
                    stores.shared.clone(),
                    stores.private.clone(),
                    self.codec.clone(),
                ))
            })
            .clone();
        Ok(cache)
    }

    async fn release_cache(&self, cache_key: &CacheKey) -> Result<()> {
        self.caches.remove(cache_key);
        self.registry.release(cache_key).await?;
        Ok(())
    }

    async fn release_caches(&self, run_id: &str) -> Result<()> {
        self.caches.retain(|key, _| key.run_id() != run_id);
        let released = self.registry.release_run(run_id).await?;
        debug!(run = run_id, released, "released run caches");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::codec::JsonCodec;
    use crate::cache::identifier::InMemoryIdentifierMap;
    use crate::cache::memory::{InMemoryDataStore, InMemoryStoreFactory};
    use crate::cache::persistent::{PersistentStoreFactory, StorageEnvironment};
    use crate::domain::{ComputedValue, Identifier, ValueSpecification};
    use crate::error::Error;
    use assert_matches::assert_matches;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn source(
        factory: Arc<dyn BinaryDataStoreFactory>,
    ) -> DefaultCacheSource<ValueSpecification, String> {
        DefaultCacheSource::new(
            Arc::new(InMemoryIdentifierMap::<ValueSpecification>::new()),
            Arc::new(StoreRegistry::new(factory)),
            Arc::new(JsonCodec::<String>::new()),
        )
    }

    #[tokio::test]
    async fn test_get_cache_reuses_instance() {
        let source = source(Arc::new(InMemoryStoreFactory::new()));
        let key = CacheKey::new("cycle-1", "ConfigA");

        let first = source.get_cache(&key).await.unwrap();
        let second = source.get_cache(&key).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_stores_are_scoped_per_cache_key() {
        let source = source(Arc::new(InMemoryStoreFactory::new()));
        let a = source.get_cache(&CacheKey::new("cycle-1", "ConfigA")).await.unwrap();
        let b = source.get_cache(&CacheKey::new("cycle-1", "ConfigB")).await.unwrap();
        let spec = ValueSpecification::new("PV", "T");

        a.put_shared_value(&ComputedValue::new(spec.clone(), "a".to_string()))
            .await
            .unwrap();
        assert_eq!(b.get_value(&spec).await.unwrap(), None);
        assert_eq!(a.get_value(&spec).await.unwrap().as_deref().map(String::as_str), Some("a"));
    }

    /// Factory whose stores fail to start while `failing` is set
    struct FlakyFactory {
        failing: Arc<AtomicBool>,
    }

    struct FlakyStore {
        inner: InMemoryDataStore,
        failing: Arc<AtomicBool>,
    }

    impl BinaryDataStoreFactory for FlakyFactory {
        fn create_store(
            &self,
            cache_key: &CacheKey,
            partition: Partition,
        ) -> Result<Arc<dyn BinaryDataStore>> {
            Ok(Arc::new(FlakyStore {
                inner: InMemoryDataStore::new(cache_key.store_name(partition)),
                failing: self.failing.clone(),
            }))
        }
    }

    #[async_trait]
    impl BinaryDataStore for FlakyStore {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn start(&self) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::Internal("disk unavailable".into()));
            }
            self.inner.start().await
        }

        async fn stop(&self) -> Result<()> {
            self.inner.stop().await
        }

        async fn put(&self, id: Identifier, data: Bytes) -> Result<()> {
            self.inner.put(id, data).await
        }

        async fn put_all(&self, entries: HashMap<Identifier, Bytes>) -> Result<()> {
            self.inner.put_all(entries).await
        }

        async fn get(&self, id: Identifier) -> Result<Option<Bytes>> {
            self.inner.get(id).await
        }

        async fn get_all(&self, ids: &[Identifier]) -> Result<HashMap<Identifier, Bytes>> {
            self.inner.get_all(ids).await
        }

        async fn delete(&self) -> Result<()> {
            self.inner.delete().await
        }
    }

    #[tokio::test]
    async fn test_failed_start_is_not_registered() {
        let failing = Arc::new(AtomicBool::new(true));
        let registry = StoreRegistry::new(Arc::new(FlakyFactory {
            failing: failing.clone(),
        }));
        let key = CacheKey::new("cycle-1", "ConfigA");

        assert!(registry.stores(&key).await.is_err());
        assert!(registry.is_empty());

        failing.store(false, Ordering::SeqCst);
        let pair = registry.stores(&key).await.unwrap();
        pair.shared.put(1, Bytes::from_static(b"v")).await.unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_release_deletes_values() {
        let source = source(Arc::new(InMemoryStoreFactory::new()));
        let key = CacheKey::new("cycle-1", "ConfigA");
        let spec = ValueSpecification::new("PV", "T");

        let cache = source.get_cache(&key).await.unwrap();
        cache
            .put_shared_value(&ComputedValue::new(spec.clone(), "v".to_string()))
            .await
            .unwrap();
        source.release_cache(&key).await.unwrap();
        assert!(source.registry().is_empty());

        let fresh = source.get_cache(&key).await.unwrap();
        assert_eq!(fresh.get_value(&spec).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_release_run_only_touches_that_run() {
        let source = source(Arc::new(InMemoryStoreFactory::new()));
        source.get_cache(&CacheKey::new("cycle-1", "A")).await.unwrap();
        source.get_cache(&CacheKey::new("cycle-1", "B")).await.unwrap();
        source.get_cache(&CacheKey::new("cycle-2", "A")).await.unwrap();

        source.release_caches("cycle-1").await.unwrap();
        assert_eq!(source.registry().len(), 1);
        assert_eq!(
            source.registry().keys_for_run("cycle-2"),
            vec![CacheKey::new("cycle-2", "A")]
        );
        assert!(!source.registry().release(&CacheKey::new("cycle-1", "A")).await.unwrap());
    }

    #[tokio::test]
    async fn test_late_write_cannot_undo_release() {
        let dir = tempfile::tempdir().unwrap();
        let env = StorageEnvironment::new(dir.path(), false);
        let registry = StoreRegistry::new(Arc::new(PersistentStoreFactory::new(env.clone())));
        let key = CacheKey::new("cycle-1", "ConfigA");

        let held = registry.store(&key, Partition::Shared).await.unwrap();
        assert!(registry.release(&key).await.unwrap());
        assert_matches!(
            held.put(7, Bytes::from_static(b"late")).await,
            Err(Error::StoreDeleted { .. })
        );

        let fresh = registry.store(&key, Partition::Shared).await.unwrap();
        assert_eq!(fresh.get(7).await.unwrap(), None);

        registry.release(&key).await.unwrap();
        assert_eq!(env.open_stores(), 0);
        env.destroy().unwrap();
    }

    #[tokio::test]
    async fn test_persistent_release_closes_environment() {
        let dir = tempfile::tempdir().unwrap();
        let env = StorageEnvironment::new(dir.path(), false);
        let source = source(Arc::new(PersistentStoreFactory::new(env.clone())));
        let key = CacheKey::new("cycle-1", "ConfigA");

        let cache = source.get_cache(&key).await.unwrap();
        cache
            .put_private_value(&ComputedValue::new(
                ValueSpecification::new("PV", "T"),
                "v".to_string(),
            ))
            .await
            .unwrap();
        assert_eq!(env.open_stores(), 2);

        source.release_cache(&key).await.unwrap();
        assert_eq!(env.open_stores(), 0);
        assert!(!env.is_open());
    }
}
