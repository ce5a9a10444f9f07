//! Default Computation Cache
//!
//! Routes values between the shared and private stores of one cache key:
//! key → identifier through the identifier map, value ↔ bytes through the
//! codec. There is no fallback between partitions on hinted reads or on
//! writes; only unhinted reads look at both (private first).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, trace};

use crate::domain::{
    BinaryDataStore, CacheKey, CacheSelectHint, CachedValues, ComputationCache, ComputedValue,
    Identifier, IdentifierMap, Partition, ValueCodec, ValueKey,
};
use crate::error::{Error, Result};

/// Computation cache over a pair of binary data stores
pub struct DefaultComputationCache<K: ValueKey, V> {
    cache_key: CacheKey,
    identifiers: Arc<dyn IdentifierMap<K>>,
    shared: Arc<dyn BinaryDataStore>,
    private: Arc<dyn BinaryDataStore>,
    codec: Arc<dyn ValueCodec<V>>,
}

impl<K: ValueKey, V: Send + Sync + 'static> DefaultComputationCache<K, V> {
    pub fn new(
        cache_key: CacheKey,
        identifiers: Arc<dyn IdentifierMap<K>>,
        shared: Arc<dyn BinaryDataStore>,
        private: Arc<dyn BinaryDataStore>,
        codec: Arc<dyn ValueCodec<V>>,
    ) -> Self {
        Self {
            cache_key,
            identifiers,
            shared,
            private,
            codec,
        }
    }

    pub fn cache_key(&self) -> &CacheKey {
        &self.cache_key
    }

    fn store(&self, partition: Partition) -> &Arc<dyn BinaryDataStore> {
        match partition {
            Partition::Shared => &self.shared,
            Partition::Private => &self.private,
        }
    }

    fn decode(&self, data: &[u8]) -> Result<Arc<V>> {
        self.codec.decode(data).map(Arc::new)
    }

    fn resolved(ids: &HashMap<K, Identifier>, key: &K) -> Result<Identifier> {
        ids.get(key).copied().ok_or_else(|| {
            Error::Internal(format!("identifier map omitted key {:?}", key))
        })
    }

    async fn get_from(&self, key: &K, partitions: &[Partition]) -> Result<Option<Arc<V>>> {
        let id = self.identifiers.get_identifier(key).await?;
        for partition in partitions {
            if let Some(data) = self.store(*partition).get(id).await? {
                trace!(cache = %self.cache_key, id, %partition, "value hit");
                return self.decode(&data).map(Some);
            }
        }
        Ok(None)
    }

    async fn put_to(&self, value: &ComputedValue<K, V>, partition: Partition) -> Result<()> {
        let id = self.identifiers.get_identifier(&value.specification).await?;
        let data = self.codec.encode(&value.value)?;
        self.store(partition).put(id, data).await
    }

    /// Encode and store a batch, one bulk identifier call and at most one
    /// bulk write per partition.
    async fn put_routed<F>(&self, values: &[ComputedValue<K, V>], route: F) -> Result<()>
    where
        F: Fn(&K) -> Partition,
    {
        if values.is_empty() {
            return Ok(());
        }
        let keys: Vec<K> = values.iter().map(|v| v.specification.clone()).collect();
        let ids = self.identifiers.get_identifiers(&keys).await?;

        let mut shared = HashMap::new();
        let mut private = HashMap::new();
        for value in values {
            let id = Self::resolved(&ids, &value.specification)?;
            let data = self.codec.encode(&value.value)?;
            match route(&value.specification) {
                Partition::Shared => shared.insert(id, data),
                Partition::Private => private.insert(id, data),
            };
        }

        debug!(
            cache = %self.cache_key,
            shared = shared.len(),
            private = private.len(),
            "storing values"
        );
        if !shared.is_empty() {
            self.shared.put_all(shared).await?;
        }
        if !private.is_empty() {
            self.private.put_all(private).await?;
        }
        Ok(())
    }

    fn assemble(
        &self,
        keys: &[K],
        ids: &HashMap<K, Identifier>,
        found: &HashMap<Identifier, Bytes>,
    ) -> Result<CachedValues<K, V>> {
        keys.iter()
            .map(|key| {
                let id = Self::resolved(ids, key)?;
                let value = match found.get(&id) {
                    Some(data) => Some(self.decode(data)?),
                    None => None,
                };
                Ok((key.clone(), value))
            })
            .collect()
    }
}

#[async_trait]
impl<K, V> ComputationCache<K, V> for DefaultComputationCache<K, V>
where
    K: ValueKey,
    V: Send + Sync + 'static,
{
    async fn get_value(&self, key: &K) -> Result<Option<Arc<V>>> {
        self.get_from(key, &[Partition::Private, Partition::Shared])
            .await
    }

    async fn get_value_with_hint(
        &self,
        key: &K,
        hint: &CacheSelectHint<K>,
    ) -> Result<Option<Arc<V>>> {
        self.get_from(key, &[hint.partition_of(key)]).await
    }

    async fn get_values(&self, keys: &[K]) -> Result<CachedValues<K, V>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let ids = self.identifiers.get_identifiers(keys).await?;
        let mut wanted: Vec<Identifier> = ids.values().copied().collect();
        wanted.sort_unstable();

        let mut found = self.private.get_all(&wanted).await?;
        let remaining: Vec<Identifier> = wanted
            .into_iter()
            .filter(|id| !found.contains_key(id))
            .collect();
        if !remaining.is_empty() {
            found.extend(self.shared.get_all(&remaining).await?);
        }

        trace!(cache = %self.cache_key, requested = keys.len(), found = found.len(), "bulk read");
        self.assemble(keys, &ids, &found)
    }

    async fn get_values_with_hint(
        &self,
        keys: &[K],
        hint: &CacheSelectHint<K>,
    ) -> Result<CachedValues<K, V>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let ids = self.identifiers.get_identifiers(keys).await?;

        let mut shared = Vec::new();
        let mut private = Vec::new();
        for (key, id) in &ids {
            match hint.partition_of(key) {
                Partition::Shared => shared.push(*id),
                Partition::Private => private.push(*id),
            }
        }

        let mut found = HashMap::with_capacity(ids.len());
        if !shared.is_empty() {
            found.extend(self.shared.get_all(&shared).await?);
        }
        if !private.is_empty() {
            found.extend(self.private.get_all(&private).await?);
        }
        self.assemble(keys, &ids, &found)
    }

    async fn put_shared_value(&self, value: &ComputedValue<K, V>) -> Result<()> {
        self.put_to(value, Partition::Shared).await
    }

    async fn put_private_value(&self, value: &ComputedValue<K, V>) -> Result<()> {
        self.put_to(value, Partition::Private).await
    }

    async fn put_value(
        &self,
        value: &ComputedValue<K, V>,
        hint: &CacheSelectHint<K>,
    ) -> Result<()> {
        self.put_to(value, hint.partition_of(&value.specification))
            .await
    }

    async fn put_shared_values(&self, values: &[ComputedValue<K, V>]) -> Result<()> {
        self.put_routed(values, |_| Partition::Shared).await
    }

    async fn put_private_values(&self, values: &[ComputedValue<K, V>]) -> Result<()> {
        self.put_routed(values, |_| Partition::Private).await
    }

    async fn put_values(
        &self,
        values: &[ComputedValue<K, V>],
        hint: &CacheSelectHint<K>,
    ) -> Result<()> {
        self.put_routed(values, |key| hint.partition_of(key)).await
    }

    fn estimate_value_size(&self, value: &ComputedValue<K, V>) -> usize {
        self.codec.estimate_size(&value.value)
    }
}

// =============================================================================
// Tests
// =============================================================================
