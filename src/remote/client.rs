//! Remote Cache Client
//!
//! [`RemoteCacheClient`] issues protocol requests over a pool of connections.
//! On top of it:
//!
//! - [`RemoteIdentifierMap`]: identifiers from the server
//! - [`RemoteDataStore`]: the server's shared store for one cache key
//! - [`RemoteCacheSource`]: caches whose shared partition lives on the server
//!   and whose private partition stays in this process, each behind a
//!   write-through front cache

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::protocol::{CacheRequest, CacheResponse, Envelope, UNKNOWN_CORRELATION};
use super::transport::MessageConnection;
use crate::cache::{CachingIdentifierMap, DefaultCacheSource, StoreRegistry, WriteThroughCache};
use crate::domain::{
    BinaryDataStore, BinaryDataStoreFactory, CacheKey, ComputationCache, ComputationCacheSource,
    Identifier, IdentifierMap, Partition, ValueCodec, ValueKey,
};
use crate::error::{Error, Result};

// =============================================================================
// Client
// =============================================================================

/// Protocol client over one or more connections (round-robin)
pub struct RemoteCacheClient<K: ValueKey> {
    connections: Vec<Arc<dyn MessageConnection>>,
    next_connection: AtomicUsize,
    next_correlation: AtomicU64,
    _key: PhantomData<fn() -> K>,
}

impl<K: ValueKey> std::fmt::Debug for RemoteCacheClient<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCacheClient")
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

fn unexpected<K>(expected: &'static str, actual: &CacheResponse<K>) -> Error {
    Error::UnexpectedResponse {
        expected,
        actual: actual.kind().to_string(),
    }
}

impl<K: ValueKey> RemoteCacheClient<K> {
    /// Client over a pool of connections. The pool must not be empty.
    pub fn new(connections: Vec<Arc<dyn MessageConnection>>) -> Result<Self> {
        if connections.is_empty() {
            return Err(Error::Config(
                "remote cache client needs at least one connection".into(),
            ));
        }
        Ok(Self {
            connections,
            next_connection: AtomicUsize::new(0),
            next_correlation: AtomicU64::new(1),
            _key: PhantomData,
        })
    }

    /// Client over a single connection
    pub fn single(connection: Arc<dyn MessageConnection>) -> Self {
        Self {
            connections: vec![connection],
            next_connection: AtomicUsize::new(0),
            next_correlation: AtomicU64::new(1),
            _key: PhantomData,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn connection(&self) -> &Arc<dyn MessageConnection> {
        let index = self.next_connection.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        &self.connections[index]
    }

    /// Send one request and decode its response. Server-side failures come
    /// back as [`Error::Remote`].
    pub async fn request(&self, request: CacheRequest<K>) -> Result<CacheResponse<K>> {
        let correlation_id = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let kind = request.kind();
        let frame = Envelope::new(correlation_id, request).encode()?;

        let response = self.connection().call(frame).await?;
        let envelope = Envelope::<CacheResponse<K>>::decode(&response)?;
        trace!(correlation_id, request = kind, response = envelope.body.kind(), "cache round trip");

        // A request the server could not decode is answered under the
        // unknown id; any other mismatch belongs to someone else.
        let undecodable = envelope.correlation_id == UNKNOWN_CORRELATION
            && matches!(envelope.body, CacheResponse::Failure { .. });
        if envelope.correlation_id != correlation_id && !undecodable {
            return Err(Error::UnexpectedResponse {
                expected: "matching correlation id",
                actual: envelope.correlation_id.to_string(),
            });
        }
        if let CacheResponse::Failure { message } = envelope.body {
            return Err(Error::Remote(message));
        }
        Ok(envelope.body)
    }

    pub async fn resolve_identifier(&self, key: &K) -> Result<Identifier> {
        match self
            .request(CacheRequest::ResolveIdentifier { key: key.clone() })
            .await?
        {
            CacheResponse::Identifier { id } => Ok(id),
            other => Err(unexpected("identifier", &other)),
        }
    }

    pub async fn resolve_identifiers(&self, keys: &[K]) -> Result<HashMap<K, Identifier>> {
        match self
            .request(CacheRequest::ResolveIdentifiers {
                keys: keys.to_vec(),
            })
            .await?
        {
            CacheResponse::Identifiers { ids } => Ok(ids.into_iter().collect()),
            other => Err(unexpected("identifiers", &other)),
        }
    }

    pub async fn fetch_value(&self, cache_key: &CacheKey, id: Identifier) -> Result<Option<Bytes>> {
        match self
            .request(CacheRequest::FetchValue {
                cache_key: cache_key.clone(),
                id,
            })
            .await?
        {
            CacheResponse::Value { data } => Ok(data),
            other => Err(unexpected("value", &other)),
        }
    }

    pub async fn fetch_values(
        &self,
        cache_key: &CacheKey,
        ids: &[Identifier],
    ) -> Result<HashMap<Identifier, Bytes>> {
        match self
            .request(CacheRequest::FetchValues {
                cache_key: cache_key.clone(),
                ids: ids.to_vec(),
            })
            .await?
        {
            CacheResponse::Values { values } => Ok(values.into_iter().collect()),
            other => Err(unexpected("values", &other)),
        }
    }

    pub async fn store_value(&self, cache_key: &CacheKey, id: Identifier, data: Bytes) -> Result<()> {
        match self
            .request(CacheRequest::StoreValue {
                cache_key: cache_key.clone(),
                id,
                data,
            })
            .await?
        {
            CacheResponse::Stored => Ok(()),
            other => Err(unexpected("stored", &other)),
        }
    }

    pub async fn store_values(
        &self,
        cache_key: &CacheKey,
        values: HashMap<Identifier, Bytes>,
    ) -> Result<()> {
        match self
            .request(CacheRequest::StoreValues {
                cache_key: cache_key.clone(),
                values: values.into_iter().collect(),
            })
            .await?
        {
            CacheResponse::Stored => Ok(()),
            other => Err(unexpected("stored", &other)),
        }
    }

    /// Delete both partitions of a cache key on the server.
    pub async fn purge(&self, cache_key: &CacheKey) -> Result<()> {
        match self
            .request(CacheRequest::Purge {
                cache_key: cache_key.clone(),
            })
            .await?
        {
            CacheResponse::Purged => Ok(()),
            other => Err(unexpected("purged", &other)),
        }
    }
}

// =============================================================================
// Remote Identifier Map
// =============================================================================

/// Identifier map answered by the server
pub struct RemoteIdentifierMap<K: ValueKey> {
    client: Arc<RemoteCacheClient<K>>,
}

impl<K: ValueKey> RemoteIdentifierMap<K> {
    pub fn new(client: Arc<RemoteCacheClient<K>>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<K: ValueKey> IdentifierMap<K> for RemoteIdentifierMap<K> {
    async fn get_identifier(&self, key: &K) -> Result<Identifier> {
        self.client.resolve_identifier(key).await
    }

    async fn get_identifiers(&self, keys: &[K]) -> Result<HashMap<K, Identifier>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        self.client.resolve_identifiers(keys).await
    }
}

// =============================================================================
// Remote Data Store
// =============================================================================

/// The server's shared store for one cache key
pub struct RemoteDataStore<K: ValueKey> {
    client: Arc<RemoteCacheClient<K>>,
    cache_key: CacheKey,
    name: String,
}

impl<K: ValueKey> RemoteDataStore<K> {
    pub fn new(client: Arc<RemoteCacheClient<K>>, cache_key: CacheKey) -> Self {
        let name = cache_key.store_name(Partition::Shared);
        Self {
            client,
            cache_key,
            name,
        }
    }

    pub fn cache_key(&self) -> &CacheKey {
        &self.cache_key
    }
}

#[async_trait]
impl<K: ValueKey> BinaryDataStore for RemoteDataStore<K> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn put(&self, id: Identifier, data: Bytes) -> Result<()> {
        self.client.store_value(&self.cache_key, id, data).await
    }

    async fn put_all(&self, entries: HashMap<Identifier, Bytes>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.client.store_values(&self.cache_key, entries).await
    }

    async fn get(&self, id: Identifier) -> Result<Option<Bytes>> {
        self.client.fetch_value(&self.cache_key, id).await
    }

    async fn get_all(&self, ids: &[Identifier]) -> Result<HashMap<Identifier, Bytes>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        self.client.fetch_values(&self.cache_key, ids).await
    }

    async fn delete(&self) -> Result<()> {
        debug!(cache = %self.cache_key, "purging remote cache");
        self.client.purge(&self.cache_key).await
    }
}

/// Factory for [`RemoteDataStore`]s. The server only hosts shared values, so
/// it must only be used for the shared partition.
pub struct RemoteStoreFactory<K: ValueKey> {
    client: Arc<RemoteCacheClient<K>>,
}

impl<K: ValueKey> RemoteStoreFactory<K> {
    pub fn new(client: Arc<RemoteCacheClient<K>>) -> Self {
        Self { client }
    }
}

impl<K: ValueKey> BinaryDataStoreFactory for RemoteStoreFactory<K> {
    fn create_store(
        &self,
        cache_key: &CacheKey,
        partition: Partition,
    ) -> Result<Arc<dyn BinaryDataStore>> {
        if partition != Partition::Shared {
            return Err(Error::Config(format!(
                "remote stores only host shared values, not {}",
                partition
            )));
        }
        Ok(Arc::new(RemoteDataStore::new(
            self.client.clone(),
            cache_key.clone(),
        )))
    }
}

// =============================================================================
// Remote Cache Source
// =============================================================================

/// Cache source for processes that talk to a cache server.
///
/// Identifiers are memoized locally. Each cache is wrapped in a
/// [`WriteThroughCache`], so repeated reads within a run stay in process.
pub struct RemoteCacheSource<K: ValueKey, V> {
    client: Arc<RemoteCacheClient<K>>,
    source: DefaultCacheSource<K, V>,
    front_caches: DashMap<CacheKey, Arc<WriteThroughCache<K, V>>>,
}

impl<K, V> RemoteCacheSource<K, V>
where
    K: ValueKey,
    V: Send + Sync + 'static,
{
    /// `private_factory` creates the process-local private stores.
    pub fn new(
        client: Arc<RemoteCacheClient<K>>,
        private_factory: Arc<dyn BinaryDataStoreFactory>,
        codec: Arc<dyn ValueCodec<V>>,
    ) -> Self {
        let identifiers: Arc<dyn IdentifierMap<K>> = Arc::new(CachingIdentifierMap::new(
            Arc::new(RemoteIdentifierMap::new(client.clone())),
        ));
        let registry = Arc::new(StoreRegistry::with_factories(
            Arc::new(RemoteStoreFactory::new(client.clone())),
            private_factory,
        ));
        Self {
            client,
            source: DefaultCacheSource::new(identifiers, registry, codec),
            front_caches: DashMap::new(),
        }
    }

    pub fn client(&self) -> &Arc<RemoteCacheClient<K>> {
        &self.client
    }

    pub fn identifier_map(&self) -> &Arc<dyn IdentifierMap<K>> {
        self.source.identifier_map()
    }

    /// Front cache of a cache key, if one has been handed out
    pub fn front_cache(&self, cache_key: &CacheKey) -> Option<Arc<WriteThroughCache<K, V>>> {
        self.front_caches.get(cache_key).map(|entry| entry.clone())
    }
}

#[async_trait]
impl<K, V> ComputationCacheSource<K, V> for RemoteCacheSource<K, V>
where
    K: ValueKey,
    V: Send + Sync + 'static,
{
    async fn get_cache(&self, cache_key: &CacheKey) -> Result<Arc<dyn ComputationCache<K, V>>> {
        if let Some(front) = self.front_caches.get(cache_key) {
            return Ok(front.clone());
        }
        let inner = self.source.get_cache(cache_key).await?;
        let front = self
            .front_caches
            .entry(cache_key.clone())
            .or_insert_with(|| Arc::new(WriteThroughCache::new(inner)))
            .clone();
        Ok(front)
    }

    async fn release_cache(&self, cache_key: &CacheKey) -> Result<()> {
        self.front_caches.remove(cache_key);
        self.source.release_cache(cache_key).await
    }

    async fn release_caches(&self, run_id: &str) -> Result<()> {
        self.front_caches.retain(|key, _| key.run_id() != run_id);
        self.source.release_caches(run_id).await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{InMemoryIdentifierMap, InMemoryStoreFactory};
    use crate::domain::ValueSpecification;
    use crate::remote::server::CacheServer;
    use crate::remote::transport::DirectConnection;
    use assert_matches::assert_matches;

    fn client() -> Arc<RemoteCacheClient<ValueSpecification>> {
        let server = Arc::new(CacheServer::<ValueSpecification>::new(
            Arc::new(InMemoryIdentifierMap::<ValueSpecification>::new()),
            Arc::new(StoreRegistry::new(Arc::new(InMemoryStoreFactory::new()))),
        ));
        Arc::new(RemoteCacheClient::single(Arc::new(DirectConnection::new(
            server,
        ))))
    }

    /// Connection that always answers with a fixed response
    struct Canned(CacheResponse<ValueSpecification>, u64);

    #[async_trait]
    impl MessageConnection for Canned {
        async fn call(&self, _request: Bytes) -> Result<Bytes> {
            Envelope::new(self.1, self.0.clone()).encode()
        }
    }

    #[test]
    fn test_empty_pool_is_rejected() {
        assert_matches!(
            RemoteCacheClient::<ValueSpecification>::new(Vec::new()),
            Err(Error::Config(_))
        );
    }

    #[tokio::test]
    async fn test_server_failure_surfaces_as_remote_error() {
        let client = RemoteCacheClient::<ValueSpecification>::single(Arc::new(Canned(
            CacheResponse::Failure {
                message: "disk full".into(),
            },
            1,
        )));
        assert_matches!(
            client.resolve_identifier(&ValueSpecification::new("PV", "A")).await,
            Err(Error::Remote(message)) if message == "disk full"
        );
    }

    #[tokio::test]
    async fn test_wrong_response_type() {
        let client =
            RemoteCacheClient::<ValueSpecification>::single(Arc::new(Canned(CacheResponse::Stored, 1)));
        assert_matches!(
            client.resolve_identifier(&ValueSpecification::new("PV", "A")).await,
            Err(Error::UnexpectedResponse { expected: "identifier", .. })
        );
    }

    #[tokio::test]
    async fn test_mismatched_correlation_id() {
        let client = RemoteCacheClient::<ValueSpecification>::single(Arc::new(Canned(
            CacheResponse::Purged,
            99,
        )));
        assert_matches!(
            client.purge(&CacheKey::new("r", "c")).await,
            Err(Error::UnexpectedResponse { .. })
        );
    }

    #[tokio::test]
    async fn test_stray_failure_is_not_reported_as_own() {
        let client = RemoteCacheClient::<ValueSpecification>::single(Arc::new(Canned(
            CacheResponse::Failure {
                message: "meant for request 42".into(),
            },
            42,
        )));
        assert_matches!(
            client.resolve_identifier(&ValueSpecification::new("PV", "A")).await,
            Err(Error::UnexpectedResponse { actual, .. }) if actual == "42"
        );
    }

    #[tokio::test]
    async fn test_failure_for_undecodable_request_is_reported() {
        let client = RemoteCacheClient::<ValueSpecification>::single(Arc::new(Canned(
            CacheResponse::Failure {
                message: "malformed request".into(),
            },
            UNKNOWN_CORRELATION,
        )));
        assert_matches!(
            client.purge(&CacheKey::new("r", "c")).await,
            Err(Error::Remote(message)) if message == "malformed request"
        );
    }

    #[tokio::test]
    async fn test_remote_factory_rejects_private_partition() {
        let factory = RemoteStoreFactory::new(client());
        let key = CacheKey::new("cycle-1", "ConfigA");
        assert!(factory.create_store(&key, Partition::Shared).is_ok());
        assert_matches!(
            factory.create_store(&key, Partition::Private),
            Err(Error::Config(_))
        );
    }

    #[tokio::test]
    async fn test_remote_store_round_trip() {
        let store = RemoteDataStore::new(client(), CacheKey::new("cycle-1", "ConfigA"));
        store.start().await.unwrap();
        store.put(7, Bytes::from_static(&[1, 2])).await.unwrap();

        assert_eq!(store.get(7).await.unwrap(), Some(Bytes::from_static(&[1, 2])));
        assert_eq!(store.get(8).await.unwrap(), None);
        assert!(store.get_all(&[]).await.unwrap().is_empty());

        store.delete().await.unwrap();
        assert_eq!(store.get(7).await.unwrap(), None);
    }
}
