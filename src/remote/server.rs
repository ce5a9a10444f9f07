//! Cache Server
//!
//! Binds one identifier map and one store registry to any number of client
//! connections. The server is the single identifier authority for every
//! client, and the owner of the shared partition of every cache key.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use super::protocol::{CacheRequest, CacheResponse, Envelope, UNKNOWN_CORRELATION};
use super::transport::{serve_connection, FrameHandler};
use crate::cache::{DefaultCacheSource, StoreRegistry};
use crate::domain::{IdentifierMap, Partition, ValueKey};
use crate::error::{Error, Result};
use crate::metrics::{FAILURES, LATENCY, REQUESTS};

/// Remote cache protocol server
pub struct CacheServer<K: ValueKey> {
    identifiers: Arc<dyn IdentifierMap<K>>,
    registry: Arc<StoreRegistry>,
    request_timeout: Option<Duration>,
    _key: PhantomData<fn() -> K>,
}

impl<K: ValueKey> CacheServer<K> {
    pub fn new(identifiers: Arc<dyn IdentifierMap<K>>, registry: Arc<StoreRegistry>) -> Self {
        Self {
            identifiers,
            registry,
            request_timeout: None,
            _key: PhantomData,
        }
    }

    /// Fail requests that take longer than `timeout` to handle.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Serve the identifier map and stores of a local cache source.
    pub fn from_source<V: Send + Sync + 'static>(source: &DefaultCacheSource<K, V>) -> Self {
        Self::new(source.identifier_map().clone(), source.registry().clone())
    }

    pub fn registry(&self) -> &Arc<StoreRegistry> {
        &self.registry
    }

    /// Execute one request.
    pub async fn handle(&self, request: CacheRequest<K>) -> Result<CacheResponse<K>> {
        match request {
            CacheRequest::ResolveIdentifier { key } => {
                let id = self.identifiers.get_identifier(&key).await?;
                Ok(CacheResponse::Identifier { id })
            }
            CacheRequest::ResolveIdentifiers { keys } => {
                let ids = self.identifiers.get_identifiers(&keys).await?;
                Ok(CacheResponse::Identifiers {
                    ids: ids.into_iter().collect(),
                })
            }
            CacheRequest::FetchValue { cache_key, id } => {
                let store = self.registry.store(&cache_key, Partition::Shared).await?;
                let data = store.get(id).await?;
                Ok(CacheResponse::Value { data })
            }
            CacheRequest::FetchValues { cache_key, ids } => {
                let store = self.registry.store(&cache_key, Partition::Shared).await?;
                let values = store.get_all(&ids).await?;
                Ok(CacheResponse::Values {
                    values: values.into_iter().collect(),
                })
            }
            CacheRequest::StoreValue {
                cache_key,
                id,
                data,
            } => {
                let store = self.registry.store(&cache_key, Partition::Shared).await?;
                store.put(id, data).await?;
                Ok(CacheResponse::Stored)
            }
            CacheRequest::StoreValues { cache_key, values } => {
                let store = self.registry.store(&cache_key, Partition::Shared).await?;
                store
                    .put_all(values.into_iter().collect::<HashMap<_, _>>())
                    .await?;
                Ok(CacheResponse::Stored)
            }
            CacheRequest::Purge { cache_key } => {
                let released = self.registry.release(&cache_key).await?;
                info!(cache = %cache_key, released, "purged cache");
                Ok(CacheResponse::Purged)
            }
        }
    }

    /// Accept connections until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(addr = %listener.local_addr()?, "cache server listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            info!(%peer, "accepted cache connection");
            let handler: Arc<dyn FrameHandler> = self.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(handler, stream).await {
                    warn!(%peer, error = %e, "cache connection failed");
                }
            });
        }
    }
}

#[async_trait]
impl<K: ValueKey> FrameHandler for CacheServer<K> {
    async fn handle_frame(&self, request: Bytes) -> Bytes {
        let (correlation_id, response) = match Envelope::<CacheRequest<K>>::decode(&request) {
            Ok(envelope) => {
                let kind = envelope.body.kind();
                REQUESTS.with_label_values(&[kind]).inc();
                let started = Instant::now();
                let handled = match self.request_timeout {
                    Some(after) => tokio::time::timeout(after, self.handle(envelope.body))
                        .await
                        .unwrap_or(Err(Error::Timeout { after })),
                    None => self.handle(envelope.body).await,
                };
                let response = match handled {
                    Ok(response) => response,
                    Err(e) => {
                        error!(request = kind, error = %e, "cache request failed");
                        FAILURES.with_label_values(&[kind]).inc();
                        CacheResponse::Failure {
                            message: e.to_string(),
                        }
                    }
                };
                LATENCY
                    .with_label_values(&[kind])
                    .observe(started.elapsed().as_secs_f64());
                (envelope.correlation_id, response)
            }
            Err(e) => {
                warn!(error = %e, "undecodable cache request");
                FAILURES.with_label_values(&["undecodable"]).inc();
                (
                    UNKNOWN_CORRELATION,
                    CacheResponse::Failure {
                        message: e.to_string(),
                    },
                )
            }
        };

        debug!(correlation_id, response = response.kind(), "cache response");
        match Envelope::new(correlation_id, response).encode() {
            Ok(frame) => frame,
            Err(e) => {
                error!(error = %e, "cache response encoding failed");
                let failure = Envelope::new(
                    correlation_id,
                    CacheResponse::<K>::Failure {
                        message: format!("response encoding failed: {}", e),
                    },
                );
                // A failure with a plain message always encodes
                failure.encode().unwrap_or_default()
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{InMemoryIdentifierMap, InMemoryStoreFactory};
    use crate::domain::{CacheKey, ValueSpecification};

    fn server() -> CacheServer<ValueSpecification> {
        CacheServer::new(
            Arc::new(InMemoryIdentifierMap::<ValueSpecification>::new()),
            Arc::new(StoreRegistry::new(Arc::new(InMemoryStoreFactory::new()))),
        )
    }

    #[tokio::test]
    async fn test_identifier_requests() {
        let server = server();
        let key = ValueSpecification::new("PV", "A");

        let single = server
            .handle(CacheRequest::ResolveIdentifier { key: key.clone() })
            .await
            .unwrap();
        let id = match single {
            CacheResponse::Identifier { id } => id,
            other => panic!("unexpected response {:?}", other),
        };

        let bulk = server
            .handle(CacheRequest::ResolveIdentifiers {
                keys: vec![key.clone(), ValueSpecification::new("PV", "B")],
            })
            .await
            .unwrap();
        let ids = match bulk {
            CacheResponse::Identifiers { ids } => ids,
            other => panic!("unexpected response {:?}", other),
        };
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&(key, id)));
    }

    #[tokio::test]
    async fn test_value_requests_use_shared_partition() {
        let server = server();
        let cache_key = CacheKey::new("cycle-1", "ConfigA");

        server
            .handle(CacheRequest::StoreValue {
                cache_key: cache_key.clone(),
                id: 7,
                data: Bytes::from_static(&[1, 2]),
            })
            .await
            .unwrap();

        let pair = server.registry().stores(&cache_key).await.unwrap();
        assert_eq!(
            pair.shared.get(7).await.unwrap(),
            Some(Bytes::from_static(&[1, 2]))
        );
        assert_eq!(pair.private.get(7).await.unwrap(), None);

        let response = server
            .handle(CacheRequest::FetchValues {
                cache_key: cache_key.clone(),
                ids: vec![7, 8],
            })
            .await
            .unwrap();
        assert_eq!(
            response,
            CacheResponse::Values {
                values: vec![(7, Bytes::from_static(&[1, 2]))]
            }
        );
    }

    #[tokio::test]
    async fn test_purge_releases_stores() {
        let server = server();
        let cache_key = CacheKey::new("cycle-1", "ConfigA");
        server
            .handle(CacheRequest::StoreValues {
                cache_key: cache_key.clone(),
                values: vec![(1, Bytes::from_static(b"x"))],
            })
            .await
            .unwrap();

        let response = server
            .handle(CacheRequest::Purge {
                cache_key: cache_key.clone(),
            })
            .await
            .unwrap();
        assert_eq!(response, CacheResponse::Purged);
        assert!(server.registry().is_empty());

        let response = server
            .handle(CacheRequest::FetchValue { cache_key, id: 1 })
            .await
            .unwrap();
        assert_eq!(response, CacheResponse::Value { data: None });
    }

    #[tokio::test]
    async fn test_undecodable_frame_gets_failure() {
        let server = server();
        let frame = server.handle_frame(Bytes::from_static(b"not json")).await;
        let envelope = Envelope::<CacheResponse<ValueSpecification>>::decode(&frame).unwrap();

        assert_eq!(envelope.correlation_id, UNKNOWN_CORRELATION);
        assert!(matches!(envelope.body, CacheResponse::Failure { .. }));
    }
}
