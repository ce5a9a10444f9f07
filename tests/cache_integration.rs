//! Cache Stack Integration Tests
//!
//! Exercises the cache source over both store backends, the compressing codec
//! and the write-through front cache together.

use std::sync::Arc;

use viewcache::cache::{
    DefaultCacheSource, InMemoryIdentifierMap, InMemoryStoreFactory, JsonCodec, Lz4Codec,
    PersistentIdentifierMap, PersistentStoreFactory, StorageEnvironment, StoreRegistry,
    WriteThroughCache,
};
use viewcache::domain::{
    CacheKey, CacheSelectHint, ComputationCache, ComputationCacheSource, ComputedValue,
    IdentifierMap, ValueSpecification,
};

type Spec = ValueSpecification;

fn spec(target: &str) -> Spec {
    ValueSpecification::new("Present Value", target).with_property("Currency", "USD")
}

fn curve(points: usize) -> Vec<f64> {
    (0..points).map(|i| 0.01 + i as f64 * 0.0005).collect()
}

fn persistent_source(
    environment: Arc<StorageEnvironment>,
) -> DefaultCacheSource<Spec, Vec<f64>> {
    let identifiers: Arc<dyn IdentifierMap<Spec>> = Arc::new(
        PersistentIdentifierMap::<Spec>::open(environment.clone()).unwrap(),
    );
    DefaultCacheSource::new(
        identifiers,
        Arc::new(StoreRegistry::new(Arc::new(PersistentStoreFactory::new(
            environment,
        )))),
        Arc::new(Lz4Codec::new(JsonCodec::<Vec<f64>>::new())),
    )
}

// =============================================================================
// In-Memory Stack
// =============================================================================

mod memory_tests {
    use super::*;

    fn source() -> DefaultCacheSource<Spec, Vec<f64>> {
        DefaultCacheSource::new(
            Arc::new(InMemoryIdentifierMap::<Spec>::new()),
            Arc::new(StoreRegistry::new(Arc::new(InMemoryStoreFactory::new()))),
            Arc::new(Lz4Codec::new(JsonCodec::<Vec<f64>>::new())),
        )
    }

    #[tokio::test]
    async fn test_configurations_are_isolated() {
        let source = source();
        let config_a = source
            .get_cache(&CacheKey::new("cycle-1", "ConfigA"))
            .await
            .unwrap();
        let config_b = source
            .get_cache(&CacheKey::new("cycle-1", "ConfigB"))
            .await
            .unwrap();

        config_a
            .put_shared_value(&ComputedValue::new(spec("USD-OIS"), curve(400)))
            .await
            .unwrap();

        assert_eq!(
            config_a.get_value(&spec("USD-OIS")).await.unwrap().as_deref(),
            Some(&curve(400))
        );
        assert_eq!(config_b.get_value(&spec("USD-OIS")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_release_run_drops_every_configuration() {
        let source = source();
        for config in ["ConfigA", "ConfigB"] {
            let cache = source
                .get_cache(&CacheKey::new("cycle-1", config))
                .await
                .unwrap();
            cache
                .put_private_value(&ComputedValue::new(spec("EUR-OIS"), curve(10)))
                .await
                .unwrap();
        }
        source
            .get_cache(&CacheKey::new("cycle-2", "ConfigA"))
            .await
            .unwrap();
        assert_eq!(source.registry().len(), 3);

        source.release_caches("cycle-1").await.unwrap();
        assert_eq!(source.registry().keys_for_run("cycle-1"), Vec::<CacheKey>::new());
        assert_eq!(source.registry().len(), 1);

        // A fresh cache for a released key starts empty
        let cache = source
            .get_cache(&CacheKey::new("cycle-1", "ConfigA"))
            .await
            .unwrap();
        assert_eq!(cache.get_value(&spec("EUR-OIS")).await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_front_cache_collapses_concurrent_readers() {
        let source = source();
        let inner = source
            .get_cache(&CacheKey::new("cycle-1", "ConfigA"))
            .await
            .unwrap();
        inner
            .put_shared_value(&ComputedValue::new(spec("GBP-OIS"), curve(50)))
            .await
            .unwrap();
        let front = Arc::new(WriteThroughCache::new(inner));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let front = front.clone();
            handles.push(tokio::spawn(async move {
                front.get_value(&spec("GBP-OIS")).await.unwrap().unwrap()
            }));
        }
        let mut values = Vec::new();
        for handle in handles {
            values.push(handle.await.unwrap());
        }
        for value in &values[1..] {
            assert!(Arc::ptr_eq(value, &values[0]));
        }

        let snapshot = front.metrics().snapshot();
        assert_eq!(snapshot.inner_calls, 1);
        assert_eq!(snapshot.hits + snapshot.misses + snapshot.coalesced, 16);
    }
}

// =============================================================================
// Persistent Stack
// =============================================================================

mod persistent_tests {
    use super::*;

    #[tokio::test]
    async fn test_values_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let cache_key = CacheKey::new("cycle-1", "ConfigA");
        let hint = CacheSelectHint::private_values(vec![spec("Scratch")]);

        {
            let environment = StorageEnvironment::new(dir.path(), true);
            let source = persistent_source(environment.clone());
            let cache = source.get_cache(&cache_key).await.unwrap();
            cache
                .put_values(
                    &[
                        ComputedValue::new(spec("USD-OIS"), curve(2000)),
                        ComputedValue::new(spec("Scratch"), vec![1.0]),
                    ],
                    &hint,
                )
                .await
                .unwrap();

            source.registry().shutdown().await.unwrap();
            drop(cache);
            drop(source);
            assert!(!environment.is_open());
        }

        let environment = StorageEnvironment::new(dir.path(), true);
        let source = persistent_source(environment.clone());
        let cache = source.get_cache(&cache_key).await.unwrap();

        let values = cache
            .get_values_with_hint(&[spec("USD-OIS"), spec("Scratch"), spec("Missing")], &hint)
            .await
            .unwrap();
        assert_eq!(values.len(), 3);
        for (key, value) in values {
            match key.target.as_str() {
                "USD-OIS" => assert_eq!(value.as_deref(), Some(&curve(2000))),
                "Scratch" => assert_eq!(value.as_deref(), Some(&vec![1.0])),
                _ => assert_eq!(value, None),
            }
        }

        source.release_cache(&cache_key).await.unwrap();
        let names = environment.table_names().unwrap();
        assert!(!names.iter().any(|name| name.starts_with("cycle-1/")));
    }

    #[tokio::test]
    async fn test_destroy_after_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("env");
        let environment = StorageEnvironment::new(&root, false);
        let source = persistent_source(environment.clone());
        let cache = source
            .get_cache(&CacheKey::new("cycle-1", "ConfigA"))
            .await
            .unwrap();
        cache
            .put_shared_value(&ComputedValue::new(spec("JPY-OIS"), curve(5)))
            .await
            .unwrap();

        assert!(environment.destroy().is_err());

        source.registry().shutdown().await.unwrap();
        drop(cache);
        drop(source);
        environment.destroy().unwrap();
        assert!(!root.exists());
    }
}
