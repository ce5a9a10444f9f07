//! Persistent Binary Data Store
//!
//! Embedded, page-structured storage on `redb`. One [`StorageEnvironment`] is
//! one database file under a storage root; every (cache key, partition) pair
//! is a named table inside it, so many caches share one open file.
//!
//! # Design
//!
//! - The environment counts open stores. The database file is opened by the
//!   first `start` and closed when the last store stops or is deleted.
//! - Each operation is one redb transaction; readers see either the previous
//!   or the new blob, never a torn one.
//! - Engine calls are blocking and run on tokio's blocking pool.
//! - `delete` is final. It waits for in-flight operations; afterwards reads
//!   see an empty store and writes fail, so a late write cannot recreate a
//!   dropped table.

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use redb::{
    Database, Durability, ReadableTable, ReadableTableMetadata, TableDefinition, TableError,
    TableHandle,
};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::domain::{
    BinaryDataStore, BinaryDataStoreFactory, CacheKey, Identifier, IdentifierMap, Partition,
    ValueKey,
};
use crate::error::{Error, Result};

/// File name of the database inside the storage root
pub const DATABASE_FILE: &str = "cache.redb";

const IDENTIFIERS: TableDefinition<&[u8], i64> = TableDefinition::new("identifiers");
const IDENTIFIER_SEQUENCE: TableDefinition<&str, i64> =
    TableDefinition::new("identifier_sequence");
const NEXT_IDENTIFIER: &str = "next";

fn blob_table(name: &str) -> TableDefinition<'_, i64, &'static [u8]> {
    TableDefinition::new(name)
}

// =============================================================================
// Storage Environment
// =============================================================================

#[derive(Default)]
struct EnvironmentState {
    database: Option<Arc<Database>>,
    open_stores: usize,
}

/// Shared on-disk environment hosting many named stores
pub struct StorageEnvironment {
    root: PathBuf,
    durable_writes: bool,
    state: Mutex<EnvironmentState>,
}

impl StorageEnvironment {
    /// Create an environment rooted at `root`. Nothing is opened until the
    /// first store starts.
    pub fn new(root: impl Into<PathBuf>, durable_writes: bool) -> Arc<Self> {
        Arc::new(Self {
            root: root.into(),
            durable_writes,
            state: Mutex::new(EnvironmentState::default()),
        })
    }

    /// Storage root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of stores currently holding the database open
    pub fn open_stores(&self) -> usize {
        self.state.lock().open_stores
    }

    /// Whether the database file is currently open
    pub fn is_open(&self) -> bool {
        self.state.lock().database.is_some()
    }

    fn durability(&self) -> Durability {
        if self.durable_writes {
            Durability::Immediate
        } else {
            Durability::None
        }
    }

    /// Register one more user of the database, opening it if needed.
    fn acquire(&self) -> Result<Arc<Database>> {
        let mut state = self.state.lock();
        let database = match &state.database {
            Some(database) => database.clone(),
            None => {
                std::fs::create_dir_all(&self.root)?;
                let path = self.root.join(DATABASE_FILE);
                let database = Arc::new(Database::create(&path).map_err(Error::storage)?);
                info!(path = %path.display(), "opened storage environment");
                state.database = Some(database.clone());
                database
            }
        };
        state.open_stores += 1;
        Ok(database)
    }

    /// Drop one user of the database, closing it after the last one.
    fn release(&self) {
        let mut state = self.state.lock();
        state.open_stores = state.open_stores.saturating_sub(1);
        if state.open_stores == 0 && state.database.take().is_some() {
            info!(root = %self.root.display(), "closed storage environment");
        }
    }

    /// Names of all tables in the environment, opening it briefly if needed.
    pub fn table_names(&self) -> Result<Vec<String>> {
        let database = self.acquire()?;
        let names = (|| -> Result<Vec<String>> {
            let txn = database.begin_read().map_err(Error::storage)?;
            let tables = txn.list_tables().map_err(Error::storage)?;
            Ok(tables.map(|handle| handle.name().to_string()).collect())
        })();
        drop(database);
        self.release();
        names
    }

    /// Remove every store by deleting the storage root.
    pub fn destroy(&self) -> Result<()> {
        let state = self.state.lock();
        if state.open_stores > 0 {
            return Err(Error::EnvironmentInUse {
                open_stores: state.open_stores,
            });
        }
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root)?;
            info!(root = %self.root.display(), "destroyed storage environment");
        }
        Ok(())
    }
}

// =============================================================================
// Persistent Data Store
// =============================================================================

/// One named store inside a [`StorageEnvironment`]
pub struct PersistentDataStore {
    name: String,
    environment: Arc<StorageEnvironment>,
    database: Mutex<Option<Arc<Database>>>,
    /// Held shared by every operation, exclusively by `delete`
    deleted: RwLock<bool>,
}

impl PersistentDataStore {
    pub fn new(environment: Arc<StorageEnvironment>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            environment,
            database: Mutex::new(None),
            deleted: RwLock::new(false),
        }
    }

    fn deleted_error(&self) -> Error {
        Error::StoreDeleted {
            store: self.name.clone(),
        }
    }

    /// Database handle, starting the store on first use.
    fn database(&self) -> Result<Arc<Database>> {
        let mut guard = self.database.lock();
        if let Some(database) = guard.as_ref() {
            return Ok(database.clone());
        }
        let database = self.environment.acquire()?;
        *guard = Some(database.clone());
        debug!(store = %self.name, "started persistent store");
        Ok(database)
    }

    /// Number of entries in the store
    pub async fn entry_count(&self) -> Result<u64> {
        let deleted = self.deleted.read().await;
        if *deleted {
            return Ok(0);
        }
        let database = self.database()?;
        let name = self.name.clone();
        tokio::task::spawn_blocking(move || {
            let txn = database.begin_read().map_err(Error::storage)?;
            match txn.open_table(blob_table(&name)) {
                Ok(table) => table.len().map_err(Error::storage),
                Err(TableError::TableDoesNotExist(_)) => Ok(0),
                Err(err) => Err(Error::storage(err)),
            }
        })
        .await?
    }

    async fn write(&self, entries: Vec<(Identifier, Bytes)>) -> Result<()> {
        let deleted = self.deleted.read().await;
        if *deleted {
            return Err(self.deleted_error());
        }
        if entries.is_empty() {
            return Ok(());
        }
        let database = self.database()?;
        let name = self.name.clone();
        let durability = self.environment.durability();
        tokio::task::spawn_blocking(move || {
            let mut txn = database.begin_write().map_err(Error::storage)?;
            txn.set_durability(durability);
            {
                let mut table = txn.open_table(blob_table(&name)).map_err(Error::storage)?;
                for (id, data) in &entries {
                    table.insert(*id, data.as_ref()).map_err(Error::storage)?;
                }
            }
            txn.commit().map_err(Error::storage)
        })
        .await?
    }

    async fn read(&self, ids: Vec<Identifier>) -> Result<HashMap<Identifier, Bytes>> {
        let deleted = self.deleted.read().await;
        if *deleted {
            return Ok(HashMap::new());
        }
        let database = self.database()?;
        let name = self.name.clone();
        tokio::task::spawn_blocking(move || {
            let txn = database.begin_read().map_err(Error::storage)?;
            let table = match txn.open_table(blob_table(&name)) {
                Ok(table) => table,
                Err(TableError::TableDoesNotExist(_)) => return Ok(HashMap::new()),
                Err(err) => return Err(Error::storage(err)),
            };
            let mut found = HashMap::with_capacity(ids.len());
            for id in ids {
                if let Some(guard) = table.get(id).map_err(Error::storage)? {
                    found.insert(id, Bytes::copy_from_slice(guard.value()));
                }
            }
            Ok(found)
        })
        .await?
    }
}

#[async_trait]
impl BinaryDataStore for PersistentDataStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<()> {
        if *self.deleted.read().await {
            return Err(self.deleted_error());
        }
        self.database().map(|_| ())
    }

    async fn stop(&self) -> Result<()> {
        if self.database.lock().take().is_some() {
            self.environment.release();
            debug!(store = %self.name, "stopped persistent store");
        }
        Ok(())
    }

    async fn put(&self, id: Identifier, data: Bytes) -> Result<()> {
        self.write(vec![(id, data)]).await
    }

    async fn put_all(&self, entries: HashMap<Identifier, Bytes>) -> Result<()> {
        self.write(entries.into_iter().collect()).await
    }

    async fn get(&self, id: Identifier) -> Result<Option<Bytes>> {
        Ok(self.read(vec![id]).await?.remove(&id))
    }

    async fn get_all(&self, ids: &[Identifier]) -> Result<HashMap<Identifier, Bytes>> {
        self.read(ids.to_vec()).await
    }

    async fn delete(&self) -> Result<()> {
        let mut deleted = self.deleted.write().await;
        if *deleted {
            return Ok(());
        }
        let database = self.database()?;
        let name = self.name.clone();
        let durability = self.environment.durability();
        let dropped = tokio::task::spawn_blocking(move || {
            let mut txn = database.begin_write().map_err(Error::storage)?;
            txn.set_durability(durability);
            let dropped = txn
                .delete_table(blob_table(&name))
                .map_err(Error::storage)?;
            txn.commit().map_err(Error::storage)?;
            Ok::<_, Error>(dropped)
        })
        .await??;
        debug!(store = %self.name, dropped, "deleted persistent store");
        *deleted = true;
        self.stop().await
    }
}

/// Factory placing every store in one shared environment
#[derive(Clone)]
pub struct PersistentStoreFactory {
    environment: Arc<StorageEnvironment>,
}

impl PersistentStoreFactory {
    pub fn new(environment: Arc<StorageEnvironment>) -> Self {
        Self { environment }
    }

    pub fn environment(&self) -> &Arc<StorageEnvironment> {
        &self.environment
    }
}

impl BinaryDataStoreFactory for PersistentStoreFactory {
    fn create_store(
        &self,
        cache_key: &CacheKey,
        partition: Partition,
    ) -> Result<Arc<dyn BinaryDataStore>> {
        Ok(Arc::new(PersistentDataStore::new(
            self.environment.clone(),
            cache_key.store_name(partition),
        )))
    }
}

// =============================================================================
// Persistent Identifier Map
// =============================================================================

/// Identifier map whose assignments survive restarts of the environment.
///
/// Keys are stored as their JSON encoding, so key types must serialize
/// deterministically (ordered maps, no floating point NaNs).
pub struct PersistentIdentifierMap<K: ValueKey> {
    environment: Arc<StorageEnvironment>,
    database: Arc<Database>,
    durability: Durability,
    memo: DashMap<K, Identifier>,
    released: AtomicBool,
    _key: PhantomData<fn() -> K>,
}

impl<K: ValueKey> PersistentIdentifierMap<K> {
    /// Open the map, holding the environment open until dropped.
    pub fn open(environment: Arc<StorageEnvironment>) -> Result<Self> {
        let database = environment.acquire()?;
        let durability = environment.durability();
        Ok(Self {
            environment,
            database,
            durability,
            memo: DashMap::new(),
            released: AtomicBool::new(false),
            _key: PhantomData,
        })
    }

    /// Look up or assign identifiers for encoded keys in one write
    /// transaction. redb serializes write transactions, which makes the
    /// lookup-then-insert below a compare-and-insert.
    fn assign(
        database: &Database,
        durability: Durability,
        encoded: &[Vec<u8>],
    ) -> Result<Vec<Identifier>> {
        let mut txn = database.begin_write().map_err(Error::storage)?;
        txn.set_durability(durability);
        let mut assigned = Vec::with_capacity(encoded.len());
        {
            let mut ids = txn.open_table(IDENTIFIERS).map_err(Error::storage)?;
            let mut sequence = txn.open_table(IDENTIFIER_SEQUENCE).map_err(Error::storage)?;
            let mut next = sequence
                .get(NEXT_IDENTIFIER)
                .map_err(Error::storage)?
                .map(|guard| guard.value())
                .unwrap_or(1);

            for key in encoded {
                let existing = ids
                    .get(key.as_slice())
                    .map_err(Error::storage)?
                    .map(|guard| guard.value());
                let id = match existing {
                    Some(id) => id,
                    None => {
                        let id = next;
                        next += 1;
                        ids.insert(key.as_slice(), id).map_err(Error::storage)?;
                        id
                    }
                };
                assigned.push(id);
            }
            sequence
                .insert(NEXT_IDENTIFIER, next)
                .map_err(Error::storage)?;
        }
        txn.commit().map_err(Error::storage)?;
        Ok(assigned)
    }

    async fn resolve(&self, keys: Vec<K>) -> Result<Vec<Identifier>> {
        let encoded = keys
            .iter()
            .map(serde_json::to_vec)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let database = self.database.clone();
        let durability = self.durability;
        let ids =
            tokio::task::spawn_blocking(move || Self::assign(&database, durability, &encoded))
                .await??;
        for (key, id) in keys.into_iter().zip(ids.iter()) {
            self.memo.insert(key, *id);
        }
        Ok(ids)
    }
}

impl<K: ValueKey> Drop for PersistentIdentifierMap<K> {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.environment.release();
        }
    }
}

#[async_trait]
impl<K: ValueKey> IdentifierMap<K> for PersistentIdentifierMap<K> {
    async fn get_identifier(&self, key: &K) -> Result<Identifier> {
        if let Some(id) = self.memo.get(key) {
            return Ok(*id);
        }
        let ids = self.resolve(vec![key.clone()]).await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| Error::Internal("identifier assignment returned nothing".into()))
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
            let ids = self.resolve(missing.clone()).await?;
            result.extend(missing.into_iter().zip(ids));
        }
        Ok(result)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ValueSpecification;

    fn environment(dir: &tempfile::TempDir) -> Arc<StorageEnvironment> {
        StorageEnvironment::new(dir.path().join("env"), false)
    }

    #[tokio::test]
    async fn test_shared_private_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let factory = PersistentStoreFactory::new(environment(&dir));
        let key = CacheKey::new("cycle-1", "ConfigA");
        let shared = factory.create_store(&key, Partition::Shared).unwrap();
        let private = factory.create_store(&key, Partition::Private).unwrap();
        shared.start().await.unwrap();
        private.start().await.unwrap();

        shared.put(7, Bytes::from_static(&[0x01, 0x02])).await.unwrap();
        assert_eq!(
            shared.get(7).await.unwrap(),
            Some(Bytes::from_static(&[0x01, 0x02]))
        );
        assert_eq!(private.get(7).await.unwrap(), None);

        shared.delete().await.unwrap();
        assert_eq!(shared.get(7).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_after_delete_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let env = environment(&dir);
        let store = PersistentDataStore::new(env.clone(), "r/c/shared");
        store.put(1, Bytes::from_static(b"before")).await.unwrap();
        store.delete().await.unwrap();

        assert!(matches!(
            store.put(7, Bytes::from_static(b"late")).await,
            Err(Error::StoreDeleted { .. })
        ));
        assert!(matches!(store.start().await, Err(Error::StoreDeleted { .. })));
        assert_eq!(store.get_all(&[1, 7]).await.unwrap().len(), 0);
        assert_eq!(store.entry_count().await.unwrap(), 0);
        store.delete().await.unwrap();

        assert_eq!(env.open_stores(), 0);
        assert!(!env.table_names().unwrap().contains(&"r/c/shared".to_string()));
        env.destroy().unwrap();
    }

    #[tokio::test]
    async fn test_slash_in_key_parts_keeps_tables_apart() {
        let dir = tempfile::tempdir().unwrap();
        let factory = PersistentStoreFactory::new(environment(&dir));
        let a = factory
            .create_store(&CacheKey::new("run/x", "cfg"), Partition::Shared)
            .unwrap();
        let b = factory
            .create_store(&CacheKey::new("run", "x/cfg"), Partition::Shared)
            .unwrap();

        a.put(1, Bytes::from_static(b"from-a")).await.unwrap();
        assert_eq!(b.get(1).await.unwrap(), None);
        assert_ne!(a.name(), b.name());
    }

    #[tokio::test]
    async fn test_bulk_put_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentDataStore::new(environment(&dir), "run/config/shared");
        store.start().await.unwrap();

        let entries: HashMap<Identifier, Bytes> = (1..=10)
            .map(|id| (id, Bytes::from(format!("value-{}", id))))
            .collect();
        store.put_all(entries).await.unwrap();

        let found = store.get_all(&[1, 5, 10, 11]).await.unwrap();
        assert_eq!(found.len(), 3);
        assert_eq!(found[&5], Bytes::from("value-5"));
        assert_eq!(store.entry_count().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_environment_reference_counting() {
        let dir = tempfile::tempdir().unwrap();
        let env = environment(&dir);
        let a = PersistentDataStore::new(env.clone(), "r/c/shared");
        let b = PersistentDataStore::new(env.clone(), "r/c/private");

        assert!(!env.is_open());
        a.start().await.unwrap();
        a.start().await.unwrap();
        b.start().await.unwrap();
        assert_eq!(env.open_stores(), 2);

        a.stop().await.unwrap();
        assert!(env.is_open());
        b.stop().await.unwrap();
        assert!(!env.is_open());
        assert_eq!(env.open_stores(), 0);
    }

    #[tokio::test]
    async fn test_data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let env = environment(&dir);
        let store = PersistentDataStore::new(env.clone(), "r/c/shared");
        store.put(3, Bytes::from_static(b"kept")).await.unwrap();
        store.stop().await.unwrap();
        assert!(!env.is_open());

        let reopened = PersistentDataStore::new(env.clone(), "r/c/shared");
        assert_eq!(
            reopened.get(3).await.unwrap(),
            Some(Bytes::from_static(b"kept"))
        );
    }

    #[tokio::test]
    async fn test_delete_drops_only_its_table() {
        let dir = tempfile::tempdir().unwrap();
        let env = environment(&dir);
        let a = PersistentDataStore::new(env.clone(), "r/a/shared");
        let b = PersistentDataStore::new(env.clone(), "r/b/shared");
        a.put(1, Bytes::from_static(b"a")).await.unwrap();
        b.put(1, Bytes::from_static(b"b")).await.unwrap();

        a.delete().await.unwrap();

        let names = env.table_names().unwrap();
        assert!(!names.contains(&"r/a/shared".to_string()));
        assert!(names.contains(&"r/b/shared".to_string()));
        assert_eq!(b.get(1).await.unwrap(), Some(Bytes::from_static(b"b")));
    }

    #[tokio::test]
    async fn test_destroy_requires_closed_environment() {
        let dir = tempfile::tempdir().unwrap();
        let env = environment(&dir);
        let store = PersistentDataStore::new(env.clone(), "r/c/shared");
        store.put(1, Bytes::from_static(b"x")).await.unwrap();

        assert!(matches!(
            env.destroy(),
            Err(Error::EnvironmentInUse { open_stores: 1 })
        ));

        store.stop().await.unwrap();
        env.destroy().unwrap();
        assert!(!env.root().exists());
    }

    #[tokio::test]
    async fn test_identifier_map_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let env = environment(&dir);
        let a = ValueSpecification::new("PV", "A");
        let b = ValueSpecification::new("PV", "B");

        let (id_a, id_b) = {
            let map = PersistentIdentifierMap::open(env.clone()).unwrap();
            let id_a = map.get_identifier(&a).await.unwrap();
            let id_b = map.get_identifier(&b).await.unwrap();
            assert_ne!(id_a, id_b);
            assert_eq!(map.get_identifier(&a).await.unwrap(), id_a);
            (id_a, id_b)
        };
        assert!(!env.is_open());

        let map = PersistentIdentifierMap::<ValueSpecification>::open(env.clone()).unwrap();
        let ids = map.get_identifiers(&[b.clone(), a.clone(), b.clone()]).await.unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[&a], id_a);
        assert_eq!(ids[&b], id_b);

        let c = ValueSpecification::new("PV", "C");
        let id_c = map.get_identifier(&c).await.unwrap();
        assert!(id_c > id_a.max(id_b));
    }
}
