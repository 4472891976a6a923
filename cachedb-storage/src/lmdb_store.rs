//! LMDB-backed persistent store.
//!
//! Uses the heed crate (Rust bindings for LMDB) to keep one row per key in a
//! memory-mapped database. Keys and rows are stored as JSON.
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions. The store uses:
//! - Read transactions for `load` and direct reads
//! - One write transaction per `update`, so the read-merge-write of a
//!   changed-fields update is atomic

use std::marker::PhantomData;
use std::path::Path;

use async_trait::async_trait;
use cachedb_core::{describe_key, CachedEntity, FieldChanges, StoreError, StoreResult};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use serde::Serialize;
use serde_json::Value;

use crate::store::{merge_row, PersistentStore, UpdatePolicy};

/// Error type for LMDB store setup and transactions.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbStoreError> for StoreError {
    fn from(e: LmdbStoreError) -> Self {
        StoreError::Backend {
            reason: e.to_string(),
        }
    }
}

impl From<LmdbStoreError> for cachedb_core::CacheDbError {
    fn from(e: LmdbStoreError) -> Self {
        cachedb_core::CacheDbError::Store(e.into())
    }
}

fn txn_err(e: heed::Error) -> StoreError {
    LmdbStoreError::Transaction(e.to_string()).into()
}

fn encode<V: Serialize + ?Sized>(value: &V) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StoreError::Serialization {
        reason: e.to_string(),
    })
}

/// LMDB-backed store for one entity type.
///
/// # Example
///
/// ```ignore
/// let store = LmdbStore::<User>::open("/tmp/users", 64)?;
/// store.insert(&user)?;
/// let cache = WriteBackCache::with_capacity(Arc::new(store), 128)?;
/// ```
pub struct LmdbStore<T: CachedEntity> {
    env: Env,
    db: Database<Bytes, Bytes>,
    policy: UpdatePolicy,
    _entity: PhantomData<fn() -> T>,
}

impl<T: CachedEntity> LmdbStore<T> {
    /// Open (or create) a store.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbStoreError> {
        let map_size = max_size_mb.checked_mul(1024 * 1024).ok_or_else(|| {
            LmdbStoreError::EnvOpen(format!("map size of {max_size_mb} MB overflows usize"))
        })?;
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per directory by this store
        // and never mapped by another process while it is alive.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbStoreError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbStoreError::DbOpen(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        Ok(Self {
            env,
            db,
            policy: UpdatePolicy::default(),
            _entity: PhantomData,
        })
    }

    pub fn with_policy(mut self, policy: UpdatePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Insert or replace a row directly.
    pub fn insert(&self, row: &T) -> StoreResult<()> {
        let key = encode(&row.entity_key())?;
        let bytes = encode(row)?;

        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        self.db.put(&mut wtxn, &key, &bytes).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)
    }

    /// Read a row directly.
    pub fn row(&self, key: &T::Key) -> StoreResult<Option<T>> {
        let encoded = encode(key)?;
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        match self.db.get(&rtxn, &encoded).map_err(txn_err)? {
            Some(bytes) => serde_json::from_slice(bytes)
                .map(Some)
                .map_err(|e| StoreError::Serialization {
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    /// Delete a row. Returns whether it existed.
    pub fn remove(&self, key: &T::Key) -> StoreResult<bool> {
        let encoded = encode(key)?;
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let deleted = self.db.delete(&mut wtxn, &encoded).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(deleted)
    }

    /// Number of stored rows.
    pub fn len(&self) -> StoreResult<u64> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        self.db.len(&rtxn).map_err(txn_err)
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl<T: CachedEntity> PersistentStore<T> for LmdbStore<T> {
    async fn load(&self, key: &T::Key) -> StoreResult<T> {
        self.row(key)?.ok_or_else(|| StoreError::NotFound {
            entity: T::entity_name().to_string(),
            key: describe_key(key),
        })
    }

    async fn update(&self, baseline: &T, current: &T, changes: &FieldChanges) -> StoreResult<()> {
        let key = encode(&baseline.entity_key())?;

        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let existing: Option<Value> = match self.db.get(&wtxn, &key).map_err(txn_err)? {
            Some(bytes) => Some(serde_json::from_slice(bytes).map_err(|e| {
                StoreError::Serialization {
                    reason: e.to_string(),
                }
            })?),
            None => None,
        };

        let row = merge_row(self.policy, existing, current, changes)?;
        let bytes = encode(&row)?;
        self.db.put(&mut wtxn, &key, &bytes).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachedb_core::deep_copy_struct;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ledger {
        id: String,
        owner: String,
        balance: i64,
    }

    deep_copy_struct!(Ledger { id, owner, balance });

    impl CachedEntity for Ledger {
        type Key = String;

        fn entity_name() -> &'static str {
            "Ledger"
        }

        fn entity_key(&self) -> String {
            self.id.clone()
        }
    }

    fn ledger(id: &str, owner: &str, balance: i64) -> Ledger {
        Ledger {
            id: id.to_string(),
            owner: owner.to_string(),
            balance,
        }
    }

    fn create_test_store() -> (LmdbStore<Ledger>, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LmdbStore::open(temp_dir.path(), 10).expect("Failed to open store");
        (store, temp_dir)
    }

    #[test]
    fn test_oversized_map_is_rejected() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let result = LmdbStore::<Ledger>::open(temp_dir.path().join("db"), usize::MAX);
        assert!(matches!(result, Err(LmdbStoreError::EnvOpen(_))));
        // Rejected before touching the filesystem.
        assert!(!temp_dir.path().join("db").exists());
    }

    #[tokio::test]
    async fn test_insert_and_load() {
        let (store, _temp_dir) = create_test_store();
        store.insert(&ledger("a", "zhang", 10)).expect("insert should succeed");

        let loaded = store.load(&"a".to_string()).await.expect("load should succeed");
        assert_eq!(loaded, ledger("a", "zhang", 10));
        assert_eq!(store.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_load_missing_is_not_found() {
        let (store, _temp_dir) = create_test_store();
        let err = store.load(&"nope".to_string()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_full_row_update() {
        let (store, _temp_dir) = create_test_store();
        store.insert(&ledger("a", "zhang", 10)).unwrap();

        let baseline = ledger("a", "zhang", 10);
        let current = ledger("a", "li", 0);
        let changes = FieldChanges::between(&baseline, &current).unwrap();
        store.update(&baseline, &current, &changes).await.expect("update should succeed");

        assert_eq!(store.row(&"a".to_string()).unwrap(), Some(current));
    }

    #[tokio::test]
    async fn test_changed_fields_update_keeps_other_columns() {
        let (store, _temp_dir) = create_test_store();
        let store = store.with_policy(UpdatePolicy::ChangedFields);
        // Balance was moved by another writer after the baseline was taken.
        store.insert(&ledger("a", "zhang", 75)).unwrap();

        let baseline = ledger("a", "zhang", 10);
        let current = ledger("a", "li", 10);
        let changes = FieldChanges::between(&baseline, &current).unwrap();
        store.update(&baseline, &current, &changes).await.unwrap();

        assert_eq!(
            store.row(&"a".to_string()).unwrap(),
            Some(ledger("a", "li", 75))
        );
    }

    #[tokio::test]
    async fn test_remove() {
        let (store, _temp_dir) = create_test_store();
        store.insert(&ledger("a", "zhang", 10)).unwrap();
        assert!(store.remove(&"a".to_string()).unwrap());
        assert!(!store.remove(&"a".to_string()).unwrap());
        assert!(store.is_empty().unwrap());
    }
}
