//! The write-back cache over the LMDB store.

use std::sync::Arc;

use cachedb_core::CacheConfig;
use cachedb_storage::{LmdbStore, UpdatePolicy, WriteBackCache};
use cachedb_test_utils::{fixtures, init_tracing, User};
use tempfile::TempDir;

fn open_store(dir: &TempDir) -> LmdbStore<User> {
    LmdbStore::open(dir.path(), 10).expect("Failed to open store")
}

#[tokio::test]
async fn test_write_back_survives_reopen() {
    init_tracing();
    let temp_dir = TempDir::new().expect("Failed to create temp dir");

    {
        let store = open_store(&temp_dir);
        store.insert(&fixtures::zhang()).unwrap();

        let cache: WriteBackCache<User, _> =
            WriteBackCache::new(Arc::new(store), CacheConfig::new(16)).unwrap();
        cache
            .get(&1)
            .await
            .unwrap()
            .update(|u| u.name = "Li".to_string())
            .unwrap();
        cache.set(2, fixtures::user(2, "Chen", 33)).unwrap();
        cache.get(&2).await.unwrap().update(|u| u.age = 34).unwrap();

        cache.shutdown().await.unwrap();
    }

    let reopened = open_store(&temp_dir);
    assert_eq!(reopened.row(&1).unwrap(), Some(fixtures::user(1, "Li", 19)));
    // Rows first seen through `set` are created by the write-back.
    assert_eq!(reopened.row(&2).unwrap(), Some(fixtures::user(2, "Chen", 34)));
    assert_eq!(reopened.len().unwrap(), 2);
}

#[tokio::test]
async fn test_changed_fields_policy_through_cache() {
    init_tracing();
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let store = Arc::new(open_store(&temp_dir).with_policy(UpdatePolicy::ChangedFields));
    store.insert(&fixtures::zhang()).unwrap();

    let cache: WriteBackCache<User, _> =
        WriteBackCache::new(Arc::clone(&store), CacheConfig::new(16)).unwrap();
    cache.get(&1).await.unwrap().update(|u| u.age = 0).unwrap();
    store.insert(&fixtures::user(1, "Zhao", 19)).unwrap();
    cache.purge_all().await.unwrap();

    assert_eq!(store.row(&1).unwrap(), Some(fixtures::user(1, "Zhao", 0)));
}

#[tokio::test]
async fn test_missing_row_is_load_error() {
    init_tracing();
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let cache: WriteBackCache<User, _> =
        WriteBackCache::with_capacity(Arc::new(open_store(&temp_dir)), 4).unwrap();

    let err = cache.get(&404).await.unwrap_err();
    assert!(matches!(
        err,
        cachedb_core::CacheDbError::Load { ref source, .. } if source.is_not_found()
    ));
    assert!(cache.is_empty());
}
