//! Persistent store contract and the in-memory implementation.
//!
//! The cache only ever talks to durable storage through [`PersistentStore`]:
//! a keyed `load` on miss and an `update` when a dirty entry leaves the cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use cachedb_core::{describe_key, CachedEntity, FieldChanges, StoreError, StoreResult};
use serde_json::Value;

/// How a store applies a write-back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdatePolicy {
    /// Write every field of the current record.
    #[default]
    FullRow,
    /// Merge only the fields listed in [`FieldChanges`] into the stored row.
    ChangedFields,
}

/// Keyed access to durable storage.
///
/// Implementations must be thread-safe; the cache calls `load` from any
/// foreground task and `update` from its writer task.
#[async_trait]
pub trait PersistentStore<T: CachedEntity>: Send + Sync + 'static {
    /// Load the record stored under `key`.
    ///
    /// Returns [`StoreError::NotFound`] when no such row exists.
    async fn load(&self, key: &T::Key) -> StoreResult<T>;

    /// Persist `current` against the row identified by `baseline`'s key.
    ///
    /// `changes` lists the fields that differ from `baseline`; whether to
    /// write all fields or only those is the store's [`UpdatePolicy`].
    async fn update(&self, baseline: &T, current: &T, changes: &FieldChanges) -> StoreResult<()>;
}

/// Build the row to store for a write-back under `policy`.
///
/// With [`UpdatePolicy::ChangedFields`] and an existing row, the changed
/// fields are merged into it; otherwise `current` is stored whole.
pub fn merge_row<T: CachedEntity>(
    policy: UpdatePolicy,
    existing: Option<Value>,
    current: &T,
    changes: &FieldChanges,
) -> StoreResult<Value> {
    match (policy, existing) {
        (UpdatePolicy::ChangedFields, Some(mut row)) => {
            changes.apply_to(&mut row)?;
            Ok(row)
        }
        _ => serde_json::to_value(current).map_err(|e| StoreError::Serialization {
            reason: e.to_string(),
        }),
    }
}

/// One recorded call to [`PersistentStore::update`].
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRecord<K> {
    pub key: K,
    pub changes: FieldChanges,
}

/// In-memory store for tests and demos.
///
/// Counts loads and updates, keeps a log of applied updates, and can be told
/// to delay loads or fail the next few updates.
#[derive(Debug)]
pub struct InMemoryStore<T: CachedEntity> {
    rows: RwLock<HashMap<T::Key, T>>,
    policy: UpdatePolicy,
    load_delay: Option<Duration>,
    load_calls: AtomicU64,
    update_calls: AtomicU64,
    failing_updates: AtomicU32,
    update_log: Mutex<Vec<UpdateRecord<T::Key>>>,
}

impl<T: CachedEntity> Default for InMemoryStore<T> {
    fn default() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            policy: UpdatePolicy::default(),
            load_delay: None,
            load_calls: AtomicU64::new(0),
            update_calls: AtomicU64::new(0),
            failing_updates: AtomicU32::new(0),
            update_log: Mutex::new(Vec::new()),
        }
    }
}

impl<T: CachedEntity> InMemoryStore<T> {
    /// Create an empty store with the full-row policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding `rows`.
    pub fn with_rows(rows: impl IntoIterator<Item = T>) -> Self {
        let store = Self::default();
        {
            let mut map = store.rows.write().unwrap_or_else(|e| e.into_inner());
            for row in rows {
                map.insert(row.entity_key(), row);
            }
        }
        store
    }

    pub fn with_policy(mut self, policy: UpdatePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sleep this long inside every `load`.
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = Some(delay);
        self
    }

    pub fn policy(&self) -> UpdatePolicy {
        self.policy
    }

    /// Insert or replace a row directly, bypassing any cache.
    pub fn insert(&self, row: T) -> StoreResult<()> {
        let mut rows = self.rows.write().map_err(|_| StoreError::LockPoisoned)?;
        rows.insert(row.entity_key(), row);
        Ok(())
    }

    /// Read a row directly, bypassing any cache.
    pub fn row(&self, key: &T::Key) -> StoreResult<Option<T>> {
        let rows = self.rows.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(rows.get(key).map(|row| row.deep_copy()))
    }

    pub fn len(&self) -> usize {
        self.rows.read().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `load` calls so far, failed ones included.
    pub fn load_count(&self) -> u64 {
        self.load_calls.load(Ordering::SeqCst)
    }

    /// Number of `update` calls so far, failed ones included.
    pub fn update_count(&self) -> u64 {
        self.update_calls.load(Ordering::SeqCst)
    }

    /// Make the next `n` updates fail with a backend error.
    pub fn fail_next_updates(&self, n: u32) {
        self.failing_updates.store(n, Ordering::SeqCst);
    }

    /// Updates that were applied, oldest first.
    pub fn update_log(&self) -> Vec<UpdateRecord<T::Key>> {
        self.update_log
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    fn take_scripted_failure(&self) -> bool {
        self.failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl<T: CachedEntity> PersistentStore<T> for InMemoryStore<T> {
    async fn load(&self, key: &T::Key) -> StoreResult<T> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.load_delay {
            tokio::time::sleep(delay).await;
        }

        self.row(key)?.ok_or_else(|| StoreError::NotFound {
            entity: T::entity_name().to_string(),
            key: describe_key(key),
        })
    }

    async fn update(&self, baseline: &T, current: &T, changes: &FieldChanges) -> StoreResult<()> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let key = baseline.entity_key();

        if self.take_scripted_failure() {
            return Err(StoreError::UpdateFailed {
                entity: T::entity_name().to_string(),
                key: describe_key(&key),
                reason: "scripted failure".to_string(),
            });
        }

        let mut rows = self.rows.write().map_err(|_| StoreError::LockPoisoned)?;
        let next = match self.policy {
            UpdatePolicy::FullRow => current.deep_copy(),
            UpdatePolicy::ChangedFields => {
                let existing = rows
                    .get(&key)
                    .map(serde_json::to_value)
                    .transpose()
                    .map_err(|e| StoreError::Serialization {
                        reason: e.to_string(),
                    })?;
                let merged = merge_row(self.policy, existing, current, changes)?;
                serde_json::from_value(merged).map_err(|e| StoreError::Serialization {
                    reason: e.to_string(),
                })?
            }
        };
        rows.insert(key.clone(), next);
        drop(rows);

        if let Ok(mut log) = self.update_log.lock() {
            log.push(UpdateRecord {
                key,
                changes: changes.clone(),
            });
        }
        Ok(())
    }
}
