//! Baseline snapshots, one per cached key.

use std::collections::HashMap;

use cachedb_core::{describe_key, CachedEntity, SyncError};

/// Keyed store of baseline copies.
///
/// Owned by the synchronizer and only touched under the cache's state lock,
/// so a baseline is never read while it is being recorded or forgotten.
pub struct SnapshotRegistry<T: CachedEntity> {
    baselines: HashMap<T::Key, T>,
}

impl<T: CachedEntity> Default for SnapshotRegistry<T> {
    fn default() -> Self {
        Self {
            baselines: HashMap::new(),
        }
    }
}

impl<T: CachedEntity> SnapshotRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a deep copy of `value` as the baseline for `key`, replacing any
    /// previous one.
    pub fn record(&mut self, key: T::Key, value: &T) {
        self.baselines.insert(key, value.deep_copy());
    }

    /// Remove and return the baseline for `key`.
    pub fn forget(&mut self, key: &T::Key) -> Option<T> {
        self.baselines.remove(key)
    }

    /// The baseline for `key`.
    pub fn lookup(&self, key: &T::Key) -> Result<&T, SyncError> {
        self.baselines
            .get(key)
            .ok_or_else(|| SyncError::SnapshotMissing {
                key: describe_key(key),
            })
    }

    pub fn contains(&self, key: &T::Key) -> bool {
        self.baselines.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.baselines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.baselines.is_empty()
    }

    pub fn clear(&mut self) {
        self.baselines.clear();
    }
}
