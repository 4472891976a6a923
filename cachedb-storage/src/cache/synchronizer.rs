//! Keeps baselines in step with the cache's entries.
//!
//! Every time an entry enters the cache a deep copy is recorded as its
//! baseline. When it leaves, the live value is compared against that
//! baseline and, if it differs, a write-back job is queued.

use std::sync::Arc;

use cachedb_core::{describe_key, CacheDbError, CachedEntity, FieldChanges, SyncError};

use super::live::LiveEntry;
use super::registry::SnapshotRegistry;
use super::stats::CacheMetrics;
use super::write_back::{ExitReason, WriteBackJob, WriteBackQueue};

pub(crate) struct Synchronizer<T: CachedEntity> {
    baselines: SnapshotRegistry<T>,
    queue: WriteBackQueue<T>,
    metrics: Arc<CacheMetrics>,
}

impl<T: CachedEntity> Synchronizer<T> {
    pub(crate) fn new(queue: WriteBackQueue<T>, metrics: Arc<CacheMetrics>) -> Self {
        Self {
            baselines: SnapshotRegistry::new(),
            queue,
            metrics,
        }
    }

    /// A value was loaded from the store on a miss.
    pub(crate) fn on_loaded(&mut self, key: &T::Key, value: &T) {
        self.baselines.record(key.clone(), value);
        tracing::debug!(entity = T::entity_name(), key = ?key, "Loaded entry into cache");
    }

    /// A value was placed in the cache by `set`.
    pub(crate) fn on_added(&mut self, key: &T::Key, value: &T) {
        self.baselines.record(key.clone(), value);
        tracing::debug!(entity = T::entity_name(), key = ?key, "Added entry to cache");
    }

    /// A `set` displaced an existing live value. Its baseline has already
    /// been overwritten and the old value is not written back.
    pub(crate) fn on_replaced(&mut self, key: &T::Key) {
        tracing::debug!(
            entity = T::entity_name(),
            key = ?key,
            "Replaced cached entry, previous value dropped"
        );
    }

    /// Whether the live value differs from its baseline.
    pub(crate) fn is_dirty(&self, key: &T::Key, live: &LiveEntry<T>) -> Result<bool, SyncError> {
        let baseline = self.baselines.lookup(key)?;
        Ok(live.copy_for_write_back() != *baseline)
    }

    /// An entry left the cache. Queues a write-back if it changed.
    ///
    /// Never fails: problems are logged and counted, and the baseline is
    /// always forgotten.
    pub(crate) fn on_exit(&mut self, key: T::Key, live: LiveEntry<T>, reason: ExitReason) {
        let counter = match reason {
            ExitReason::Evicted => &self.metrics.evictions,
            ExitReason::Expired => &self.metrics.expirations,
            ExitReason::Purged => &self.metrics.purged,
        };
        CacheMetrics::incr(counter);

        let Some(baseline) = self.baselines.forget(&key) else {
            CacheMetrics::incr(&self.metrics.snapshot_misses);
            let err = SyncError::SnapshotMissing {
                key: describe_key(&key),
            };
            tracing::error!(
                entity = T::entity_name(),
                reason = %reason,
                error = %err,
                "Skipping write-back"
            );
            return;
        };

        let current = live.copy_for_write_back();
        if current == baseline {
            CacheMetrics::incr(&self.metrics.clean_exits);
            tracing::trace!(
                entity = T::entity_name(),
                key = ?key,
                reason = %reason,
                "Entry left cache unchanged"
            );
            return;
        }

        let changes = match FieldChanges::between(&baseline, &current) {
            Ok(changes) => changes,
            Err(source) => {
                CacheMetrics::incr(&self.metrics.write_back_failures);
                let err = CacheDbError::StoreWrite {
                    key: describe_key(&key),
                    attempts: 0,
                    source,
                };
                tracing::error!(entity = T::entity_name(), error = %err, "Write-back abandoned");
                return;
            }
        };

        tracing::debug!(
            entity = T::entity_name(),
            key = ?key,
            reason = %reason,
            changed = changes.len(),
            "Queueing write-back"
        );

        let job = WriteBackJob {
            key,
            baseline,
            current,
            changes,
            reason,
        };
        if let Err(e) = self.queue.enqueue(job) {
            CacheMetrics::incr(&self.metrics.write_back_failures);
            tracing::error!(entity = T::entity_name(), error = %e, "Write-back dropped");
        }
    }

    pub(crate) fn baseline_count(&self) -> usize {
        self.baselines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use cachedb_core::{deep_copy_struct, RetryConfig};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: u32,
        body: String,
    }

    deep_copy_struct!(Note { id, body });

    impl CachedEntity for Note {
        type Key = u32;

        fn entity_name() -> &'static str {
            "Note"
        }

        fn entity_key(&self) -> u32 {
            self.id
        }
    }

    fn note(id: u32, body: &str) -> Note {
        Note {
            id,
            body: body.to_string(),
        }
    }

    fn synchronizer(store: Arc<InMemoryStore<Note>>) -> (Synchronizer<Note>, WriteBackQueue<Note>) {
        let metrics = Arc::new(CacheMetrics::new());
        let (queue, _writer) = WriteBackQueue::spawn(
            &tokio::runtime::Handle::current(),
            store,
            RetryConfig::default(),
            Arc::clone(&metrics),
        );
        (Synchronizer::new(queue.clone(), metrics), queue)
    }

    #[tokio::test]
    async fn test_dirty_exit_writes_back() {
        let store = Arc::new(InMemoryStore::with_rows([note(1, "draft")]));
        let (mut sync, queue) = synchronizer(Arc::clone(&store));

        let live = LiveEntry::new(note(1, "draft"));
        sync.on_loaded(&1, &live.read().unwrap());
        live.update(|n| n.body = "final".to_string()).unwrap();
        assert_eq!(sync.is_dirty(&1, &live), Ok(true));

        sync.on_exit(1, live, ExitReason::Evicted);
        queue.flush().await.unwrap();

        assert_eq!(store.row(&1).unwrap(), Some(note(1, "final")));
        assert_eq!(sync.baseline_count(), 0);
        assert_eq!(sync.metrics.snapshot(0).evictions, 1);
    }

    #[tokio::test]
    async fn test_clean_exit_skips_store() {
        let store = Arc::new(InMemoryStore::with_rows([note(1, "draft")]));
        let (mut sync, queue) = synchronizer(Arc::clone(&store));

        let live = LiveEntry::new(note(1, "draft"));
        sync.on_added(&1, &note(1, "draft"));
        assert_eq!(sync.is_dirty(&1, &live), Ok(false));
        sync.on_exit(1, live, ExitReason::Purged);
        queue.flush().await.unwrap();

        assert_eq!(store.update_count(), 0);
        let stats = sync.metrics.snapshot(0);
        assert_eq!(stats.clean_exits, 1);
        assert_eq!(stats.purged, 1);
    }

    #[tokio::test]
    async fn test_missing_baseline_is_counted_not_written() {
        let store = Arc::new(InMemoryStore::<Note>::new());
        let (mut sync, queue) = synchronizer(Arc::clone(&store));

        let live = LiveEntry::new(note(4, "orphan"));
        assert!(matches!(
            sync.is_dirty(&4, &live),
            Err(SyncError::SnapshotMissing { .. })
        ));
        sync.on_exit(4, live, ExitReason::Expired);
        queue.flush().await.unwrap();

        assert_eq!(store.update_count(), 0);
        let stats = sync.metrics.snapshot(0);
        assert_eq!(stats.snapshot_misses, 1);
        assert_eq!(stats.expirations, 1);
    }
}
