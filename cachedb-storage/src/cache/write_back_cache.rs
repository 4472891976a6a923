//! The cache handle.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use cachedb_core::{
    describe_key, CacheConfig, CacheDbError, CacheDbResult, CachedEntity, ConfigError, SyncError,
};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::core::{BoundedCore, Departure, Lookup};
use super::live::LiveEntry;
use super::stats::{CacheMetrics, CacheStats};
use super::synchronizer::Synchronizer;
use super::write_back::{ExitReason, WriteBackQueue};
use crate::store::PersistentStore;

/// Result of one in-flight load, shared by every miss that joined it.
type LoadGate<T> = Arc<tokio::sync::OnceCell<CacheDbResult<LiveEntry<T>>>>;

/// Everything guarded by the state mutex.
struct CacheState<T: CachedEntity> {
    core: BoundedCore<T::Key, T>,
    sync: Synchronizer<T>,
    in_flight: HashMap<T::Key, LoadGate<T>>,
}

impl<T: CachedEntity> CacheState<T> {
    /// A fresh entry under `key`. An expired one is sent down the exit path.
    fn lookup_fresh(&mut self, key: &T::Key, now: Instant) -> Option<LiveEntry<T>> {
        match self.core.lookup(key, now) {
            Lookup::Hit(live) => Some(live),
            Lookup::Expired(live) => {
                self.sync.on_exit(key.clone(), live, ExitReason::Expired);
                None
            }
            Lookup::Miss => None,
        }
    }

    /// Put `live` in the core and settle whatever it displaced.
    fn install(&mut self, key: T::Key, live: LiveEntry<T>, now: Instant) {
        match self.core.insert(key.clone(), live, now) {
            Some(Departure::Evicted(old_key, old)) => {
                self.sync.on_exit(old_key, old, ExitReason::Evicted);
            }
            Some(Departure::Replaced(_)) => self.sync.on_replaced(&key),
            None => {}
        }
    }

    fn drain_with(&mut self, drained: Vec<(T::Key, LiveEntry<T>)>, reason: ExitReason) -> usize {
        let count = drained.len();
        for (key, live) in drained {
            self.sync.on_exit(key, live, reason);
        }
        count
    }

    /// Drop the in-flight gate for `key` unless a newer one replaced it.
    fn release_gate(&mut self, key: &T::Key, gate: &LoadGate<T>) {
        if self
            .in_flight
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, gate))
        {
            self.in_flight.remove(key);
        }
    }
}

struct Inner<T: CachedEntity, S> {
    state: Mutex<CacheState<T>>,
    store: Arc<S>,
    queue: WriteBackQueue<T>,
    metrics: Arc<CacheMetrics>,
    config: CacheConfig,
    writer: Mutex<Option<JoinHandle<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    /// Held by the sweeper while it holds a strong reference.
    sweep_lock: Arc<Mutex<()>>,
}

impl<T: CachedEntity, S> Inner<T, S> {
    fn lock_state(&self) -> CacheDbResult<MutexGuard<'_, CacheState<T>>> {
        self.state
            .lock()
            .map_err(|_| SyncError::LockPoisoned.into())
    }

    /// State for read-only accessors, which never fail.
    fn peek_state(&self) -> MutexGuard<'_, CacheState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn evict_expired(&self) -> CacheDbResult<usize> {
        let mut state = self.lock_state()?;
        let expired = state.core.drain_expired(Instant::now());
        Ok(state.drain_with(expired, ExitReason::Expired))
    }
}

impl<T: CachedEntity, S> Drop for Inner<T, S> {
    fn drop(&mut self) {
        // Entries still cached are queued; the writer applies them as long as
        // the runtime stays up. `shutdown` is the way to wait for them.
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        let remaining = state.core.drain();
        if !remaining.is_empty() {
            let count = state.drain_with(remaining, ExitReason::Purged);
            tracing::debug!(
                entity = T::entity_name(),
                count,
                "Cache dropped, queued remaining entries"
            );
        }
    }
}

/// Write-back cache over a [`PersistentStore`].
///
/// `get` serves live entries from memory and loads from the store on a
/// miss. Entries are written back only when they leave the cache (capacity
/// eviction, expiration, or purge) and only if they changed since they
/// entered it. Writes happen on a background task; use [`flush`] or
/// [`purge_all`] to wait for them.
///
/// Cloning the handle is cheap and every clone shares the same cache.
///
/// [`flush`]: WriteBackCache::flush
/// [`purge_all`]: WriteBackCache::purge_all
pub struct WriteBackCache<T: CachedEntity, S: PersistentStore<T>> {
    inner: Arc<Inner<T, S>>,
}

impl<T: CachedEntity, S: PersistentStore<T>> Clone for WriteBackCache<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: CachedEntity, S: PersistentStore<T>> WriteBackCache<T, S> {
    /// Create a cache over `store`.
    ///
    /// Spawns the write-back writer, and the expiration sweeper when
    /// `config.sweep_interval` is set, so it must be called from within a
    /// tokio runtime.
    pub fn new(store: Arc<S>, config: CacheConfig) -> CacheDbResult<Self> {
        config.validate()?;
        let capacity =
            NonZeroUsize::new(config.capacity).ok_or_else(|| ConfigError::InvalidValue {
                field: "capacity".to_string(),
                value: config.capacity.to_string(),
                reason: "must be greater than 0".to_string(),
            })?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SyncError::NoRuntime)?;

        let metrics = Arc::new(CacheMetrics::new());
        let (queue, writer) = WriteBackQueue::spawn(
            &runtime,
            Arc::clone(&store),
            config.write_back.clone(),
            Arc::clone(&metrics),
        );

        let state = CacheState {
            core: BoundedCore::new(capacity, config.expiration),
            sync: Synchronizer::new(queue.clone(), Arc::clone(&metrics)),
            in_flight: HashMap::new(),
        };

        let inner = Arc::new(Inner {
            state: Mutex::new(state),
            store,
            queue,
            metrics,
            config,
            writer: Mutex::new(Some(writer)),
            sweeper: Mutex::new(None),
            sweep_lock: Arc::new(Mutex::new(())),
        });

        if let Some(interval) = inner.config.sweep_interval {
            let sweeper = runtime.spawn(run_sweeper(
                Arc::downgrade(&inner),
                Arc::clone(&inner.sweep_lock),
                interval,
            ));
            *inner.sweeper.lock().unwrap_or_else(PoisonError::into_inner) = Some(sweeper);
        }

        tracing::debug!(
            entity = T::entity_name(),
            capacity = inner.config.capacity,
            expiration_ms = inner.config.expiration.map(|d| d.as_millis() as u64),
            "Write-back cache created"
        );

        Ok(Self { inner })
    }

    /// Create a cache with the default configuration and `capacity` slots.
    pub fn with_capacity(store: Arc<S>, capacity: usize) -> CacheDbResult<Self> {
        Self::new(store, CacheConfig::default().with_capacity(capacity))
    }

    /// Get the live entry for `key`, loading it from the store on a miss.
    ///
    /// Concurrent misses on the same key share one store load and all see
    /// its outcome, a load error included. If the key still has a
    /// write-back queued, the queue is drained before loading.
    pub async fn get(&self, key: &T::Key) -> CacheDbResult<LiveEntry<T>> {
        let gate = {
            let mut state = self.inner.lock_state()?;
            if let Some(live) = state.lookup_fresh(key, Instant::now()) {
                CacheMetrics::incr(&self.inner.metrics.hits);
                return Ok(live);
            }
            CacheMetrics::incr(&self.inner.metrics.misses);
            Arc::clone(state.in_flight.entry(key.clone()).or_default())
        };

        // If the loading task is cancelled, the next waiter takes over.
        let result = gate.get_or_init(|| self.load_through(key)).await.clone();

        if let Ok(mut state) = self.inner.lock_state() {
            state.release_gate(key, &gate);
        }
        result
    }

    async fn load_through(&self, key: &T::Key) -> CacheDbResult<LiveEntry<T>> {
        loop {
            {
                // Filled by a set, or by a load that finished before our gate.
                let mut state = self.inner.lock_state()?;
                if let Some(live) = state.lookup_fresh(key, Instant::now()) {
                    return Ok(live);
                }
            }

            if self.inner.queue.is_pending(key) {
                if let Err(e) = self.inner.queue.flush().await {
                    // Nothing left to wait for; the store row is all there is.
                    tracing::warn!(
                        entity = T::entity_name(),
                        key = ?key,
                        error = %e,
                        "Write-back queue unavailable, loading without draining"
                    );
                }
            }

            CacheMetrics::incr(&self.inner.metrics.loads);
            let value = match self.inner.store.load(key).await {
                Ok(value) => value,
                Err(source) => {
                    CacheMetrics::incr(&self.inner.metrics.load_failures);
                    tracing::warn!(
                        entity = T::entity_name(),
                        key = ?key,
                        error = %source,
                        "Load failed"
                    );
                    return Err(CacheDbError::Load {
                        key: describe_key(key),
                        source,
                    });
                }
            };

            let mut state = self.inner.lock_state()?;
            let now = Instant::now();
            if let Some(live) = state.lookup_fresh(key, now) {
                return Ok(live);
            }
            if self.inner.queue.is_pending(key) && !self.inner.queue.is_closed() {
                // The key left the cache dirty while we were loading, so the
                // row we read may be older than the queued write.
                continue;
            }

            state.sync.on_loaded(key, &value);
            let live = LiveEntry::new(value);
            state.install(key.clone(), live.clone(), now);
            return Ok(live);
        }
    }

    /// Place `value` in the cache under `key` and record it as the baseline.
    ///
    /// Nothing is written to the store until the entry leaves the cache
    /// changed. A live value already under `key` is replaced without being
    /// written back.
    pub fn set(&self, key: T::Key, value: T) -> CacheDbResult<()> {
        let entity_key = value.entity_key();
        if entity_key != key {
            return Err(SyncError::KeyMismatch {
                expected: describe_key(&key),
                got: describe_key(&entity_key),
            }
            .into());
        }

        let mut state = self.inner.lock_state()?;
        state.sync.on_added(&key, &value);
        state.install(key, LiveEntry::new(value), Instant::now());
        Ok(())
    }

    /// Send every entry down the exit path, then wait for the resulting
    /// write-backs. The cache is empty afterwards.
    pub async fn purge_all(&self) -> CacheDbResult<()> {
        let purged = {
            let mut state = self.inner.lock_state()?;
            let drained = state.core.drain();
            state.drain_with(drained, ExitReason::Purged)
        };
        tracing::debug!(entity = T::entity_name(), purged, "Purged cache");
        self.flush().await
    }

    /// Remove every expired entry now. Returns how many were removed.
    pub fn evict_expired(&self) -> CacheDbResult<usize> {
        self.inner.evict_expired()
    }

    /// Wait until every write-back queued so far has been applied or
    /// abandoned.
    pub async fn flush(&self) -> CacheDbResult<()> {
        self.inner.queue.flush().await.map_err(Into::into)
    }

    /// Whether the live value under `key` differs from its baseline.
    /// `None` when `key` is not cached.
    pub fn is_dirty(&self, key: &T::Key) -> CacheDbResult<Option<bool>> {
        let state = self.inner.lock_state()?;
        match state.core.peek(key) {
            Some(live) => Ok(Some(state.sync.is_dirty(key, &live)?)),
            None => Ok(None),
        }
    }

    /// Whether a fresh entry exists for `key`. Does not touch recency.
    pub fn contains(&self, key: &T::Key) -> bool {
        self.inner.peek_state().core.contains(key, Instant::now())
    }

    /// Number of entries held, expired ones not yet removed included.
    pub fn len(&self) -> usize {
        self.inner.peek_state().core.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write-backs queued but not yet applied or abandoned.
    pub fn pending_write_backs(&self) -> usize {
        self.inner.queue.pending_len()
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.len() as u64;
        self.inner.metrics.snapshot(entries)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    /// Purge the cache, wait for every write-back, and stop the writer if
    /// this is the last handle.
    pub async fn shutdown(self) -> CacheDbResult<()> {
        self.purge_all().await?;

        // The sweeper upgrades its weak reference on every tick; keep it
        // out while checking for other handles.
        let sweep_lock = Arc::clone(&self.inner.sweep_lock);
        let unwrapped = {
            let _sweep = sweep_lock.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::try_unwrap(self.inner)
        };
        let Ok(inner) = unwrapped else {
            tracing::debug!(
                entity = T::entity_name(),
                "Cache still shared, writer left running"
            );
            return Ok(());
        };

        let writer = inner
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let sweeper = inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(inner);

        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }

        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                tracing::error!(entity = T::entity_name(), error = %e, "Write-back writer panicked");
            }
        }
        tracing::debug!(entity = T::entity_name(), "Cache shut down");
        Ok(())
    }
}

/// Periodically remove expired entries until the cache is dropped.
async fn run_sweeper<T: CachedEntity, S>(
    cache: Weak<Inner<T, S>>,
    sweep_lock: Arc<Mutex<()>>,
    interval: std::time::Duration,
) where
    S: Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let _sweep = sweep_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(inner) = cache.upgrade() else {
            break;
        };
        match inner.evict_expired() {
            Ok(0) => {}
            Ok(count) => {
                tracing::debug!(entity = T::entity_name(), count, "Swept expired entries");
            }
            Err(e) => {
                tracing::error!(entity = T::entity_name(), error = %e, "Expiration sweep failed");
            }
        }
    }
    tracing::debug!(entity = T::entity_name(), "Expiration sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use cachedb_core::deep_copy_struct;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Tag {
        id: u32,
        label: String,
    }

    deep_copy_struct!(Tag { id, label });

    impl CachedEntity for Tag {
        type Key = u32;

        fn entity_name() -> &'static str {
            "Tag"
        }

        fn entity_key(&self) -> u32 {
            self.id
        }
    }

    fn tag(id: u32, label: &str) -> Tag {
        Tag {
            id,
            label: label.to_string(),
        }
    }

    fn cache(
        store: &Arc<InMemoryStore<Tag>>,
        config: CacheConfig,
    ) -> WriteBackCache<Tag, InMemoryStore<Tag>> {
        WriteBackCache::new(Arc::clone(store), config).unwrap()
    }

    #[test]
    fn test_new_requires_runtime() {
        let store = Arc::new(InMemoryStore::<Tag>::new());
        let err = WriteBackCache::new(store, CacheConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, CacheDbError::Sync(SyncError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_new_rejects_zero_capacity() {
        let store = Arc::new(InMemoryStore::<Tag>::new());
        let err = WriteBackCache::with_capacity(store, 0).err().unwrap();
        assert!(matches!(err, CacheDbError::Config(_)));
    }

    #[tokio::test]
    async fn test_hit_returns_same_live_value() {
        let store = Arc::new(InMemoryStore::with_rows([tag(1, "red")]));
        let cache = cache(&store, CacheConfig::new(4).without_expiration());

        let first = cache.get(&1).await.unwrap();
        let second = cache.get(&1).await.unwrap();
        assert!(first.ptr_eq(&second));
        assert_eq!(store.load_count(), 1);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entry_count, 1);
    }

    #[tokio::test]
    async fn test_is_dirty_tracks_mutation() {
        let store = Arc::new(InMemoryStore::with_rows([tag(1, "red")]));
        let cache = cache(&store, CacheConfig::new(4).without_expiration());

        assert_eq!(cache.is_dirty(&1).unwrap(), None);
        let live = cache.get(&1).await.unwrap();
        assert_eq!(cache.is_dirty(&1).unwrap(), Some(false));
        live.update(|t| t.label = "blue".to_string()).unwrap();
        assert_eq!(cache.is_dirty(&1).unwrap(), Some(true));
    }

    #[tokio::test]
    async fn test_replaced_value_is_not_written_back() {
        let store = Arc::new(InMemoryStore::<Tag>::new());
        let cache = cache(&store, CacheConfig::new(4).without_expiration());

        cache.set(1, tag(1, "red")).unwrap();
        cache.get(&1).await.unwrap().update(|t| t.label = "pink".to_string()).unwrap();
        cache.set(1, tag(1, "green")).unwrap();
        assert_eq!(cache.is_dirty(&1).unwrap(), Some(false));

        cache.purge_all().await.unwrap();
        assert_eq!(store.update_count(), 0);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_evicts_expired_entries() {
        let store = Arc::new(InMemoryStore::with_rows([tag(1, "red")]));
        let config = CacheConfig::new(4)
            .with_expiration(Duration::from_secs(2))
            .with_sweep_interval(Duration::from_millis(500));
        let cache = cache(&store, config);

        cache
            .get(&1)
            .await
            .unwrap()
            .update(|t| t.label = "swept".to_string())
            .unwrap();
        assert_eq!(cache.len(), 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        cache.flush().await.unwrap();

        assert!(cache.is_empty());
        assert_eq!(store.row(&1).unwrap(), Some(tag(1, "swept")));
        assert_eq!(cache.stats().expirations, 1);
    }

    #[tokio::test]
    async fn test_shutdown_writes_back_and_stops_writer() {
        let store = Arc::new(InMemoryStore::with_rows([tag(1, "red")]));
        let cache = cache(&store, CacheConfig::new(4).without_expiration());

        cache
            .get(&1)
            .await
            .unwrap()
            .update(|t| t.label = "final".to_string())
            .unwrap();
        cache.shutdown().await.unwrap();

        assert_eq!(store.row(&1).unwrap(), Some(tag(1, "final")));
    }

    fn assert_baselines_match_entries(cache: &WriteBackCache<Tag, InMemoryStore<Tag>>) {
        let state = cache.inner.peek_state();
        assert_eq!(state.sync.baseline_count(), state.core.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_baselines_track_entries_through_every_exit() {
        let store = Arc::new(InMemoryStore::with_rows([
            tag(1, "red"),
            tag(2, "green"),
            tag(3, "blue"),
        ]));
        let cache = cache(
            &store,
            CacheConfig::new(2).with_expiration(Duration::from_secs(5)),
        );

        cache.get(&1).await.unwrap();
        cache.get(&2).await.unwrap();
        assert_baselines_match_entries(&cache);

        // Capacity eviction of key 1.
        cache.get(&3).await.unwrap();
        assert_eq!(cache.len(), 2);
        assert_baselines_match_entries(&cache);

        // Replacement keeps one baseline for the key.
        cache.set(3, tag(3, "navy")).unwrap();
        assert_baselines_match_entries(&cache);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.evict_expired().unwrap(), 2);
        assert!(cache.is_empty());
        assert_baselines_match_entries(&cache);

        cache.get(&1).await.unwrap();
        cache.set(4, tag(4, "gold")).unwrap();
        assert_baselines_match_entries(&cache);

        cache.purge_all().await.unwrap();
        assert!(cache.is_empty());
        assert_baselines_match_entries(&cache);
        assert_eq!(cache.stats().snapshot_misses, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_with_sweeper_releases_store() {
        let store = Arc::new(InMemoryStore::with_rows([tag(1, "red")]));
        let config = CacheConfig::new(4)
            .with_expiration(Duration::from_secs(60))
            .with_sweep_interval(Duration::from_millis(1));
        let cache = cache(&store, config);

        cache
            .get(&1)
            .await
            .unwrap()
            .update(|t| t.label = "final".to_string())
            .unwrap();
        // Let the sweeper tick a few times so it races the shutdown.
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.shutdown().await.unwrap();

        assert_eq!(store.row(&1).unwrap(), Some(tag(1, "final")));
        // Writer and sweeper are gone, and with them every clone of the store.
        assert_eq!(Arc::strong_count(&store), 1);
    }

    #[tokio::test]
    async fn test_drop_queues_dirty_entries() {
        let store = Arc::new(InMemoryStore::with_rows([tag(1, "red")]));
        let cache = cache(&store, CacheConfig::new(4).without_expiration());
        let writer = cache.inner.writer.lock().unwrap().take().unwrap();

        cache
            .get(&1)
            .await
            .unwrap()
            .update(|t| t.label = "dropped".to_string())
            .unwrap();
        drop(cache);
        writer.await.unwrap();

        assert_eq!(store.row(&1).unwrap(), Some(tag(1, "dropped")));
    }
}
