//! Write-back queue and its writer task.
//!
//! Entries that leave the cache dirty become [`WriteBackJob`]s on an
//! unbounded channel. One writer task per cache drains the channel in order
//! and applies each job with retry and exponential backoff, so foreground
//! `get`/`set` calls never wait on a store write, and jobs for the same key
//! are applied in the order the entries left the cache.
//!
//! The queue also tracks which keys still have a job in flight. A load for
//! such a key drains the queue first; otherwise it could read the row just
//! before an older job overwrites it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use cachedb_core::{
    describe_key, CacheDbError, CachedEntity, FieldChanges, RetryConfig, SyncError,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::stats::CacheMetrics;
use crate::store::PersistentStore;

/// Why an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Pushed out by capacity pressure.
    Evicted,
    /// Past its expiration window.
    Expired,
    /// Removed by `purge_all`, `shutdown`, or dropping the cache.
    Purged,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            ExitReason::Evicted => "evicted",
            ExitReason::Expired => "expired",
            ExitReason::Purged => "purged",
        };
        f.write_str(reason)
    }
}

/// A dirty entry waiting to be persisted.
#[derive(Debug)]
pub(crate) struct WriteBackJob<T: CachedEntity> {
    pub(crate) key: T::Key,
    pub(crate) baseline: T,
    pub(crate) current: T,
    pub(crate) changes: FieldChanges,
    pub(crate) reason: ExitReason,
}

enum WriterCommand<T: CachedEntity> {
    Apply(WriteBackJob<T>),
    Flush(oneshot::Sender<()>),
}

/// Per-key count of jobs not yet applied or abandoned.
struct PendingKeys<K> {
    counts: Mutex<HashMap<K, usize>>,
}

impl<K: std::hash::Hash + Eq + Clone> PendingKeys<K> {
    fn new() -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
        }
    }

    fn acquire(&self, key: &K) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        *counts.entry(key.clone()).or_insert(0) += 1;
    }

    fn release(&self, key: &K) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = counts.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                counts.remove(key);
            }
        }
    }

    fn contains(&self, key: &K) -> bool {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    fn total(&self) -> usize {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .sum()
    }
}

/// Sending side of the write-back channel.
pub(crate) struct WriteBackQueue<T: CachedEntity> {
    tx: mpsc::UnboundedSender<WriterCommand<T>>,
    pending: Arc<PendingKeys<T::Key>>,
}

impl<T: CachedEntity> Clone for WriteBackQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            pending: Arc::clone(&self.pending),
        }
    }
}

impl<T: CachedEntity> WriteBackQueue<T> {
    /// Create the queue and spawn its writer on `runtime`.
    ///
    /// The writer stops once every queue handle is dropped and the channel
    /// has been drained.
    pub(crate) fn spawn<S: PersistentStore<T>>(
        runtime: &tokio::runtime::Handle,
        store: Arc<S>,
        retry: RetryConfig,
        metrics: Arc<CacheMetrics>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(PendingKeys::new());
        let writer = runtime.spawn(run_writer(store, retry, metrics, Arc::clone(&pending), rx));
        (Self { tx, pending }, writer)
    }

    /// Queue a job. Never blocks.
    pub(crate) fn enqueue(&self, job: WriteBackJob<T>) -> Result<(), SyncError> {
        let key = job.key.clone();
        self.pending.acquire(&key);
        if self.tx.send(WriterCommand::Apply(job)).is_err() {
            self.pending.release(&key);
            return Err(SyncError::WriterClosed);
        }
        Ok(())
    }

    /// Whether a job for `key` has not been applied or abandoned yet.
    pub(crate) fn is_pending(&self, key: &T::Key) -> bool {
        self.pending.contains(key)
    }

    /// Whether the writer has stopped. Pending keys then never clear.
    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Number of jobs not yet applied or abandoned.
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.total()
    }

    /// Wait until every job queued before this call has been processed.
    pub(crate) async fn flush(&self) -> Result<(), SyncError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(WriterCommand::Flush(done_tx))
            .map_err(|_| SyncError::WriterClosed)?;
        done_rx.await.map_err(|_| SyncError::WriterClosed)
    }
}

async fn run_writer<T, S>(
    store: Arc<S>,
    retry: RetryConfig,
    metrics: Arc<CacheMetrics>,
    pending: Arc<PendingKeys<T::Key>>,
    mut rx: mpsc::UnboundedReceiver<WriterCommand<T>>,
) where
    T: CachedEntity,
    S: PersistentStore<T>,
{
    tracing::debug!(entity = T::entity_name(), "Write-back writer started");

    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Apply(job) => {
                let key = job.key.clone();
                let reason = job.reason;

                // Each job runs in its own task so a panicking store only
                // loses that job. Awaiting it keeps jobs in order.
                let attempt = {
                    let store = Arc::clone(&store);
                    let retry = retry.clone();
                    let metrics = Arc::clone(&metrics);
                    tokio::spawn(async move {
                        let _ = apply_with_retry(store.as_ref(), &retry, &metrics, &job).await;
                    })
                };
                if let Err(e) = attempt.await {
                    CacheMetrics::incr(&metrics.write_back_failures);
                    tracing::error!(
                        entity = T::entity_name(),
                        key = ?key,
                        reason = %reason,
                        error = %e,
                        "Write-back task panicked, job abandoned"
                    );
                }
                pending.release(&key);
            }
            WriterCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    tracing::debug!(entity = T::entity_name(), "Write-back writer stopped");
}

/// Apply one job, retrying failed attempts with backoff.
async fn apply_with_retry<T, S>(
    store: &S,
    retry: &RetryConfig,
    metrics: &CacheMetrics,
    job: &WriteBackJob<T>,
) -> Result<(), CacheDbError>
where
    T: CachedEntity,
    S: PersistentStore<T>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match store.update(&job.baseline, &job.current, &job.changes).await {
            Ok(()) => {
                CacheMetrics::incr(&metrics.write_backs);
                tracing::debug!(
                    entity = T::entity_name(),
                    key = ?job.key,
                    reason = %job.reason,
                    attempt,
                    fields = ?job.changes.field_names().collect::<Vec<_>>(),
                    "Wrote back dirty entry"
                );
                return Ok(());
            }
            Err(e) if attempt < retry.max_attempts => {
                CacheMetrics::incr(&metrics.write_back_retries);
                let delay = retry.backoff_for(attempt);
                tracing::warn!(
                    entity = T::entity_name(),
                    key = ?job.key,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Write-back failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                CacheMetrics::incr(&metrics.write_back_failures);
                let err = CacheDbError::StoreWrite {
                    key: describe_key(&job.key),
                    attempts: attempt,
                    source: e,
                };
                tracing::error!(
                    entity = T::entity_name(),
                    reason = %job.reason,
                    error = %err,
                    "Write-back abandoned"
                );
                return Err(err);
            }
        }
    }
}
