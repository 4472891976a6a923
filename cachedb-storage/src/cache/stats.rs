//! Cache counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, shared between the cache handle and its writer task.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    /// Reads served from a live entry
    pub hits: AtomicU64,

    /// Reads that found no fresh entry
    pub misses: AtomicU64,

    /// Store loads performed on miss
    pub loads: AtomicU64,

    /// Store loads that failed
    pub load_failures: AtomicU64,

    /// Entries pushed out for capacity
    pub evictions: AtomicU64,

    /// Entries removed after their expiration window
    pub expirations: AtomicU64,

    /// Entries removed by purge
    pub purged: AtomicU64,

    /// Exits that found the live value equal to its baseline
    pub clean_exits: AtomicU64,

    /// Exits with no baseline on record
    pub snapshot_misses: AtomicU64,

    /// Write-back jobs applied successfully
    pub write_backs: AtomicU64,

    /// Failed write-back attempts that were retried
    pub write_back_retries: AtomicU64,

    /// Write-back jobs abandoned after the last attempt
    pub write_back_failures: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current snapshot of all counters.
    pub fn snapshot(&self, entry_count: u64) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            purged: self.purged.load(Ordering::Relaxed),
            clean_exits: self.clean_exits.load(Ordering::Relaxed),
            snapshot_misses: self.snapshot_misses.load(Ordering::Relaxed),
            write_backs: self.write_backs.load(Ordering::Relaxed),
            write_back_retries: self.write_back_retries.load(Ordering::Relaxed),
            write_back_failures: self.write_back_failures.load(Ordering::Relaxed),
            entry_count,
        }
    }
}

/// Statistics about cache usage at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub load_failures: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub purged: u64,
    pub clean_exits: u64,
    pub snapshot_misses: u64,
    pub write_backs: u64,
    pub write_back_retries: u64,
    pub write_back_failures: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
