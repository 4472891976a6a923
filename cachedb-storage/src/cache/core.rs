//! Capacity-bounded store of live entries.
//!
//! Wraps [`lru::LruCache`] with a per-entry expiration window. The core
//! does no I/O and knows nothing about baselines; it only reports which
//! entries leave and why, and the synchronizer decides what to persist.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;

use super::live::LiveEntry;

/// A cached value and when it entered the cache.
struct Slot<T> {
    live: LiveEntry<T>,
    inserted_at: Instant,
}

/// Result of looking a key up.
pub(crate) enum Lookup<T> {
    /// Present and fresh.
    Hit(LiveEntry<T>),
    /// Present but past its expiration window; already removed.
    Expired(LiveEntry<T>),
    Miss,
}

/// An entry pushed out by an insert.
pub(crate) enum Departure<K, T> {
    /// The least recently used entry, evicted for capacity.
    Evicted(K, LiveEntry<T>),
    /// The previous value under the inserted key.
    Replaced(LiveEntry<T>),
}

pub(crate) struct BoundedCore<K: Hash + Eq, T> {
    entries: LruCache<K, Slot<T>>,
    expiration: Option<Duration>,
}

fn is_expired(inserted_at: Instant, expiration: Option<Duration>, now: Instant) -> bool {
    match expiration {
        Some(window) => now.saturating_duration_since(inserted_at) >= window,
        None => false,
    }
}

impl<K: Hash + Eq + Clone, T> BoundedCore<K, T> {
    pub(crate) fn new(capacity: NonZeroUsize, expiration: Option<Duration>) -> Self {
        Self {
            entries: LruCache::new(capacity),
            expiration,
        }
    }

    /// Look a key up, marking it most recently used on a hit. Expiration is
    /// measured from insertion; reads do not extend it.
    pub(crate) fn lookup(&mut self, key: &K, now: Instant) -> Lookup<T> {
        let expiration = self.expiration;
        match self.entries.get(key) {
            None => return Lookup::Miss,
            Some(slot) if !is_expired(slot.inserted_at, expiration, now) => {
                return Lookup::Hit(slot.live.clone());
            }
            Some(_) => {}
        }

        match self.entries.pop(key) {
            Some(slot) => Lookup::Expired(slot.live),
            None => Lookup::Miss,
        }
    }

    /// Install `live` under `key`.
    pub(crate) fn insert(
        &mut self,
        key: K,
        live: LiveEntry<T>,
        now: Instant,
    ) -> Option<Departure<K, T>> {
        let slot = Slot {
            live,
            inserted_at: now,
        };
        match self.entries.push(key.clone(), slot) {
            Some((old_key, old)) if old_key == key => Some(Departure::Replaced(old.live)),
            Some((old_key, old)) => Some(Departure::Evicted(old_key, old.live)),
            None => None,
        }
    }

    /// Remove every entry, least recently used first.
    pub(crate) fn drain(&mut self) -> Vec<(K, LiveEntry<T>)> {
        let mut out = Vec::with_capacity(self.entries.len());
        while let Some((key, slot)) = self.entries.pop_lru() {
            out.push((key, slot.live));
        }
        out
    }

    /// Remove every entry past its expiration window.
    pub(crate) fn drain_expired(&mut self, now: Instant) -> Vec<(K, LiveEntry<T>)> {
        let expiration = self.expiration;
        if expiration.is_none() {
            return Vec::new();
        }

        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, slot)| is_expired(slot.inserted_at, expiration, now))
            .map(|(key, _)| key.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|key| self.entries.pop(&key).map(|slot| (key, slot.live)))
            .collect()
    }

    /// Whether a fresh entry exists, without touching recency.
    pub(crate) fn contains(&self, key: &K, now: Instant) -> bool {
        self.entries
            .peek(key)
            .is_some_and(|slot| !is_expired(slot.inserted_at, self.expiration, now))
    }

    /// The live handle under `key`, fresh or not, without touching recency.
    pub(crate) fn peek(&self, key: &K) -> Option<LiveEntry<T>> {
        self.entries.peek(key).map(|slot| slot.live.clone())
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.entries.cap().get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core(capacity: usize, expiration: Option<Duration>) -> BoundedCore<u32, &'static str> {
        BoundedCore::new(NonZeroUsize::new(capacity).unwrap(), expiration)
    }

    fn value_of(live: &LiveEntry<&'static str>) -> &'static str {
        *live.read().unwrap()
    }

    #[test]
    fn test_hit_and_miss() {
        let now = Instant::now();
        let mut core = core(2, None);
        assert!(core.insert(1, LiveEntry::new("one"), now).is_none());

        match core.lookup(&1, now) {
            Lookup::Hit(live) => assert_eq!(value_of(&live), "one"),
            _ => panic!("expected hit"),
        }
        assert!(matches!(core.lookup(&2, now), Lookup::Miss));
    }

    #[test]
    fn test_capacity_evicts_least_recently_used() {
        let now = Instant::now();
        let mut core = core(2, None);
        core.insert(1, LiveEntry::new("one"), now);
        core.insert(2, LiveEntry::new("two"), now);
        // Touch 1 so 2 becomes the eviction candidate.
        let _ = core.lookup(&1, now);

        match core.insert(3, LiveEntry::new("three"), now) {
            Some(Departure::Evicted(key, live)) => {
                assert_eq!(key, 2);
                assert_eq!(value_of(&live), "two");
            }
            _ => panic!("expected eviction of key 2"),
        }
        assert_eq!(core.len(), 2);
        assert_eq!(core.capacity(), 2);
    }

    #[test]
    fn test_insert_same_key_reports_replacement() {
        let now = Instant::now();
        let mut core = core(2, None);
        core.insert(1, LiveEntry::new("old"), now);
        match core.insert(1, LiveEntry::new("new"), now) {
            Some(Departure::Replaced(live)) => assert_eq!(value_of(&live), "old"),
            _ => panic!("expected replacement"),
        }
        assert_eq!(core.len(), 1);
    }

    #[test]
    fn test_expired_entry_is_removed_on_lookup() {
        let start = Instant::now();
        let mut core = core(4, Some(Duration::from_secs(2)));
        core.insert(1, LiveEntry::new("one"), start);

        assert!(core.contains(&1, start + Duration::from_secs(1)));
        assert!(!core.contains(&1, start + Duration::from_secs(2)));

        match core.lookup(&1, start + Duration::from_secs(3)) {
            Lookup::Expired(live) => assert_eq!(value_of(&live), "one"),
            _ => panic!("expected expired"),
        }
        assert_eq!(core.len(), 0);
    }

    #[test]
    fn test_reads_do_not_extend_expiration() {
        let start = Instant::now();
        let mut core = core(4, Some(Duration::from_secs(2)));
        core.insert(1, LiveEntry::new("one"), start);
        assert!(matches!(
            core.lookup(&1, start + Duration::from_millis(1_500)),
            Lookup::Hit(_)
        ));
        assert!(matches!(
            core.lookup(&1, start + Duration::from_millis(2_100)),
            Lookup::Expired(_)
        ));
    }

    #[test]
    fn test_drain_expired_only_takes_stale_entries() {
        let start = Instant::now();
        let mut core = core(4, Some(Duration::from_secs(2)));
        core.insert(1, LiveEntry::new("old"), start);
        core.insert(2, LiveEntry::new("fresh"), start + Duration::from_secs(2));

        let drained = core.drain_expired(start + Duration::from_secs(3));
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0, 1);
        assert_eq!(core.len(), 1);
    }

    #[test]
    fn test_drain_empties_in_lru_order() {
        let now = Instant::now();
        let mut core = core(4, None);
        core.insert(1, LiveEntry::new("one"), now);
        core.insert(2, LiveEntry::new("two"), now);
        assert!(core.peek(&2).is_some());
        let keys: Vec<u32> = core.drain().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![1, 2]);
        assert_eq!(core.len(), 0);
        assert!(core.drain_expired(now).is_empty());
    }
}
