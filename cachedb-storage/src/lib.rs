//! cachedb Storage - Write-Back Cache and Persistent Stores
//!
//! The [`WriteBackCache`] keeps live entities in memory and persists them
//! only when they leave the cache changed. Stores implement
//! [`PersistentStore`]; [`InMemoryStore`] and the LMDB-backed [`LmdbStore`]
//! ship with the crate.

pub mod cache;
pub mod lmdb_store;
pub mod store;

pub use cache::{
    CacheMetrics, CacheStats, ExitReason, LiveEntry, SnapshotRegistry, WriteBackCache,
};
pub use lmdb_store::{LmdbStore, LmdbStoreError};
pub use store::{merge_row, InMemoryStore, PersistentStore, UpdatePolicy, UpdateRecord};
