//! cachedb Core - Shared Types
//!
//! Everything the cache and the stores agree on: the error taxonomy, the
//! configuration, the [`DeepCopy`] engine used for baseline snapshots, and
//! the [`CachedEntity`] contract with its field-level [`FieldChanges`].
//! This crate holds no cache state of its own.

pub mod config;
pub mod deep_copy;
pub mod entity;
pub mod error;

pub use config::{
    CacheConfig, RetryConfig, DEFAULT_CAPACITY, DEFAULT_EXPIRATION_MS,
    DEFAULT_WRITE_BACK_INITIAL_BACKOFF_MS, DEFAULT_WRITE_BACK_MAX_ATTEMPTS,
    DEFAULT_WRITE_BACK_MAX_BACKOFF_MS,
};
pub use deep_copy::{deep_copy, DeepCopy};
pub use entity::{describe_key, CachedEntity, EntityKey, FieldChanges};
pub use error::{CacheDbError, CacheDbResult, ConfigError, StoreError, StoreResult, SyncError};
