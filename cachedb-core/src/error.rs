//! Error types for cachedb operations

use thiserror::Error;

/// Persistent store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Entity not found: {entity} with key {key}")]
    NotFound { entity: String, key: String },

    #[error("Update failed for {entity} with key {key}: {reason}")]
    UpdateFailed {
        entity: String,
        key: String,
        reason: String,
    },

    #[error("Store backend error: {reason}")]
    Backend { reason: String },

    #[error("Serialization error: {reason}")]
    Serialization { reason: String },

    #[error("Store lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    /// Whether the error means the row does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Errors raised while keeping the cache and its baselines in step.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("No baseline snapshot recorded for key {key}")]
    SnapshotMissing { key: String },

    #[error("Key mismatch: cache key {expected}, entity key {got}")]
    KeyMismatch { expected: String, got: String },

    #[error("Cache lock poisoned")]
    LockPoisoned,

    #[error("Write-back queue is closed")]
    WriterClosed,

    #[error("No tokio runtime available to run the write-back writer")]
    NoRuntime,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all cachedb errors.
#[derive(Debug, Clone, Error)]
pub enum CacheDbError {
    /// The store lookup behind a cache miss failed.
    #[error("Load failed for key {key}: {source}")]
    Load { key: String, source: StoreError },

    /// A write-back gave up. Only ever logged, eviction is not caller-initiated.
    #[error("Write-back failed for key {key} after {attempts} attempt(s): {source}")]
    StoreWrite {
        key: String,
        attempts: u32,
        source: StoreError,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for cachedb operations.
pub type CacheDbResult<T> = Result<T, CacheDbError>;

/// Result type alias for persistent store operations.
pub type StoreResult<T> = Result<T, StoreError>;

// =============================================================================
// TESTS
// =============================================================================
