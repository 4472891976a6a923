//! Configuration types

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{CacheDbError, CacheDbResult, ConfigError};

/// Default number of live entries held before LRU eviction kicks in.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Default expiration window, measured from load or set.
pub const DEFAULT_EXPIRATION_MS: u64 = 2_000;

/// Default number of attempts per write-back job.
pub const DEFAULT_WRITE_BACK_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the first write-back retry.
pub const DEFAULT_WRITE_BACK_INITIAL_BACKOFF_MS: u64 = 100;

/// Default upper bound on the write-back retry delay.
pub const DEFAULT_WRITE_BACK_MAX_BACKOFF_MS: u64 = 5_000;

/// Retry policy for write-back jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per job, the first one included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
    pub backoff_multiplier: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_WRITE_BACK_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(DEFAULT_WRITE_BACK_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_WRITE_BACK_MAX_BACKOFF_MS),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay to wait after `failed_attempts` consecutive failures.
    pub fn backoff_for(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(31) as i32;
        let factor = f64::from(self.backoff_multiplier).powi(exponent);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

/// Configuration for a write-back cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of live entries.
    pub capacity: usize,
    /// Time an entry may stay cached after load or set. `None` disables
    /// expiration.
    pub expiration: Option<Duration>,
    /// How often a background task evicts expired entries. `None` leaves
    /// expiration to reads and explicit `evict_expired` calls.
    pub sweep_interval: Option<Duration>,
    /// Retry policy of the write-back queue.
    pub write_back: RetryConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            expiration: Some(Duration::from_millis(DEFAULT_EXPIRATION_MS)),
            sweep_interval: None,
            write_back: RetryConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Create a config with the given capacity and default everything else.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    /// Set the capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the expiration window.
    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Disable time-based expiration.
    pub fn without_expiration(mut self) -> Self {
        self.expiration = None;
        self
    }

    /// Enable the background expiration sweeper.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    /// Set the write-back retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.write_back = retry;
        self
    }

    /// Create CacheConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHEDB_CAPACITY`: Maximum live entries (default: 1024)
    /// - `CACHEDB_EXPIRATION_MS`: Expiration window, `0` disables it (default: 2000)
    /// - `CACHEDB_SWEEP_INTERVAL_MS`: Background sweep interval, unset or `0` disables it
    /// - `CACHEDB_WRITE_BACK_MAX_ATTEMPTS`: Attempts per write-back job (default: 3)
    /// - `CACHEDB_WRITE_BACK_INITIAL_BACKOFF_MS`: First retry delay (default: 100)
    /// - `CACHEDB_WRITE_BACK_MAX_BACKOFF_MS`: Retry delay cap (default: 5000)
    pub fn from_env() -> Self {
        let capacity = env_parse("CACHEDB_CAPACITY").unwrap_or(DEFAULT_CAPACITY);

        let expiration = match env_parse::<u64>("CACHEDB_EXPIRATION_MS") {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => Some(Duration::from_millis(DEFAULT_EXPIRATION_MS)),
        };

        let sweep_interval = env_parse::<u64>("CACHEDB_SWEEP_INTERVAL_MS")
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);

        let write_back = RetryConfig {
            max_attempts: env_parse("CACHEDB_WRITE_BACK_MAX_ATTEMPTS")
                .unwrap_or(DEFAULT_WRITE_BACK_MAX_ATTEMPTS),
            initial_backoff: Duration::from_millis(
                env_parse("CACHEDB_WRITE_BACK_INITIAL_BACKOFF_MS")
                    .unwrap_or(DEFAULT_WRITE_BACK_INITIAL_BACKOFF_MS),
            ),
            max_backoff: Duration::from_millis(
                env_parse("CACHEDB_WRITE_BACK_MAX_BACKOFF_MS")
                    .unwrap_or(DEFAULT_WRITE_BACK_MAX_BACKOFF_MS),
            ),
            ..RetryConfig::default()
        };

        Self {
            capacity,
            expiration,
            sweep_interval,
            write_back,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> CacheDbResult<()> {
        if self.capacity == 0 {
            return Err(invalid(
                "capacity",
                self.capacity.to_string(),
                "capacity must be greater than 0",
            ));
        }

        if let Some(expiration) = self.expiration {
            if expiration.is_zero() {
                return Err(invalid(
                    "expiration",
                    format!("{:?}", expiration),
                    "expiration must be positive when set",
                ));
            }
        }

        if let Some(interval) = self.sweep_interval {
            if interval.is_zero() {
                return Err(invalid(
                    "sweep_interval",
                    format!("{:?}", interval),
                    "sweep_interval must be positive when set",
                ));
            }
        }

        if self.write_back.max_attempts == 0 {
            return Err(invalid(
                "write_back.max_attempts",
                self.write_back.max_attempts.to_string(),
                "at least one write-back attempt is required",
            ));
        }

        if !(self.write_back.backoff_multiplier >= 1.0) {
            return Err(invalid(
                "write_back.backoff_multiplier",
                self.write_back.backoff_multiplier.to_string(),
                "backoff_multiplier must be at least 1.0",
            ));
        }

        if self.write_back.max_backoff < self.write_back.initial_backoff {
            return Err(invalid(
                "write_back.max_backoff",
                format!("{:?}", self.write_back.max_backoff),
                "max_backoff must not be shorter than initial_backoff",
            ));
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn invalid(field: &str, value: String, reason: &str) -> CacheDbError {
    CacheDbError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value,
        reason: reason.to_string(),
    })
}
