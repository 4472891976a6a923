//! Write-back cache over a [`PersistentStore`](crate::PersistentStore).
//!
//! # Layout
//!
//! - [`core`]: capacity-bounded LRU of live entries with an expiration window
//! - [`registry`]: one baseline snapshot per cached key
//! - [`synchronizer`]: records baselines on entry and diffs them on exit
//! - [`write_back`]: queue and writer task that persist dirty entries
//! - [`WriteBackCache`]: the handle tying them together
//!
//! The core, the registry, and the single-flight map sit behind one mutex,
//! which is never held across an `.await`. Store writes happen on the writer
//! task, in the order entries left the cache.
//!
//! # Example
//!
//! ```ignore
//! let cache = WriteBackCache::new(store, CacheConfig::new(128))?;
//!
//! let user = cache.get(&1).await?;
//! user.update(|u| u.name = "Li".to_string())?;
//!
//! // Persists the change and empties the cache.
//! cache.purge_all().await?;
//! ```

mod core;
pub mod live;
pub mod registry;
pub mod stats;
mod synchronizer;
mod write_back;
mod write_back_cache;

pub use live::LiveEntry;
pub use registry::SnapshotRegistry;
pub use stats::{CacheMetrics, CacheStats};
pub use write_back::ExitReason;
pub use write_back_cache::WriteBackCache;
