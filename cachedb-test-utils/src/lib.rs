//! cachedb Test Utilities
//!
//! Shared test infrastructure for the cachedb workspace:
//! - Entity fixtures implementing [`CachedEntity`]
//! - Proptest generators for those entities
//! - Tracing setup for tests

use std::collections::{BTreeMap, HashMap};

use cachedb_core::{deep_copy_struct, CachedEntity};
use serde::{Deserialize, Serialize};

pub use cachedb_core::{CacheConfig, CacheDbError, DeepCopy, FieldChanges, RetryConfig};

// ============================================================================
// ENTITIES
// ============================================================================

/// Flat record keyed by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub name: String,
    pub age: i32,
}

deep_copy_struct!(User { id, name, age });

impl CachedEntity for User {
    type Key = u64;

    fn entity_name() -> &'static str {
        "User"
    }

    fn entity_key(&self) -> u64 {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub city: String,
    pub lines: Vec<String>,
}

deep_copy_struct!(Address { city, lines });

/// Nested record with collections, keyed by a string handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub handle: String,
    pub tags: Vec<String>,
    pub settings: HashMap<String, String>,
    pub scores: BTreeMap<String, i64>,
    pub address: Option<Address>,
}

deep_copy_struct!(Profile {
    handle,
    tags,
    settings,
    scores,
    address,
});

impl CachedEntity for Profile {
    type Key = String;

    fn entity_name() -> &'static str {
        "Profile"
    }

    fn entity_key(&self) -> String {
        self.handle.clone()
    }
}

// ============================================================================
// TRACING
// ============================================================================

/// Install a test subscriber once per process.
///
/// The filter comes from `RUST_LOG` and defaults to `warn`. Set
/// `CACHEDB_LOG_FORMAT=json` for JSON lines.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let json = std::env::var("CACHEDB_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    // A subscriber may already be installed by another test.
    let _ = if json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
    } else {
        fmt().with_env_filter(filter).with_test_writer().try_init()
    };
}

// ============================================================================
// GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for the fixture entities.

    use super::*;
    use proptest::collection::{btree_map, hash_map, vec};
    use proptest::option;
    use proptest::prelude::*;

    /// Generate a name, possibly empty.
    pub fn arb_name() -> impl Strategy<Value = String> {
        "[A-Za-z]{0,12}"
    }

    /// Generate a user with any id.
    pub fn arb_user() -> impl Strategy<Value = User> {
        (any::<u64>(), arb_name(), any::<i32>()).prop_map(|(id, name, age)| User { id, name, age })
    }

    /// Generate a user with the given id.
    pub fn arb_user_with_id(id: u64) -> impl Strategy<Value = User> {
        (arb_name(), any::<i32>()).prop_map(move |(name, age)| User { id, name, age })
    }

    pub fn arb_address() -> impl Strategy<Value = Address> {
        ("[a-z]{1,10}", vec("[a-z0-9 ]{0,16}", 0..3))
            .prop_map(|(city, lines)| Address { city, lines })
    }

    /// Generate a profile with nested collections.
    pub fn arb_profile() -> impl Strategy<Value = Profile> {
        (
            "[a-z]{1,8}",
            vec("[a-z]{1,6}", 0..5),
            hash_map("[a-z]{1,6}", "[a-z]{0,6}", 0..4),
            btree_map("[a-z]{1,6}", any::<i64>(), 0..4),
            option::of(arb_address()),
        )
            .prop_map(|(handle, tags, settings, scores, address)| Profile {
                handle,
                tags,
                settings,
                scores,
                address,
            })
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built entities for common scenarios.

    use super::*;

    pub fn user(id: u64, name: &str, age: i32) -> User {
        User {
            id,
            name: name.to_string(),
            age,
        }
    }

    /// The row most cache scenarios start from.
    pub fn zhang() -> User {
        user(1, "Zhang", 19)
    }

    /// `count` users with ids `1..=count`.
    pub fn users(count: u64) -> Vec<User> {
        (1..=count).map(|id| user(id, &format!("user-{id}"), 20)).collect()
    }

    pub fn profile(handle: &str) -> Profile {
        Profile {
            handle: handle.to_string(),
            tags: vec!["new".to_string()],
            settings: HashMap::from([("theme".to_string(), "dark".to_string())]),
            scores: BTreeMap::from([("chess".to_string(), 1200)]),
            address: Some(Address {
                city: "Hangzhou".to_string(),
                lines: vec!["1 West Lake Rd".to_string()],
            }),
        }
    }

    /// A retry policy with short delays for tests.
    pub fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff: std::time::Duration::from_millis(5),
            max_backoff: std::time::Duration::from_millis(50),
            backoff_multiplier: 2.0,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
