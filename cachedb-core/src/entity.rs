//! The contract every cached entity implements, and field-level change sets.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::deep_copy::DeepCopy;
use crate::error::{StoreError, StoreResult};

/// Key domain shared by the cache and the persistent store.
pub trait EntityKey:
    Clone + Eq + Hash + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> EntityKey for K where
    K: Clone + Eq + Hash + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Trait for records that can live in a write-back cache.
///
/// # Implementation Requirements
///
/// - `entity_key()` must return the primary identifier, the same value the
///   record is cached under
/// - `DeepCopy` must copy every field, otherwise changes to the missing
///   fields are never written back
/// - `PartialEq` decides dirtiness: a live value equal to its baseline is
///   never written
/// - The serialized form must be a JSON object so that [`FieldChanges`] can
///   diff it field by field
pub trait CachedEntity:
    DeepCopy + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Primary identifier type.
    type Key: EntityKey;

    /// Human-readable name used in logs and errors.
    fn entity_name() -> &'static str;

    /// The primary identifier of this record.
    fn entity_key(&self) -> Self::Key;
}

/// Render a key for error messages and log fields.
pub fn describe_key<K: Debug>(key: &K) -> String {
    format!("{:?}", key)
}

/// Top-level fields whose serialized value differs between a baseline and
/// the current state of a record.
///
/// Changes come from a diff, not from "non-zero" checks, so a field reset to
/// `0`, `""` or `null` is still reported.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldChanges {
    changed: BTreeMap<String, Value>,
}

impl FieldChanges {
    /// Diff two records field by field.
    ///
    /// A field present in `baseline` but absent from `current` (e.g. skipped
    /// when `None`) is reported as `null`.
    pub fn between<T: Serialize>(baseline: &T, current: &T) -> StoreResult<Self> {
        let before = to_object(baseline)?;
        let after = to_object(current)?;

        let mut changed = BTreeMap::new();
        for (field, value) in &after {
            if before.get(field) != Some(value) {
                changed.insert(field.clone(), value.clone());
            }
        }
        for field in before.keys() {
            if !after.contains_key(field) {
                changed.insert(field.clone(), Value::Null);
            }
        }

        Ok(Self { changed })
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changed.len()
    }

    pub fn contains(&self, field: &str) -> bool {
        self.changed.contains_key(field)
    }

    /// New value of a changed field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.changed.get(field)
    }

    /// Names of the changed fields, in lexical order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.changed.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.changed.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Merge the changed fields into a stored row.
    pub fn apply_to(&self, row: &mut Value) -> StoreResult<()> {
        let object = row.as_object_mut().ok_or_else(|| StoreError::Serialization {
            reason: "stored row is not a JSON object".to_string(),
        })?;
        for (field, value) in &self.changed {
            object.insert(field.clone(), value.clone());
        }
        Ok(())
    }
}

fn to_object<T: Serialize>(value: &T) -> StoreResult<Map<String, Value>> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(StoreError::Serialization {
            reason: format!("entity must serialize to a JSON object, got {}", kind(&other)),
        }),
        Err(e) => Err(StoreError::Serialization {
            reason: e.to_string(),
        }),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
