#![forbid(unsafe_code)]

//! Immutable state snapshots.
//!
//! A scene object's state is a record of named JSON fields. Every mutation
//! produces a new [`StateSnapshot`]; the previous snapshot is never touched.
//! Fields are stored behind `Rc`, so a merge shares every field the patch did
//! not mention with the previous snapshot. Consumers detect "did this field
//! change" by pointer identity ([`StateSnapshot::same_field`]) rather than by
//! deep comparison.
//!
//! # Invariants
//!
//! 1. `merged` never mutates `self`.
//! 2. Fields not named in the patch are pointer-identical in the result.
//! 3. Fields named in the patch get a fresh allocation even when the new
//!    value is deep-equal to the old one (no dirty checking).

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::{Map, Value};

/// An immutable record of named state fields.
#[derive(Clone, Default, PartialEq)]
pub struct StateSnapshot {
    fields: BTreeMap<String, Rc<Value>>,
}

impl StateSnapshot {
    /// Create an empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot from a JSON value.
    ///
    /// Objects become one field per entry; any other value yields an empty
    /// snapshot.
    #[must_use]
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::from(map),
            _ => Self::new(),
        }
    }

    /// Value of a field, if present.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field).map(Rc::as_ref)
    }

    /// Shared handle to a field, for identity comparisons.
    #[must_use]
    pub fn field(&self, field: &str) -> Option<&Rc<Value>> {
        self.fields.get(field)
    }

    /// String value of a field.
    #[must_use]
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    /// Boolean value of a field.
    #[must_use]
    pub fn get_bool(&self, field: &str) -> Option<bool> {
        self.get(field).and_then(Value::as_bool)
    }

    /// Integer value of a field.
    #[must_use]
    pub fn get_i64(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(Value::as_i64)
    }

    /// Whether the snapshot has the field.
    #[must_use]
    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Field names in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the snapshot has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// True when `field` refers to the same allocation in both snapshots
    /// (or is absent from both).
    #[must_use]
    pub fn same_field(&self, other: &Self, field: &str) -> bool {
        match (self.fields.get(field), other.fields.get(field)) {
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }

    /// Produce a new snapshot with `patch` applied over `self`.
    #[must_use]
    pub fn merged(&self, patch: StatePatch) -> Self {
        let mut fields = self.fields.clone();
        for (key, value) in patch.entries {
            match value {
                Some(value) => {
                    fields.insert(key, Rc::new(value));
                }
                None => {
                    fields.remove(&key);
                }
            }
        }
        Self { fields }
    }

    /// Render the snapshot as a JSON object.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.as_ref().clone()))
            .collect();
        Value::Object(map)
    }
}

impl From<Map<String, Value>> for StateSnapshot {
    fn from(map: Map<String, Value>) -> Self {
        Self {
            fields: map.into_iter().map(|(k, v)| (k, Rc::new(v))).collect(),
        }
    }
}

impl fmt::Debug for StateSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.fields.iter().map(|(k, v)| (k, v.as_ref())))
            .finish()
    }
}

impl Serialize for StateSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v.as_ref())?;
        }
        map.end()
    }
}

/// A partial state update.
///
/// Entries are applied in insertion order; a later entry for the same key
/// wins.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StatePatch {
    entries: Vec<(String, Option<Value>)>,
}

impl StatePatch {
    /// Create an empty patch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` to `value`.
    #[must_use]
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.entries.push((key.into(), Some(value.into())));
        self
    }

    /// Remove `key` from the state.
    #[must_use]
    pub fn remove(mut self, key: impl Into<String>) -> Self {
        self.entries.push((key.into(), None));
        self
    }

    /// Append an entry in place.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.entries.push((key.into(), Some(value.into())));
    }

    /// Whether the patch touches no field.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys touched by the patch, in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for StatePatch {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), Some(v.into())))
                .collect(),
        }
    }
}

impl From<Map<String, Value>> for StatePatch {
    fn from(map: Map<String, Value>) -> Self {
        map.into_iter().collect()
    }
}
