#![forbid(unsafe_code)]

//! Two-way binding between scene state and URL query parameters.
//!
//! Objects opt in by attaching a [`UrlSyncCap`] wrapping a
//! [`UrlSyncHandler`]. The [`UrlSyncManager`] walks the tree, gives each
//! parameter name a unique key (`name`, `name-2`, ...) and keeps the
//! location in step with state in both directions.

mod key_mapper;
mod manager;

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use scenes_core::{SceneObject, StatePatch};
use serde_json::Value;

use crate::variables::scalar_to_string;

pub use key_mapper::UniqueUrlKeyMapper;
pub use manager::{HistoryEntry, LocationService, MemoryLocation, UrlSyncManager, UrlSyncOptions};

/// A parameter value: one string or a repeated parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlValue {
    /// `key=value`.
    Single(String),
    /// `key=a&key=b`.
    Multi(Vec<String>),
}

impl UrlValue {
    /// Every value as a list.
    #[must_use]
    pub fn as_list(&self) -> Vec<String> {
        match self {
            Self::Single(v) => vec![v.clone()],
            Self::Multi(items) => items.clone(),
        }
    }

    /// The first value.
    #[must_use]
    pub fn first(&self) -> Option<&str> {
        match self {
            Self::Single(v) => Some(v),
            Self::Multi(items) => items.first().map(String::as_str),
        }
    }
}

/// Parameter values by key; `None` removes the parameter.
pub type UrlState = BTreeMap<String, Option<UrlValue>>;

/// Percent-encode everything but RFC 3986 unreserved characters.
#[must_use]
pub fn encode_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Decode `%XX` escapes and `+`. Malformed escapes are kept literally.
#[must_use]
pub fn decode_component(encoded: &str) -> String {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok());
                match hex {
                    Some(decoded) => {
                        out.push(decoded);
                        i += 3;
                        continue;
                    }
                    None => out.push(b'%'),
                }
            }
            other => out.push(other),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// An ordered query string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    params: IndexMap<String, Vec<String>>,
}

impl QueryParams {
    /// Empty parameters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `a=1&b=2`, with or without a leading `?`.
    #[must_use]
    pub fn parse(search: &str) -> Self {
        let mut params = Self::new();
        for pair in search.trim_start_matches('?').split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            params
                .params
                .entry(decode_component(key))
                .or_default()
                .push(decode_component(value));
        }
        params
    }

    /// Value of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<UrlValue> {
        match self.params.get(key)?.as_slice() {
            [] => None,
            [single] => Some(UrlValue::Single(single.clone())),
            many => Some(UrlValue::Multi(many.to_vec())),
        }
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    /// Set or (with `None`) remove `key`, keeping its position.
    pub fn set(&mut self, key: &str, value: Option<&UrlValue>) {
        match value {
            Some(value) => {
                self.params.insert(key.to_owned(), value.as_list());
            }
            None => {
                self.params.shift_remove(key);
            }
        }
    }

    /// Keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }

    /// Whether there are no parameters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Serialize without a leading `?`.
    #[must_use]
    pub fn to_query_string(&self) -> String {
        self.params
            .iter()
            .flat_map(|(key, values)| {
                values
                    .iter()
                    .map(move |v| format!("{}={}", encode_component(key), encode_component(v)))
            })
            .collect::<Vec<_>>()
            .join("&")
    }
}

impl fmt::Display for QueryParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_query_string())
    }
}

/// URL behavior of one scene object.
pub trait UrlSyncHandler {
    /// Parameter names this object owns, before uniquing.
    fn keys(&self, object: &SceneObject) -> Vec<String>;

    /// Current values for [`keys`](Self::keys).
    fn get_url_state(&self, object: &SceneObject) -> UrlState;

    /// Apply values read from the URL. Keys absent from `values` are left
    /// alone; `None` means the parameter was removed.
    fn update_from_url(&self, object: &SceneObject, values: &UrlState);

    /// Whether a change should push a history entry instead of replacing.
    fn should_create_history_step(&self, _object: &SceneObject) -> bool {
        false
    }
}

/// Capability marking an object as URL-synced.
#[derive(Clone)]
pub struct UrlSyncCap(pub Rc<dyn UrlSyncHandler>);

type SerializeFn = Rc<dyn Fn(&Value) -> Option<UrlValue>>;
type DeserializeFn = Rc<dyn Fn(&UrlValue) -> Option<Value>>;

/// One state field mirrored into one parameter.
#[derive(Clone)]
pub struct SyncedField {
    state_field: String,
    url_key: String,
    serialize: SerializeFn,
    deserialize: DeserializeFn,
}

impl SyncedField {
    /// A field with custom conversions.
    pub fn custom(
        state_field: impl Into<String>,
        serialize: impl Fn(&Value) -> Option<UrlValue> + 'static,
        deserialize: impl Fn(&UrlValue) -> Option<Value> + 'static,
    ) -> Self {
        let state_field = state_field.into();
        Self {
            url_key: state_field.clone(),
            state_field,
            serialize: Rc::new(serialize),
            deserialize: Rc::new(deserialize),
        }
    }

    /// A string field.
    pub fn string(state_field: impl Into<String>) -> Self {
        Self::custom(
            state_field,
            |v| match v {
                Value::Null => None,
                other => Some(UrlValue::Single(scalar_to_string(other))),
            },
            |u| u.first().map(|s| Value::String(s.to_owned())),
        )
    }

    /// A string-array field, written as a repeated parameter.
    pub fn string_list(state_field: impl Into<String>) -> Self {
        Self::custom(
            state_field,
            |v| match v {
                Value::Array(items) => Some(UrlValue::Multi(items.iter().map(scalar_to_string).collect())),
                Value::Null => None,
                other => Some(UrlValue::Multi(vec![scalar_to_string(other)])),
            },
            |u| Some(Value::from(u.as_list())),
        )
    }

    /// A numeric field.
    pub fn number(state_field: impl Into<String>) -> Self {
        Self::custom(
            state_field,
            |v| v.as_f64().map(|_| UrlValue::Single(v.to_string())),
            |u| {
                let raw = u.first()?;
                raw.parse::<i64>()
                    .map(Value::from)
                    .ok()
                    .or_else(|| raw.parse::<f64>().ok().map(Value::from))
            },
        )
    }

    /// A boolean field.
    pub fn boolean(state_field: impl Into<String>) -> Self {
        Self::custom(
            state_field,
            |v| v.as_bool().map(|b| UrlValue::Single(b.to_string())),
            |u| match u.first()? {
                "true" | "1" => Some(Value::Bool(true)),
                "false" | "0" => Some(Value::Bool(false)),
                _ => None,
            },
        )
    }

    /// Use `url_key` as the parameter name instead of the field name.
    #[must_use]
    pub fn with_url_key(mut self, url_key: impl Into<String>) -> Self {
        self.url_key = url_key.into();
        self
    }
}

impl fmt::Debug for SyncedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncedField")
            .field("state_field", &self.state_field)
            .field("url_key", &self.url_key)
            .finish_non_exhaustive()
    }
}

/// [`UrlSyncHandler`] mirroring plain state fields.
#[derive(Debug, Clone, Default)]
pub struct StateFieldSync {
    fields: Vec<SyncedField>,
    history_steps: bool,
}

impl StateFieldSync {
    /// No fields yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field.
    #[must_use]
    pub fn field(mut self, field: SyncedField) -> Self {
        self.fields.push(field);
        self
    }

    /// Push history entries on change.
    #[must_use]
    pub fn with_history_steps(mut self, history_steps: bool) -> Self {
        self.history_steps = history_steps;
        self
    }

    /// Attach to `object`.
    pub fn attach_to(self, object: &SceneObject) {
        object.attach(Rc::new(UrlSyncCap(Rc::new(self))));
    }
}

impl UrlSyncHandler for StateFieldSync {
    fn keys(&self, _object: &SceneObject) -> Vec<String> {
        self.fields.iter().map(|f| f.url_key.clone()).collect()
    }

    fn get_url_state(&self, object: &SceneObject) -> UrlState {
        let state = object.state();
        self.fields
            .iter()
            .map(|f| {
                let value = state.get(&f.state_field).and_then(|v| (f.serialize)(v));
                (f.url_key.clone(), value)
            })
            .collect()
    }

    fn update_from_url(&self, object: &SceneObject, values: &UrlState) {
        let state = object.state();
        let mut patch = StatePatch::new();
        for field in &self.fields {
            match values.get(&field.url_key) {
                Some(Some(url_value)) => {
                    if let Some(value) = (field.deserialize)(url_value) {
                        if state.get(&field.state_field) != Some(&value) {
                            patch.insert(field.state_field.clone(), value);
                        }
                    }
                }
                Some(None) => {
                    if state.contains(&field.state_field) {
                        patch = patch.remove(field.state_field.clone());
                    }
                }
                None => {}
            }
        }
        if !patch.is_empty() {
            object.set_state(patch);
        }
    }

    fn should_create_history_step(&self, _object: &SceneObject) -> bool {
        self.history_steps
    }
}
