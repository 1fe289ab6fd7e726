#![forbid(unsafe_code)]

//! Scene variables.
//!
//! A [`SceneVariable`] is a scene object whose state carries a current
//! `value`/`text` pair and, for option-backed kinds, the list of candidate
//! `options`. Where the options come from is decided by its
//! [`VariableSource`] (a CSV list, a JSON document, an interval list, an
//! external query).
//!
//! Variables live as children of a [`SceneVariableSet`], which validates
//! them in dependency order and tells dependent objects when a value changed.
//!
//! # State fields
//!
//! | field          | type                 |
//! |----------------|----------------------|
//! | `name`         | string               |
//! | `label`        | string               |
//! | `value`        | string or string[]   |
//! | `text`         | string or string[]   |
//! | `options`      | `{label, value}[]`   |
//! | `loading`      | bool                 |
//! | `error`        | string or null       |
//! | `isMulti`      | bool                 |
//! | `includeAll`   | bool                 |
//! | `allValue`     | string (optional)    |
//! | `defaultToAll` | bool                 |
//! | `skipUrlSync`  | bool                 |
//! | `hide`         | 0, 1 or 2            |
//!
//! # Invariants
//!
//! 1. `value` and `text` have the same shape; for multi values `text[i]`
//!    labels `value[i]`.
//! 2. A failed option fetch leaves `value` untouched and records the message
//!    in `error`.

mod dependency;
mod lookup;
mod set;
mod sources;

use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;

use scenes_core::{Deferred, SceneObject, StatePatch, StateSnapshot};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::url_sync::{UrlState, UrlSyncCap, UrlSyncHandler, UrlValue};

pub use dependency::{BatchId, VariableDependencyConfig, extract_variable_names};
pub(crate) use dependency::VARIABLE_REGEX;
pub use lookup::{
    has_variable_dependency_in_loading_state, lookup_variable, nearest_variable_set,
    visible_variables,
};
pub use set::{SceneVariableSet, VARIABLE_SET_UPDATE_COMPLETED};
pub use sources::{
    ConstantSource, CustomSource, FnOptionsProvider, IntervalSource, JsonSource, OptionsProvider,
    QuerySource, TextBoxSource, parse_custom_options,
};

/// Sentinel value meaning "every option is selected".
pub const ALL_VARIABLE_VALUE: &str = "$__all";
/// Display text for [`ALL_VARIABLE_VALUE`].
pub const ALL_VARIABLE_TEXT: &str = "All";
/// Dependency name that matches every variable.
pub const ALL_VARIABLES_SENTINEL: &str = "__all_variables";
/// Value of the automatic interval option.
pub const AUTO_VARIABLE_VALUE: &str = "$__auto";
/// Custom event published (bubbling) when a variable's value changes.
pub const VALUE_CHANGED_EVENT: &str = "scene-variable-value-changed";

/// A variable's value: one string or a list of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariableValue {
    /// A single value.
    Single(String),
    /// A multi-value selection.
    Multi(Vec<String>),
}

impl VariableValue {
    /// Read a value from JSON; scalars become strings.
    #[must_use]
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Array(items) => Self::Multi(items.iter().map(scalar_to_string).collect()),
            other => Self::Single(scalar_to_string(other)),
        }
    }

    /// Render as JSON.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Single(s) => Value::String(s.clone()),
            Self::Multi(items) => json!(items),
        }
    }

    /// Every value as a list.
    #[must_use]
    pub fn as_list(&self) -> Vec<String> {
        match self {
            Self::Single(s) => vec![s.clone()],
            Self::Multi(items) => items.clone(),
        }
    }

    /// The first value, if any.
    #[must_use]
    pub fn first(&self) -> Option<&str> {
        match self {
            Self::Single(s) => Some(s.as_str()),
            Self::Multi(items) => items.first().map(String::as_str),
        }
    }

    /// Whether the value contains `candidate`.
    #[must_use]
    pub fn contains(&self, candidate: &str) -> bool {
        match self {
            Self::Single(s) => s == candidate,
            Self::Multi(items) => items.iter().any(|v| v == candidate),
        }
    }
}

impl From<&str> for VariableValue {
    fn from(value: &str) -> Self {
        Self::Single(value.to_owned())
    }
}

impl From<String> for VariableValue {
    fn from(value: String) -> Self {
        Self::Single(value)
    }
}

impl From<Vec<String>> for VariableValue {
    fn from(value: Vec<String>) -> Self {
        Self::Multi(value)
    }
}

impl From<Vec<&str>> for VariableValue {
    fn from(value: Vec<&str>) -> Self {
        Self::Multi(value.into_iter().map(str::to_owned).collect())
    }
}

impl fmt::Display for VariableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(s) => f.write_str(s),
            Self::Multi(items) => f.write_str(&items.join(",")),
        }
    }
}

pub(crate) fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// One selectable option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableOption {
    /// Display label.
    pub label: String,
    /// Interpolated value.
    pub value: String,
}

impl VariableOption {
    /// Option with distinct label and value.
    #[must_use]
    pub fn new(label: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            value: value.into(),
        }
    }

    /// Option whose label is its value.
    #[must_use]
    pub fn same(value: impl Into<String>) -> Self {
        let value = value.into();
        Self {
            label: value.clone(),
            value,
        }
    }
}

/// A variable value ready for formatting.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedValue {
    /// A single string.
    Text(String),
    /// A list of strings.
    List(Vec<String>),
    /// A user-supplied replacement for "All"; inserted verbatim.
    CustomAll(String),
}

impl ResolvedValue {
    /// Convert a JSON value; arrays become lists.
    #[must_use]
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Array(items) => Self::List(items.iter().map(scalar_to_string).collect()),
            other => Self::Text(scalar_to_string(other)),
        }
    }

    /// Every value as a list.
    #[must_use]
    pub fn as_list(&self) -> Vec<String> {
        match self {
            Self::Text(s) | Self::CustomAll(s) => vec![s.clone()],
            Self::List(items) => items.clone(),
        }
    }
}

/// Visibility of a variable in the controls bar.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VariableHide {
    /// Show label and control.
    #[default]
    DontHide,
    /// Show the control only.
    HideLabel,
    /// Hide entirely.
    HideVariable,
}

impl VariableHide {
    fn as_i64(self) -> i64 {
        match self {
            Self::DontHide => 0,
            Self::HideLabel => 1,
            Self::HideVariable => 2,
        }
    }
}

/// Initial settings for a variable.
#[derive(Debug, Clone, Default)]
pub struct VariableConfig {
    /// Display label; defaults to the name.
    pub label: Option<String>,
    /// Initial value.
    pub value: Option<VariableValue>,
    /// Initial text; defaults to the value.
    pub text: Option<VariableValue>,
    /// Allow several values at once.
    pub is_multi: bool,
    /// Offer the "All" option.
    pub include_all: bool,
    /// Replacement interpolated for "All".
    pub all_value: Option<String>,
    /// Select "All" when the current value is not among the options.
    pub default_to_all: bool,
    /// Leave the variable out of the URL.
    pub skip_url_sync: bool,
    /// Visibility.
    pub hide: VariableHide,
}

impl VariableConfig {
    /// Set the label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set the initial value.
    #[must_use]
    pub fn with_value(mut self, value: impl Into<VariableValue>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Set the initial text.
    #[must_use]
    pub fn with_text(mut self, text: impl Into<VariableValue>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Allow multiple values.
    #[must_use]
    pub fn with_multi(mut self, is_multi: bool) -> Self {
        self.is_multi = is_multi;
        self
    }

    /// Offer the "All" option.
    #[must_use]
    pub fn with_include_all(mut self, include_all: bool) -> Self {
        self.include_all = include_all;
        self
    }

    /// Interpolate `all_value` when "All" is selected.
    #[must_use]
    pub fn with_all_value(mut self, all_value: impl Into<String>) -> Self {
        self.all_value = Some(all_value.into());
        self
    }

    /// Fall back to "All" instead of the first option.
    #[must_use]
    pub fn with_default_to_all(mut self, default_to_all: bool) -> Self {
        self.default_to_all = default_to_all;
        self
    }

    /// Exclude from URL sync.
    #[must_use]
    pub fn with_skip_url_sync(mut self, skip: bool) -> Self {
        self.skip_url_sync = skip;
        self
    }

    /// Set visibility.
    #[must_use]
    pub fn with_hide(mut self, hide: VariableHide) -> Self {
        self.hide = hide;
        self
    }
}

/// Where a variable's options come from.
pub trait VariableSource {
    /// Runtime type name, e.g. `"CustomVariable"`.
    fn kind(&self) -> &'static str;

    /// State fields scanned for references to other variables.
    fn dependency_paths(&self) -> &'static [&'static str] {
        &[]
    }

    /// Whether the variable validates against an option list at all.
    fn has_options(&self) -> bool {
        true
    }

    /// Extra state fields written at construction.
    fn init_state(&self, _state: &mut Map<String, Value>) {}

    /// Fetch the current option list.
    fn get_options(&self, _variable: &SceneVariable) -> Deferred<Result<Vec<VariableOption>, String>> {
        Deferred::ready(Ok(Vec::new()))
    }

    /// Override the interpolated value (e.g. a computed automatic interval).
    fn resolve_value(&self, _variable: &SceneVariable) -> Option<ResolvedValue> {
        None
    }
}

struct VariableCore {
    source: Box<dyn VariableSource>,
}

/// A named value source living in a [`SceneVariableSet`].
#[derive(Clone)]
pub struct SceneVariable {
    object: SceneObject,
    core: Rc<VariableCore>,
}

impl SceneVariable {
    /// Build a variable backed by `source`.
    pub fn new(
        name: impl Into<String>,
        source: impl VariableSource + 'static,
        config: VariableConfig,
    ) -> Self {
        let name = name.into();
        let value = config.value.clone().unwrap_or_else(|| {
            if config.is_multi {
                VariableValue::Multi(Vec::new())
            } else {
                VariableValue::Single(String::new())
            }
        });
        let text = config.text.clone().unwrap_or_else(|| value.clone());

        let mut state = Map::new();
        state.insert("name".into(), json!(name));
        state.insert(
            "label".into(),
            json!(config.label.clone().unwrap_or_else(|| name.clone())),
        );
        state.insert("type".into(), json!(source.kind()));
        state.insert("value".into(), value.to_json());
        state.insert("text".into(), text.to_json());
        state.insert("options".into(), json!([]));
        state.insert("loading".into(), json!(false));
        state.insert("error".into(), Value::Null);
        state.insert("isMulti".into(), json!(config.is_multi));
        state.insert("includeAll".into(), json!(config.include_all));
        if let Some(all) = &config.all_value {
            state.insert("allValue".into(), json!(all));
        }
        state.insert("defaultToAll".into(), json!(config.default_to_all));
        state.insert("skipUrlSync".into(), json!(config.skip_url_sync));
        state.insert("hide".into(), json!(config.hide.as_i64()));
        source.init_state(&mut state);

        let paths = source.dependency_paths();
        let object = SceneObject::new(source.kind(), StateSnapshot::from(state));
        let core = Rc::new(VariableCore {
            source: Box::new(source),
        });
        object.attach(Rc::clone(&core));
        VariableDependencyConfig::for_paths(paths.iter().copied()).attach_to(&object);
        object.attach(Rc::new(UrlSyncCap(Rc::new(VariableUrlSync))));

        Self { object, core }
    }

    /// Recover the variable view of a scene object.
    #[must_use]
    pub fn from_object(object: &SceneObject) -> Option<Self> {
        object.capability::<VariableCore>().map(|core| Self {
            object: object.clone(),
            core,
        })
    }

    /// The underlying scene object.
    #[must_use]
    pub fn object(&self) -> &SceneObject {
        &self.object
    }

    /// Variable name.
    #[must_use]
    pub fn name(&self) -> String {
        self.object
            .state()
            .get_str("name")
            .unwrap_or_default()
            .to_owned()
    }

    /// Current value.
    #[must_use]
    pub fn value(&self) -> VariableValue {
        VariableValue::from_json(self.object.state().get("value").unwrap_or(&Value::Null))
    }

    /// Current text.
    #[must_use]
    pub fn text(&self) -> VariableValue {
        VariableValue::from_json(self.object.state().get("text").unwrap_or(&Value::Null))
    }

    /// Current option list.
    #[must_use]
    pub fn options(&self) -> Vec<VariableOption> {
        self.object
            .state()
            .get("options")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    fn flag(&self, field: &str) -> bool {
        self.object.state().get_bool(field).unwrap_or(false)
    }

    /// Whether several values may be selected.
    #[must_use]
    pub fn is_multi(&self) -> bool {
        self.flag("isMulti")
    }

    /// Whether the "All" option is offered.
    #[must_use]
    pub fn include_all(&self) -> bool {
        self.flag("includeAll")
    }

    /// Whether the variable falls back to "All".
    #[must_use]
    pub fn default_to_all(&self) -> bool {
        self.flag("defaultToAll")
    }

    /// Whether the variable is excluded from the URL.
    #[must_use]
    pub fn skip_url_sync(&self) -> bool {
        self.flag("skipUrlSync")
    }

    /// Whether options are being fetched.
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.flag("loading")
    }

    /// Last option-fetch error.
    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.object.state().get_str("error").map(str::to_owned)
    }

    /// Custom "All" replacement.
    #[must_use]
    pub fn all_value(&self) -> Option<String> {
        self.object.state().get_str("allValue").map(str::to_owned)
    }

    /// Whether the variable validates against options.
    #[must_use]
    pub fn has_options(&self) -> bool {
        self.core.source.has_options()
    }

    /// Source kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.core.source.kind()
    }

    /// Names of the variables this variable's definition references.
    #[must_use]
    pub fn dependencies(&self) -> BTreeSet<String> {
        self.object
            .capability::<VariableDependencyConfig>()
            .map(|dep| dep.get_names(&self.object))
            .unwrap_or_default()
    }

    /// Whether "All" is the current selection.
    #[must_use]
    pub fn has_all_value(&self) -> bool {
        match self.value() {
            VariableValue::Single(v) => v == ALL_VARIABLE_VALUE,
            VariableValue::Multi(items) => items.first().is_some_and(|v| v == ALL_VARIABLE_VALUE),
        }
    }

    /// Value used for interpolation.
    #[must_use]
    pub fn get_value(&self, field_path: Option<&str>) -> ResolvedValue {
        if field_path == Some("text") {
            return ResolvedValue::Text(self.get_value_text());
        }
        if let Some(resolved) = self.core.source.resolve_value(self) {
            return resolved;
        }
        if self.has_all_value() {
            if let Some(all) = self.all_value() {
                return ResolvedValue::CustomAll(all);
            }
            return ResolvedValue::List(
                self.options()
                    .into_iter()
                    .map(|o| o.value)
                    .filter(|v| v != ALL_VARIABLE_VALUE)
                    .collect(),
            );
        }
        match self.value() {
            VariableValue::Single(v) => ResolvedValue::Text(v),
            VariableValue::Multi(items) => ResolvedValue::List(items),
        }
    }

    /// Human-readable value.
    #[must_use]
    pub fn get_value_text(&self) -> String {
        if self.has_all_value() {
            return ALL_VARIABLE_TEXT.to_owned();
        }
        match self.text() {
            VariableValue::Single(t) if t.is_empty() => self.value().to_string(),
            VariableValue::Single(t) => t,
            VariableValue::Multi(items) => items.join(" + "),
        }
    }

    fn label_for(options: &[VariableOption], value: &str) -> String {
        if value == ALL_VARIABLE_VALUE {
            return ALL_VARIABLE_TEXT.to_owned();
        }
        options
            .iter()
            .find(|o| o.value == value)
            .map_or_else(|| value.to_owned(), |o| o.label.clone())
    }

    fn normalize(&self, value: VariableValue) -> VariableValue {
        if !self.is_multi() {
            return match value {
                VariableValue::Multi(items) => {
                    VariableValue::Single(items.into_iter().next().unwrap_or_default())
                }
                single => single,
            };
        }
        let mut items = value.as_list();
        if items.len() > 1 && items.iter().any(|v| v == ALL_VARIABLE_VALUE) {
            if items.last().is_some_and(|v| v == ALL_VARIABLE_VALUE) {
                items = vec![ALL_VARIABLE_VALUE.to_owned()];
            } else {
                items.retain(|v| v != ALL_VARIABLE_VALUE);
            }
        }
        VariableValue::Multi(items)
    }

    /// Select a new value.
    ///
    /// `text` defaults to the matching option labels. Publishes
    /// [`VALUE_CHANGED_EVENT`] when value or text actually changed.
    pub fn change_value_to(&self, value: impl Into<VariableValue>, text: Option<VariableValue>) {
        let value = self.normalize(value.into());
        let options = self.options();
        let text = text.unwrap_or_else(|| match &value {
            VariableValue::Single(v) => VariableValue::Single(Self::label_for(&options, v)),
            VariableValue::Multi(items) => VariableValue::Multi(
                items.iter().map(|v| Self::label_for(&options, v)).collect(),
            ),
        });
        if value == self.value() && text == self.text() {
            return;
        }
        debug!(variable = %self.name(), value = %value, "variable value changed");
        self.object.set_state(
            StatePatch::new()
                .set("value", value.to_json())
                .set("text", text.to_json()),
        );
        self.publish_value_changed();
    }

    fn publish_value_changed(&self) {
        self.object
            .publish_custom(VALUE_CHANGED_EVENT, json!({ "name": self.name() }), true);
    }

    /// Refresh options and reconcile the current value with them.
    ///
    /// Resolves to `Ok(true)` when value or text changed. A fetch failure is
    /// stored in the `error` field and resolves to `Err`.
    pub fn validate_and_update(&self) -> Deferred<Result<bool, String>> {
        if !self.has_options() {
            return Deferred::ready(Ok(false));
        }
        self.object.set_state(
            StatePatch::new()
                .set("loading", true)
                .set("error", Value::Null),
        );
        let fetched = self.core.source.get_options(self);
        let variable = self.clone();
        fetched.map(move |result| match result {
            Ok(options) => Ok(variable.update_options(options)),
            Err(message) => {
                debug!(variable = %variable.name(), error = %message, "option fetch failed");
                variable.object.set_state(
                    StatePatch::new()
                        .set("loading", false)
                        .set("error", message.clone()),
                );
                Err(message)
            }
        })
    }

    fn update_options(&self, options: Vec<VariableOption>) -> bool {
        let prev_value = self.value();
        let prev_text = self.text();
        let (value, text) = self.reconcile(&options);
        self.object.set_state(
            StatePatch::new()
                .set("options", json!(options))
                .set("value", value.to_json())
                .set("text", text.to_json())
                .set("loading", false)
                .set("error", Value::Null),
        );
        let changed = value != prev_value || text != prev_text;
        if changed {
            self.publish_value_changed();
        }
        changed
    }

    fn default_selection(&self, options: &[VariableOption]) -> (VariableValue, VariableValue) {
        let (value, text) = if self.default_to_all() && self.include_all() {
            (ALL_VARIABLE_VALUE.to_owned(), ALL_VARIABLE_TEXT.to_owned())
        } else if let Some(first) = options.first() {
            (first.value.clone(), first.label.clone())
        } else {
            (String::new(), String::new())
        };
        if self.is_multi() {
            if value.is_empty() {
                return (VariableValue::Multi(Vec::new()), VariableValue::Multi(Vec::new()));
            }
            (VariableValue::Multi(vec![value]), VariableValue::Multi(vec![text]))
        } else {
            (VariableValue::Single(value), VariableValue::Single(text))
        }
    }

    fn reconcile(&self, options: &[VariableOption]) -> (VariableValue, VariableValue) {
        if options.is_empty() {
            return self.default_selection(options);
        }
        if self.has_all_value() {
            if self.include_all() {
                return (self.value(), self.text());
            }
            return self.default_selection(options);
        }

        let current = self.value();
        let current_text = self.text().as_list();
        if self.is_multi() {
            let matched: Vec<&VariableOption> = current
                .as_list()
                .iter()
                .enumerate()
                .filter_map(|(i, v)| {
                    options.iter().find(|o| &o.value == v).or_else(|| {
                        current_text
                            .get(i)
                            .and_then(|t| options.iter().find(|o| &o.label == t))
                    })
                })
                .collect();
            if matched.is_empty() {
                return self.default_selection(options);
            }
            return (
                VariableValue::Multi(matched.iter().map(|o| o.value.clone()).collect()),
                VariableValue::Multi(matched.iter().map(|o| o.label.clone()).collect()),
            );
        }

        let value = current.first().unwrap_or_default().to_owned();
        let found = options.iter().find(|o| o.value == value).or_else(|| {
            current_text
                .first()
                .and_then(|t| options.iter().find(|o| &o.label == t))
        });
        match found {
            Some(option) => (
                VariableValue::Single(option.value.clone()),
                VariableValue::Single(option.label.clone()),
            ),
            None => self.default_selection(options),
        }
    }
}

impl PartialEq for SceneVariable {
    fn eq(&self, other: &Self) -> bool {
        self.object.ptr_eq(&other.object)
    }
}

impl fmt::Debug for SceneVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SceneVariable")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .field("value", &self.value())
            .finish()
    }
}

/// URL binding for variables: one `var-<name>` parameter.
struct VariableUrlSync;

impl VariableUrlSync {
    fn url_key(variable: &SceneVariable) -> String {
        format!("var-{}", variable.name())
    }
}

impl UrlSyncHandler for VariableUrlSync {
    fn keys(&self, object: &SceneObject) -> Vec<String> {
        match SceneVariable::from_object(object) {
            Some(variable) if !variable.skip_url_sync() => vec![Self::url_key(&variable)],
            _ => Vec::new(),
        }
    }

    fn get_url_state(&self, object: &SceneObject) -> UrlState {
        let mut state = UrlState::new();
        if let Some(variable) = SceneVariable::from_object(object) {
            if variable.skip_url_sync() {
                return state;
            }
            let value = match variable.value() {
                VariableValue::Single(v) => UrlValue::Single(v),
                VariableValue::Multi(items) => UrlValue::Multi(items),
            };
            state.insert(Self::url_key(&variable), Some(value));
        }
        state
    }

    fn update_from_url(&self, object: &SceneObject, values: &UrlState) {
        let Some(variable) = SceneVariable::from_object(object) else {
            return;
        };
        let Some(Some(url_value)) = values.get(&Self::url_key(&variable)) else {
            return;
        };
        let items: Vec<String> = url_value
            .as_list()
            .into_iter()
            .map(|v| {
                if v == ALL_VARIABLE_TEXT {
                    ALL_VARIABLE_VALUE.to_owned()
                } else {
                    v
                }
            })
            .collect();
        let value = if variable.is_multi() {
            VariableValue::Multi(items)
        } else {
            VariableValue::Single(items.into_iter().next().unwrap_or_default())
        };
        variable.change_value_to(value, None);
    }
}
