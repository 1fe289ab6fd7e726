#![forbid(unsafe_code)]

//! Per-object variable dependency tracking.
//!
//! A [`VariableDependencyConfig`] is attached to a scene object as a
//! capability. It knows which variables the object references, either from
//! an explicit name list or by scanning state fields for `$name`,
//! `${name}`, `${name:fmt}` and `[[name]]` tokens, and reacts when the
//! variable set reports that one of them finished updating.
//!
//! # Invariants
//!
//! 1. Names are rescanned only when the state snapshot identity changed and
//!    at least one scanned field changed identity.
//! 2. Within one variable-set batch, `on_referenced_variable_value_changed`
//!    fires at most once per object.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::rc::Rc;
use std::sync::LazyLock;

use regex::Regex;
use scenes_core::{SceneObject, StateSnapshot};
use serde_json::Value;
use tracing::trace;

use super::lookup::{lookup_variable, owning_set, visible_variables};
use super::{ALL_VARIABLES_SENTINEL, SceneVariable};

/// Matches `$name`, `[[name]]`, `[[name:fmt]]`, `${name}`, `${name.path}`,
/// `${name:fmt}` and `${name.path:fmt}`.
pub(crate) static VARIABLE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\$(\w+)|\[\[(\w+?)(?::(\w+))?\]\]|\$\{(\w+)(?:\.([^:^\}]+))?(?::([^\}]+))?\}",
    )
    .expect("variable regex is valid")
});

/// Variable names referenced in `text`.
#[must_use]
pub fn extract_variable_names(text: &str) -> BTreeSet<String> {
    VARIABLE_REGEX
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(4)))
        .map(|m| m.as_str().to_owned())
        .collect()
}

fn scan_value(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => out.extend(extract_variable_names(s)),
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
        other => out.extend(extract_variable_names(&other.to_string())),
    }
}

/// Identifies one [`SceneVariableSet::batch`](super::SceneVariableSet::batch)
/// invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchId {
    pub(crate) set: usize,
    pub(crate) seq: u64,
}

type ObjectCallback = Rc<dyn Fn(&SceneObject)>;
type VariableCallback = Rc<dyn Fn(&SceneObject, &SceneVariable)>;

#[derive(Default)]
struct ScanCache {
    state: Option<Rc<StateSnapshot>>,
    fields: Vec<(String, Option<Rc<Value>>)>,
    names: BTreeSet<String>,
}

/// Declares which variables an object depends on and how it reacts.
pub struct VariableDependencyConfig {
    explicit_names: Option<BTreeSet<String>>,
    state_paths: Vec<String>,
    cache: RefCell<ScanCache>,
    scans: Cell<u64>,
    on_referenced: Option<VariableCallback>,
    on_completed: Option<ObjectCallback>,
    on_any: Option<VariableCallback>,
    waiting: Cell<bool>,
    last_batch: Cell<Option<BatchId>>,
}

impl VariableDependencyConfig {
    fn with_sources(explicit_names: Option<BTreeSet<String>>, state_paths: Vec<String>) -> Self {
        Self {
            explicit_names,
            state_paths,
            cache: RefCell::new(ScanCache::default()),
            scans: Cell::new(0),
            on_referenced: None,
            on_completed: None,
            on_any: None,
            waiting: Cell::new(false),
            last_batch: Cell::new(None),
        }
    }

    /// Scan the named state fields; `"*"` scans every field.
    pub fn for_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_sources(None, paths.into_iter().map(Into::into).collect())
    }

    /// Depend on a fixed set of names.
    pub fn for_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_sources(Some(names.into_iter().map(Into::into).collect()), Vec::new())
    }

    /// Called when a referenced variable changed value.
    #[must_use]
    pub fn on_referenced_variable_value_changed(
        mut self,
        callback: impl Fn(&SceneObject, &SceneVariable) + 'static,
    ) -> Self {
        self.on_referenced = Some(Rc::new(callback));
        self
    }

    /// Called when variables the object was waiting on finished updating.
    #[must_use]
    pub fn on_variable_update_completed(mut self, callback: impl Fn(&SceneObject) + 'static) -> Self {
        self.on_completed = Some(Rc::new(callback));
        self
    }

    /// Called for every completed variable update, referenced or not.
    #[must_use]
    pub fn on_any_variable_changed(
        mut self,
        callback: impl Fn(&SceneObject, &SceneVariable) + 'static,
    ) -> Self {
        self.on_any = Some(Rc::new(callback));
        self
    }

    /// Attach to `object` as a capability.
    pub fn attach_to(self, object: &SceneObject) -> Rc<Self> {
        let config = Rc::new(self);
        object.attach(Rc::clone(&config));
        config
    }

    /// How many times the state was rescanned.
    #[must_use]
    pub fn scan_count(&self) -> u64 {
        self.scans.get()
    }

    /// Whether the last loading check found a pending dependency.
    #[must_use]
    pub fn is_waiting_for_variables(&self) -> bool {
        self.waiting.get()
    }

    fn watched_fields(&self, state: &StateSnapshot) -> Vec<(String, Option<Rc<Value>>)> {
        if self.state_paths.iter().any(|p| p == "*") {
            return state
                .keys()
                .map(|k| (k.to_owned(), state.field(k).cloned()))
                .collect();
        }
        self.state_paths
            .iter()
            .map(|p| (p.clone(), state.field(p).cloned()))
            .collect()
    }

    /// Names of the variables `object` depends on.
    pub fn get_names(&self, object: &SceneObject) -> BTreeSet<String> {
        if let Some(names) = &self.explicit_names {
            return names.clone();
        }
        let state = object.state();
        let mut cache = self.cache.borrow_mut();
        if cache.state.as_ref().is_some_and(|s| Rc::ptr_eq(s, &state)) {
            return cache.names.clone();
        }

        let fields = self.watched_fields(&state);
        let unchanged = cache.state.is_some()
            && fields.len() == cache.fields.len()
            && fields
                .iter()
                .zip(cache.fields.iter())
                .all(|((k1, v1), (k2, v2))| {
                    k1 == k2
                        && match (v1, v2) {
                            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
                            (None, None) => true,
                            _ => false,
                        }
                });
        cache.state = Some(state);
        if unchanged {
            return cache.names.clone();
        }

        let mut names = BTreeSet::new();
        for value in fields.iter().filter_map(|(_, v)| v.as_deref()) {
            scan_value(value, &mut names);
        }
        self.scans.set(self.scans.get() + 1);
        trace!(key = %object.key(), names = ?names, "dependencies rescanned");
        cache.fields = fields;
        cache.names = names.clone();
        names
    }

    /// Whether `object` references `name` (or every variable).
    pub fn depends_on(&self, object: &SceneObject, name: &str) -> bool {
        let names = self.get_names(object);
        names.contains(name) || names.contains(ALL_VARIABLES_SENTINEL)
    }

    /// React to a finished variable update.
    pub fn variable_update_completed(
        &self,
        object: &SceneObject,
        variable: &SceneVariable,
        has_changed: bool,
        batch: Option<BatchId>,
    ) {
        let dependency_changed = has_changed && self.depends_on(object, &variable.name());

        if let Some(on_any) = &self.on_any {
            on_any(object, variable);
        }

        if dependency_changed {
            if let Some(on_referenced) = &self.on_referenced {
                if batch.is_some() && self.last_batch.get() == batch {
                    trace!(key = %object.key(), "referenced change already handled in batch");
                    return;
                }
                self.last_batch.set(batch);
                on_referenced(object, variable);
            } else if let Some(on_completed) = &self.on_completed {
                self.waiting.set(false);
                on_completed(object);
            } else {
                object.force_render();
            }
        } else if self.waiting.get() && !self.has_dependency_in_loading_state(object) {
            if let Some(on_completed) = &self.on_completed {
                on_completed(object);
            }
        }
    }

    /// Whether a referenced variable is still loading or queued for update.
    ///
    /// Also records the result, so a later completion can wake the object.
    pub fn has_dependency_in_loading_state(&self, object: &SceneObject) -> bool {
        let names = self.get_names(object);
        let candidates: Vec<SceneVariable> = if names.contains(ALL_VARIABLES_SENTINEL) {
            visible_variables(object)
        } else {
            names
                .iter()
                .filter_map(|name| lookup_variable(name, object))
                .collect()
        };
        let loading = candidates.iter().any(|variable| {
            owning_set(variable)
                .map_or_else(|| variable.is_loading(), |set| {
                    set.is_variable_loading_or_waiting_to_update(variable)
                })
        });
        self.waiting.set(loading);
        loading
    }
}
