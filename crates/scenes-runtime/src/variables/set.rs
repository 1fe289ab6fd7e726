#![forbid(unsafe_code)]

//! The variable set: ordered validation and dependent notification.
//!
//! # Update scheduling
//!
//! The set keeps two collections:
//!
//! - `to_update`: variables that need validation, in declaration order;
//! - `updating`: variables whose validation is in flight.
//!
//! A batch starts every queued variable none of whose dependencies is still
//! queued. When a validation completes, the variable leaves both
//! collections; if its value changed, the variables referencing it are
//! queued; the next batch starts; and finally every dependent object in the
//! owner's subtree is told about the completion.
//!
//! # Notification walk
//!
//! Starting at the set's owner, the walk visits nodes in pre-order, skipping
//! the set itself, inactive nodes, and any subtree whose own `$variables`
//! defines the same name (it is shadowed there).
//!
//! # Invariants
//!
//! 1. A variable is never validated while one of its dependencies is queued.
//! 2. Deactivating the set cancels every in-flight validation.
//! 3. [`VARIABLE_SET_UPDATE_COMPLETED`] is published once the set is idle
//!    after at least one validation.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};
use scenes_core::{SceneEvent, SceneObject, Slot, StateSnapshot, Subscription, WeakSceneObject, Walk};
use serde_json::json;
use tracing::{debug, trace};

use super::dependency::{BatchId, VariableDependencyConfig};
use super::{SceneVariable, VALUE_CHANGED_EVENT};

/// Custom event published (bubbling) when the set has no pending work.
pub const VARIABLE_SET_UPDATE_COMPLETED: &str = "variable-set-update-completed";

struct SetCore {
    me: WeakSceneObject,
    to_update: RefCell<IndexSet<String>>,
    updating: RefCell<IndexMap<String, Option<Subscription>>>,
    batch_depth: Cell<u32>,
    batch_seq: Cell<u64>,
}

/// An ordered collection of variables scoped to its owner's subtree.
#[derive(Clone)]
pub struct SceneVariableSet {
    object: SceneObject,
    core: Rc<SetCore>,
}

impl SceneVariableSet {
    /// Build a set; the variables become its children.
    #[must_use]
    pub fn new(variables: Vec<SceneVariable>) -> Self {
        let object = SceneObject::new("SceneVariableSet", StateSnapshot::new());
        let core = Rc::new(SetCore {
            me: object.downgrade(),
            to_update: RefCell::new(IndexSet::new()),
            updating: RefCell::new(IndexMap::new()),
            batch_depth: Cell::new(0),
            batch_seq: Cell::new(0),
        });
        object.attach(Rc::clone(&core));
        let set = Self { object, core };
        for variable in variables {
            set.add_variable(&variable);
        }

        let core = Rc::clone(&set.core);
        set.object.add_activation_handler(move |me| {
            let handle = Rc::clone(&core);
            me.add_subscription(me.subscribe_to_event(move |event| {
                handle.on_event(event);
            }));

            if let Some(set) = SceneVariableSet::from_object(me) {
                let pending: Vec<String> = set
                    .variables()
                    .iter()
                    .filter(|v| v.has_options())
                    .map(SceneVariable::name)
                    .collect();
                core.to_update.borrow_mut().extend(pending);
                set.update_next_batch();
            }

            let core = Rc::clone(&core);
            Ok(Some(Box::new(move || core.cancel_all())))
        });
        set
    }

    /// Recover the set view of a scene object.
    #[must_use]
    pub fn from_object(object: &SceneObject) -> Option<Self> {
        object.capability::<SetCore>().map(|core| Self {
            object: object.clone(),
            core,
        })
    }

    /// The underlying scene object.
    #[must_use]
    pub fn object(&self) -> &SceneObject {
        &self.object
    }

    /// Append a variable.
    pub fn add_variable(&self, variable: &SceneVariable) {
        if let Err(err) = self.object.add_child(variable.object()) {
            tracing::error!(variable = %variable.name(), error = %err, "cannot add variable");
        }
    }

    /// Variables in declaration order.
    #[must_use]
    pub fn variables(&self) -> Vec<SceneVariable> {
        self.object
            .children()
            .iter()
            .filter_map(SceneVariable::from_object)
            .collect()
    }

    /// The variable named `name`.
    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<SceneVariable> {
        self.variables().into_iter().find(|v| v.name() == name)
    }

    /// Whether a validation of `variable` is queued or running, or it is
    /// loading options.
    #[must_use]
    pub fn is_variable_loading_or_waiting_to_update(&self, variable: &SceneVariable) -> bool {
        let name = variable.name();
        variable.is_loading()
            || self.core.updating.borrow().contains_key(&name)
            || self.core.to_update.borrow().contains(&name)
    }

    /// Whether any validation is queued or running.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        !self.core.updating.borrow().is_empty() || !self.core.to_update.borrow().is_empty()
    }

    /// Run `f` with dependent notifications coalesced: each dependent object
    /// receives at most one referenced-value callback for changes made
    /// inside `f`.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        let core = &self.core;
        if core.batch_depth.get() == 0 {
            core.batch_seq.set(core.batch_seq.get() + 1);
        }
        core.batch_depth.set(core.batch_depth.get() + 1);
        let out = f();
        core.batch_depth.set(core.batch_depth.get() - 1);
        out
    }

    /// Queue a variable for validation and start what can start.
    pub fn refresh_variable(&self, variable: &SceneVariable) {
        self.core.to_update.borrow_mut().insert(variable.name());
        self.update_next_batch();
    }

    fn dependents_of(&self, name: &str) -> Vec<SceneVariable> {
        self.variables()
            .into_iter()
            .filter(|v| v.name() != name && v.dependencies().contains(name))
            .collect()
    }

    fn has_dependency_in_update_queue(&self, variable: &SceneVariable) -> bool {
        let name = variable.name();
        let queued = self.core.to_update.borrow();
        variable
            .dependencies()
            .iter()
            .any(|dep| dep != &name && queued.contains(dep))
    }

    fn update_next_batch(&self) {
        let queued: Vec<String> = self.core.to_update.borrow().iter().cloned().collect();
        for name in queued {
            if !self.core.to_update.borrow().contains(&name)
                || self.core.updating.borrow().contains_key(&name)
            {
                continue;
            }
            let Some(variable) = self.get_by_name(&name) else {
                self.core.to_update.borrow_mut().shift_remove(&name);
                continue;
            };
            if self.has_dependency_in_update_queue(&variable) {
                trace!(variable = %name, "waiting for dependencies");
                continue;
            }

            debug!(variable = %name, "validate and update");
            self.core.updating.borrow_mut().insert(name.clone(), None);
            let set = self.clone();
            let completed = variable.clone();
            let sub = variable
                .validate_and_update()
                .subscribe(move |result| set.validate_and_update_completed(&completed, result));
            if let Some(slot) = self.core.updating.borrow_mut().get_mut(&name) {
                *slot = Some(sub);
            }
        }
    }

    fn validate_and_update_completed(&self, variable: &SceneVariable, result: Result<bool, String>) {
        let name = variable.name();
        if self.core.updating.borrow_mut().shift_remove(&name).is_none() {
            return;
        }
        self.core.to_update.borrow_mut().shift_remove(&name);

        let changed = match result {
            Ok(changed) => changed,
            Err(message) => {
                debug!(variable = %name, error = %message, "variable update failed");
                false
            }
        };
        if changed {
            self.queue_dependents(&name);
        }
        self.update_next_batch();
        self.notify_dependent_objects(variable, changed);

        if !self.is_busy() {
            trace!(set = %self.object.key(), "variable set idle");
            self.object
                .publish_custom(VARIABLE_SET_UPDATE_COMPLETED, json!(null), true);
        }
    }

    fn queue_dependents(&self, name: &str) {
        let dependents = self.dependents_of(name);
        let mut queue = self.core.to_update.borrow_mut();
        for dependent in dependents {
            queue.insert(dependent.name());
        }
    }

    fn handle_value_changed(&self, variable: &SceneVariable) {
        let name = variable.name();
        if self.core.updating.borrow().contains_key(&name) {
            return;
        }
        debug!(variable = %name, "variable value changed");
        self.queue_dependents(&name);
        self.update_next_batch();
        self.notify_dependent_objects(variable, true);
    }

    fn current_batch(&self) -> Option<BatchId> {
        (self.core.batch_depth.get() > 0).then(|| BatchId {
            set: Rc::as_ptr(&self.core) as usize,
            seq: self.core.batch_seq.get(),
        })
    }

    fn notify_dependent_objects(&self, variable: &SceneVariable, has_changed: bool) {
        let Some(owner) = self.object.parent() else {
            return;
        };
        let name = variable.name();
        let batch = self.current_batch();
        owner.walk(|node| {
            if node.ptr_eq(&self.object) {
                return Walk::SkipChildren;
            }
            if !node.ptr_eq(&owner) {
                let shadowed = node
                    .slot(Slot::Variables)
                    .and_then(|slot| SceneVariableSet::from_object(&slot))
                    .is_some_and(|set| set.get_by_name(&name).is_some());
                if shadowed {
                    return Walk::SkipChildren;
                }
            }
            if node.is_active() {
                if let Some(dep) = node.capability::<VariableDependencyConfig>() {
                    dep.variable_update_completed(node, variable, has_changed, batch);
                }
            }
            Walk::Continue
        });
    }
}

impl SetCore {
    fn on_event(&self, event: &SceneEvent) {
        let SceneEvent::Custom(custom) = event else {
            return;
        };
        if custom.kind != VALUE_CHANGED_EVENT {
            return;
        }
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let belongs = custom.origin.parent().is_some_and(|p| p.ptr_eq(&me));
        if !belongs {
            return;
        }
        let (Some(set), Some(variable)) = (
            SceneVariableSet::from_object(&me),
            SceneVariable::from_object(&custom.origin),
        ) else {
            return;
        };
        set.handle_value_changed(&variable);
    }

    fn cancel_all(&self) {
        let in_flight = std::mem::take(&mut *self.updating.borrow_mut());
        if !in_flight.is_empty() {
            debug!(count = in_flight.len(), "cancelling variable updates");
        }
        drop(in_flight);
        self.to_update.borrow_mut().clear();
    }
}

impl fmt::Debug for SceneVariableSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SceneVariableSet")
            .field("key", &self.object.key())
            .field("variables", &self.variables().iter().map(SceneVariable::name).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::{
        CustomSource, FnOptionsProvider, QuerySource, VariableConfig, VariableOption,
        VariableValue,
    };
    use scenes_core::{Deferred, Resolver};
    use std::cell::RefCell;

    fn custom(name: &str, query: &str) -> SceneVariable {
        SceneVariable::new(name, CustomSource::new(query), VariableConfig::default())
    }

    fn scene_with(set: &SceneVariableSet) -> SceneObject {
        let root = SceneObject::new("Root", StateSnapshot::new());
        root.set_slot(Slot::Variables, Some(set.object())).unwrap();
        root
    }

    fn recorder(root: &SceneObject, paths: &[&'static str]) -> (SceneObject, Rc<RefCell<Vec<String>>>) {
        let panel = SceneObject::new(
            "Panel",
            StateSnapshot::from_json(json!({ "title": paths.join(" ") })),
        );
        root.add_child(&panel).unwrap();
        let calls = Rc::new(RefCell::new(Vec::new()));
        let c = Rc::clone(&calls);
        VariableDependencyConfig::for_paths(["title"])
            .on_referenced_variable_value_changed(move |_, v| c.borrow_mut().push(v.name()))
            .attach_to(&panel);
        (panel, calls)
    }

    #[test]
    fn activation_validates_variables() {
        let set = SceneVariableSet::new(vec![custom("a", "1,2"), custom("b", "x,y")]);
        let root = scene_with(&set);
        root.activate().unwrap();
        assert_eq!(set.get_by_name("a").unwrap().value(), VariableValue::from("1"));
        assert_eq!(set.get_by_name("b").unwrap().value(), VariableValue::from("x"));
        assert!(!set.is_busy());
    }

    #[test]
    fn dependent_variable_waits_for_its_dependency() {
        type Pending = Rc<RefCell<Vec<(String, Resolver<Result<Vec<VariableOption>, String>>)>>>;
        let pending: Pending = Rc::new(RefCell::new(Vec::new()));
        let p = Rc::clone(&pending);
        let provider = FnOptionsProvider::new(move |query, _| {
            let (d, r) = Deferred::pending();
            p.borrow_mut().push((query.to_owned(), r));
            d
        });

        let server = SceneVariable::new("server", QuerySource::new("servers", provider.clone()), VariableConfig::default());
        let disk = SceneVariable::new("disk", QuerySource::new("disks of $server", provider), VariableConfig::default());
        let set = SceneVariableSet::new(vec![disk.clone(), server.clone()]);
        let root = scene_with(&set);
        root.activate().unwrap();

        assert_eq!(pending.borrow().len(), 1);
        assert_eq!(pending.borrow()[0].0, "servers");
        assert!(set.is_variable_loading_or_waiting_to_update(&disk));

        let (_, resolver) = pending.borrow_mut().remove(0);
        resolver.resolve(Ok(vec![VariableOption::same("web-1")]));

        assert_eq!(pending.borrow().len(), 1);
        assert_eq!(pending.borrow()[0].0, "disks of web-1");
        let (_, resolver) = pending.borrow_mut().remove(0);
        resolver.resolve(Ok(vec![VariableOption::same("sda")]));
        assert_eq!(disk.value(), VariableValue::from("sda"));
        assert!(!set.is_busy());
    }

    #[test]
    fn user_change_notifies_dependents_and_requeues_chained_variables() {
        let a = custom("a", "1,2");
        let b = custom("b", "$a-x,$a-y");
        let set = SceneVariableSet::new(vec![a.clone(), b.clone()]);
        let root = scene_with(&set);
        let (panel, calls) = recorder(&root, &["$b"]);
        root.activate().unwrap();
        panel.activate().unwrap();
        assert_eq!(b.value(), VariableValue::from("1-x"));

        a.change_value_to("2", None);
        assert_eq!(b.value(), VariableValue::from("2-x"));
        assert_eq!(*calls.borrow(), vec!["b"]);
    }

    #[test]
    fn inactive_objects_are_not_notified() {
        let a = custom("a", "1,2");
        let set = SceneVariableSet::new(vec![a.clone()]);
        let root = scene_with(&set);
        let (_panel, calls) = recorder(&root, &["$a"]);
        root.activate().unwrap();
        a.change_value_to("2", None);
        assert!(calls.borrow().is_empty());
    }

    #[test]
    fn shadowed_subtree_is_skipped() {
        let a = custom("a", "1,2");
        let set = SceneVariableSet::new(vec![a.clone()]);
        let root = scene_with(&set);

        let nested = SceneObject::new("Nested", StateSnapshot::new());
        root.add_child(&nested).unwrap();
        let inner = SceneVariableSet::new(vec![custom("a", "9")]);
        nested.set_slot(Slot::Variables, Some(inner.object())).unwrap();
        let (panel, calls) = recorder(&nested, &["$a"]);

        root.activate().unwrap();
        nested.activate().unwrap();
        panel.activate().unwrap();
        a.change_value_to("2", None);
        assert!(calls.borrow().is_empty());
    }

    #[test]
    fn batch_coalesces_referenced_callbacks() {
        let a = custom("a", "1,2");
        let b = custom("b", "3,4");
        let set = SceneVariableSet::new(vec![a.clone(), b.clone()]);
        let root = scene_with(&set);
        let (panel, calls) = recorder(&root, &["$a", "$b"]);
        root.activate().unwrap();
        panel.activate().unwrap();

        set.batch(|| {
            a.change_value_to("2", None);
            b.change_value_to("4", None);
        });
        assert_eq!(calls.borrow().len(), 1);

        a.change_value_to("1", None);
        b.change_value_to("3", None);
        assert_eq!(calls.borrow().len(), 3);
    }

    #[test]
    fn waiting_object_wakes_only_when_its_dependencies_settle() {
        type Pending = Rc<RefCell<Vec<(String, Resolver<Result<Vec<VariableOption>, String>>)>>>;
        let pending: Pending = Rc::new(RefCell::new(Vec::new()));
        let p = Rc::clone(&pending);
        let provider = FnOptionsProvider::new(move |query, _| {
            let (d, r) = Deferred::pending();
            p.borrow_mut().push((query.to_owned(), r));
            d
        });
        let zone = SceneVariable::new("zone", QuerySource::new("zones", provider.clone()), VariableConfig::default());
        let host = SceneVariable::new("host", QuerySource::new("hosts", provider), VariableConfig::default());
        let set = SceneVariableSet::new(vec![zone, host.clone()]);
        let root = scene_with(&set);

        let panel = SceneObject::new("Panel", StateSnapshot::new());
        root.add_child(&panel).unwrap();
        let woken = Rc::new(Cell::new(0));
        let w = Rc::clone(&woken);
        let dep = VariableDependencyConfig::for_names(["host"])
            .on_variable_update_completed(move |_| w.set(w.get() + 1))
            .attach_to(&panel);
        root.activate().unwrap();
        panel.activate().unwrap();
        assert!(dep.has_dependency_in_loading_state(&panel));

        let take = |query: &str| {
            let mut pending = pending.borrow_mut();
            let index = pending.iter().position(|(q, _)| q == query).unwrap();
            pending.remove(index).1
        };
        take("zones").resolve(Ok(vec![VariableOption::same("z1")]));
        assert_eq!(woken.get(), 0);
        assert!(dep.is_waiting_for_variables());

        take("hosts").resolve(Ok(vec![VariableOption::same("h1")]));
        assert_eq!(host.value(), VariableValue::from("h1"));
        assert_eq!(woken.get(), 1);
        assert!(!dep.is_waiting_for_variables());
    }

    #[test]
    fn deactivation_cancels_in_flight_updates() {
        let resolvers = Rc::new(RefCell::new(Vec::new()));
        let r = Rc::clone(&resolvers);
        let provider = FnOptionsProvider::new(move |_, _| {
            let (d, resolver) = Deferred::pending();
            r.borrow_mut().push(resolver);
            d
        });
        let v = SceneVariable::new("q", QuerySource::new("x", provider), VariableConfig::default());
        let set = SceneVariableSet::new(vec![v.clone()]);
        let root = scene_with(&set);
        root.activate().unwrap();
        assert!(set.is_busy());
        root.deactivate();
        assert!(!set.is_busy());

        let resolver: Resolver<Result<Vec<VariableOption>, String>> = resolvers.borrow_mut().remove(0);
        resolver.resolve(Ok(vec![VariableOption::same("late")]));
        assert!(!set.is_busy());
    }

    #[test]
    fn idle_event_bubbles_after_updates() {
        let set = SceneVariableSet::new(vec![custom("a", "1")]);
        let root = scene_with(&set);
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        let _sub = root.subscribe_to_event(move |e| {
            if e.custom_kind() == Some(VARIABLE_SET_UPDATE_COMPLETED) {
                h.set(h.get() + 1);
            }
        });
        root.activate().unwrap();
        assert_eq!(hits.get(), 1);
    }
}
