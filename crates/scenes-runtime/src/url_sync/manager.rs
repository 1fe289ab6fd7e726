#![forbid(unsafe_code)]

//! Keeps the location's query string and the scene in step.
//!
//! # Directions
//!
//! - **State to URL**: the manager listens on the root's event bus. Every
//!   bubbled state change of a synced object is serialized, compared with
//!   the current parameters, and written as one partial update (replace by
//!   default, push when both the object and the options ask for history
//!   steps).
//! - **URL to state**: on [`init_sync`](UrlSyncManager::init_sync) and
//!   [`handle_new_location`](UrlSyncManager::handle_new_location) the tree
//!   is walked root first, pre-order, so unique keys are assigned in a
//!   stable order, and each object receives the values of its keys.
//!
//! # Invariants
//!
//! 1. Inside [`batch`](UrlSyncManager::batch) all writes coalesce into at
//!    most one location update.
//! 2. A variable change and the dependent updates it cascades into write
//!    the location once, when every variable set under the root is idle.
//! 3. Applying URL values never writes back to the location.
//! 4. A location the manager wrote itself is not applied again.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use scenes_core::{SceneEvent, SceneObject, Subscription, Walk, WeakSceneObject};
use tracing::{debug, trace};

use crate::variables::{SceneVariable, SceneVariableSet, VALUE_CHANGED_EVENT, VARIABLE_SET_UPDATE_COMPLETED};

use super::key_mapper::UniqueUrlKeyMapper;
use super::{QueryParams, UrlState, UrlSyncCap};

/// Where the query string lives (a browser history, a test double).
pub trait LocationService {
    /// Current query string, without `?`.
    fn search(&self) -> String;
    /// Navigate, adding a history entry.
    fn push(&self, search: &str);
    /// Navigate, replacing the current entry.
    fn replace(&self, search: &str);
}

/// One recorded navigation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Query string after the navigation.
    pub search: String,
    /// Whether it replaced the previous entry.
    pub replaced: bool,
}

/// In-memory [`LocationService`] recording every navigation.
#[derive(Debug, Default)]
pub struct MemoryLocation {
    current: RefCell<String>,
    history: RefCell<Vec<HistoryEntry>>,
}

impl MemoryLocation {
    /// Location starting at `search`.
    #[must_use]
    pub fn new(search: impl Into<String>) -> Self {
        Self {
            current: RefCell::new(search.into().trim_start_matches('?').to_owned()),
            history: RefCell::new(Vec::new()),
        }
    }

    /// Simulate an external navigation (back button, pasted link). The
    /// manager still has to be told via `handle_new_location`.
    pub fn navigate(&self, search: impl Into<String>) {
        *self.current.borrow_mut() = search.into().trim_start_matches('?').to_owned();
    }

    /// Navigations performed through the service.
    #[must_use]
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.borrow().clone()
    }

    /// Parsed current parameters.
    #[must_use]
    pub fn params(&self) -> QueryParams {
        QueryParams::parse(&self.current.borrow())
    }

    fn record(&self, search: &str, replaced: bool) {
        *self.current.borrow_mut() = search.to_owned();
        self.history.borrow_mut().push(HistoryEntry {
            search: search.to_owned(),
            replaced,
        });
    }
}

impl LocationService for MemoryLocation {
    fn search(&self) -> String {
        self.current.borrow().clone()
    }

    fn push(&self, search: &str) {
        self.record(search, false);
    }

    fn replace(&self, search: &str) {
        self.record(search, true);
    }
}

/// Manager settings.
#[derive(Debug, Clone, Default)]
pub struct UrlSyncOptions {
    /// Write the scene's full URL state right after `init_sync`.
    pub update_url_on_init: bool,
    /// Allow objects to push history entries.
    pub create_browser_history_steps: bool,
    /// Prefix for every key, as `<namespace>-<key>`.
    pub namespace: Option<String>,
    /// Keys left without the namespace prefix.
    pub exclude_from_namespace: Vec<String>,
}

impl UrlSyncOptions {
    /// Write URL state on init.
    #[must_use]
    pub fn with_update_url_on_init(mut self, update: bool) -> Self {
        self.update_url_on_init = update;
        self
    }

    /// Allow history entries.
    #[must_use]
    pub fn with_browser_history_steps(mut self, steps: bool) -> Self {
        self.create_browser_history_steps = steps;
        self
    }

    /// Prefix keys with `namespace`.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Keep `keys` unprefixed.
    #[must_use]
    pub fn with_exclude_from_namespace<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_from_namespace = keys.into_iter().map(Into::into).collect();
        self
    }
}

struct PendingWrite {
    params: QueryParams,
    push: bool,
}

struct ManagerInner {
    location: Rc<dyn LocationService>,
    options: UrlSyncOptions,
    mapper: UniqueUrlKeyMapper,
    root: RefCell<WeakSceneObject>,
    subscription: RefCell<Option<Subscription>>,
    last_search: RefCell<Option<String>>,
    applying: Cell<bool>,
    batch_depth: Cell<u32>,
    pending: RefCell<Option<PendingWrite>>,
}

/// Two-way URL synchronization for one scene.
#[derive(Clone)]
pub struct UrlSyncManager {
    inner: Rc<ManagerInner>,
}

impl UrlSyncManager {
    /// Manager writing to `location`.
    pub fn new(location: Rc<dyn LocationService>, options: UrlSyncOptions) -> Self {
        Self {
            inner: Rc::new(ManagerInner {
                location,
                options,
                mapper: UniqueUrlKeyMapper::new(),
                root: RefCell::new(WeakSceneObject::default()),
                subscription: RefCell::new(None),
                last_search: RefCell::new(None),
                applying: Cell::new(false),
                batch_depth: Cell::new(0),
                pending: RefCell::new(None),
            }),
        }
    }

    /// Start syncing the scene under `root`: apply the current URL, then
    /// listen for state changes.
    pub fn init_sync(&self, root: &SceneObject) {
        self.cleanup();
        debug!(root = %root.key(), "url sync started");
        *self.inner.root.borrow_mut() = root.downgrade();
        self.inner.mapper.clear();

        let search = self.inner.location.search();
        self.inner.sync_from_url(root, root, &QueryParams::parse(&search), None);
        *self.inner.last_search.borrow_mut() = Some(search);

        if self.inner.options.update_url_on_init {
            let mut params = QueryParams::parse(&self.inner.location.search());
            for (key, value) in self.get_url_state(root) {
                params.set(&key, value.as_ref());
            }
            self.inner.write(params, false);
        }

        let weak: Weak<ManagerInner> = Rc::downgrade(&self.inner);
        let subscription = root.subscribe_to_event(move |event| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match event {
                SceneEvent::StateChanged(change) => inner.handle_state_change(&change.object),
                SceneEvent::Custom(custom)
                    if custom.kind == VALUE_CHANGED_EVENT || custom.kind == VARIABLE_SET_UPDATE_COMPLETED =>
                {
                    inner.flush_if_settled();
                }
                SceneEvent::Custom(_) => {}
            }
        });
        *self.inner.subscription.borrow_mut() = Some(subscription);
    }

    /// Stop listening.
    pub fn cleanup(&self) {
        if let Some(subscription) = self.inner.subscription.borrow_mut().take() {
            subscription.unsubscribe();
            debug!("url sync stopped");
        }
        *self.inner.root.borrow_mut() = WeakSceneObject::default();
    }

    /// Apply the location after an external navigation.
    pub fn handle_new_location(&self) {
        let Some(root) = self.inner.root.borrow().upgrade() else {
            return;
        };
        let search = self.inner.location.search();
        let previous = self.inner.last_search.borrow().clone();
        if previous.as_deref() == Some(search.as_str()) {
            trace!("location unchanged");
            return;
        }
        let previous_params = previous.as_deref().map(QueryParams::parse);
        self.inner
            .sync_from_url(&root, &root, &QueryParams::parse(&search), previous_params.as_ref());
        *self.inner.last_search.borrow_mut() = Some(search);
    }

    /// Apply the current location to an object added after `init_sync`,
    /// and to its descendants.
    pub fn handle_new_object(&self, object: &SceneObject) {
        let Some(root) = self.inner.root.borrow().upgrade() else {
            return;
        };
        let params = QueryParams::parse(&self.inner.location.search());
        self.inner.sync_from_url(&root, object, &params, None);
    }

    /// Run `f`, writing the location at most once afterwards.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.batch_depth.set(self.inner.batch_depth.get() + 1);
        let result = f();
        self.inner.batch_depth.set(self.inner.batch_depth.get() - 1);
        if self.inner.batch_depth.get() == 0 {
            let pending = self.inner.pending.borrow_mut().take();
            if let Some(pending) = pending {
                self.inner.flush(pending);
            }
        }
        result
    }

    /// URL state of every synced object under `root`, keyed by unique key.
    #[must_use]
    pub fn get_url_state(&self, root: &SceneObject) -> UrlState {
        let mut state = UrlState::new();
        root.walk(|node| {
            if let Some(cap) = node.capability::<UrlSyncCap>() {
                for (key, value) in cap.0.get_url_state(node) {
                    state.insert(self.inner.unique_key(&key, node, root), value);
                }
            }
            Walk::Continue
        });
        state
    }

    /// The key `object` uses for parameter `key`, namespace included.
    #[must_use]
    pub fn url_key_for(&self, object: &SceneObject, key: &str) -> Option<String> {
        let root = self.inner.root.borrow().upgrade()?;
        Some(self.inner.unique_key(key, object, &root))
    }
}

impl ManagerInner {
    fn unique_key(&self, key: &str, object: &SceneObject, root: &SceneObject) -> String {
        let unique = self.mapper.get_unique_key(key, object, root);
        match &self.options.namespace {
            Some(ns) if !self.options.exclude_from_namespace.iter().any(|k| k == key) => {
                format!("{ns}-{unique}")
            }
            _ => unique,
        }
    }

    fn sync_from_url(
        &self,
        root: &SceneObject,
        start: &SceneObject,
        params: &QueryParams,
        previous: Option<&QueryParams>,
    ) {
        let was_applying = self.applying.replace(true);
        start.walk(|node| {
            if let Some(cap) = node.capability::<UrlSyncCap>() {
                let mut values = UrlState::new();
                for key in cap.0.keys(node) {
                    let unique = self.unique_key(&key, node, root);
                    if let Some(value) = params.get(&unique) {
                        values.insert(key, Some(value));
                    } else if previous.is_some_and(|p| p.contains(&unique)) {
                        values.insert(key, None);
                    }
                }
                if !values.is_empty() {
                    trace!(object = %node.key(), keys = ?values.keys().collect::<Vec<_>>(), "applying url state");
                    cap.0.update_from_url(node, &values);
                }
            }
            Walk::Continue
        });
        self.applying.set(was_applying);
    }

    fn handle_state_change(&self, object: &SceneObject) {
        if self.applying.get() {
            return;
        }
        let Some(cap) = object.capability::<UrlSyncCap>() else {
            return;
        };
        let Some(root) = self.root.borrow().upgrade() else {
            return;
        };
        if !object.is_reachable_from(&root) {
            return;
        }

        let mut pending = self.pending.borrow_mut().take();
        let mut params = match &pending {
            Some(p) => p.params.clone(),
            None => QueryParams::parse(&self.location.search()),
        };
        let mut changed = false;
        for (key, value) in cap.0.get_url_state(object) {
            let unique = self.unique_key(&key, object, &root);
            if params.get(&unique) != value {
                params.set(&unique, value.as_ref());
                changed = true;
            }
        }
        if !changed {
            *self.pending.borrow_mut() = pending;
            return;
        }

        let push = self.options.create_browser_history_steps && cap.0.should_create_history_step(object);
        trace!(object = %object.key(), push, "url state changed");
        match pending.as_mut() {
            Some(p) => {
                p.params = params;
                p.push |= push;
            }
            None => pending = Some(PendingWrite { params, push }),
        }
        let held = self.batch_depth.get() > 0
            || SceneVariable::from_object(object).is_some()
            || Self::variables_busy(&root);
        if held {
            trace!(object = %object.key(), "url write deferred");
            *self.pending.borrow_mut() = pending;
        } else if let Some(p) = pending {
            self.flush(p);
        }
    }

    /// Write what a variable cascade left pending once it has settled.
    fn flush_if_settled(&self) {
        if self.batch_depth.get() > 0 || self.pending.borrow().is_none() {
            return;
        }
        let Some(root) = self.root.borrow().upgrade() else {
            return;
        };
        if Self::variables_busy(&root) {
            return;
        }
        let pending = self.pending.borrow_mut().take();
        if let Some(pending) = pending {
            self.flush(pending);
        }
    }

    fn variables_busy(root: &SceneObject) -> bool {
        !root.walk(|node| {
            if SceneVariableSet::from_object(node).is_some_and(|set| set.is_busy()) {
                Walk::Stop
            } else {
                Walk::Continue
            }
        })
    }

    fn flush(&self, pending: PendingWrite) {
        self.write(pending.params, pending.push);
    }

    fn write(&self, params: QueryParams, push: bool) {
        let search = params.to_query_string();
        if search == self.location.search() {
            return;
        }
        debug!(%search, push, "updating location");
        if push {
            self.location.push(&search);
        } else {
            self.location.replace(&search);
        }
        *self.last_search.borrow_mut() = Some(search);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::url_sync::{StateFieldSync, SyncedField};
    use scenes_core::{StatePatch, StateSnapshot};
    use serde_json::json;

    fn synced(root: &SceneObject, query: &str) -> SceneObject {
        let n = SceneObject::new("Panel", StateSnapshot::from_json(json!({ "query": query })));
        StateFieldSync::new()
            .field(SyncedField::string("query"))
            .attach_to(&n);
        root.add_child(&n).unwrap();
        n
    }

    fn setup(search: &str, options: UrlSyncOptions) -> (SceneObject, Rc<MemoryLocation>, UrlSyncManager) {
        let root = SceneObject::new("Root", StateSnapshot::new());
        let location = Rc::new(MemoryLocation::new(search));
        let manager = UrlSyncManager::new(location.clone(), options);
        (root, location, manager)
    }

    #[test]
    fn init_applies_url_in_pre_order() {
        let (root, _location, manager) = setup("query=a&query-2=b", UrlSyncOptions::default());
        let first = synced(&root, "");
        let second = synced(&root, "");
        manager.init_sync(&root);
        assert_eq!(first.state().get_str("query"), Some("a"));
        assert_eq!(second.state().get_str("query"), Some("b"));
    }

    #[test]
    fn state_change_replaces_location() {
        let (root, location, manager) = setup("other=1", UrlSyncOptions::default());
        let panel = synced(&root, "up");
        manager.init_sync(&root);
        panel.set_state(StatePatch::new().set("query", "rate"));
        assert_eq!(location.search(), "other=1&query=rate");
        assert_eq!(location.history().len(), 1);
        assert!(location.history()[0].replaced);

        panel.set_state(StatePatch::new().set("title", "x"));
        assert_eq!(location.history().len(), 1);
    }

    #[test]
    fn batch_coalesces_writes() {
        let (root, location, manager) = setup("", UrlSyncOptions::default());
        let a = synced(&root, "1");
        let b = synced(&root, "2");
        manager.init_sync(&root);
        manager.batch(|| {
            a.set_state(StatePatch::new().set("query", "x"));
            b.set_state(StatePatch::new().set("query", "y"));
        });
        assert_eq!(location.history().len(), 1);
        assert_eq!(location.search(), "query=x&query-2=y");
    }

    #[test]
    fn namespace_and_init_write() {
        let options = UrlSyncOptions::default()
            .with_update_url_on_init(true)
            .with_namespace("d1");
        let (root, location, manager) = setup("", options);
        synced(&root, "up");
        manager.init_sync(&root);
        assert_eq!(location.search(), "d1-query=up");
    }

    #[test]
    fn new_location_applies_and_clears_removed_keys() {
        let (root, location, manager) = setup("query=a", UrlSyncOptions::default());
        let panel = synced(&root, "");
        manager.init_sync(&root);
        location.navigate("query=b");
        manager.handle_new_location();
        assert_eq!(panel.state().get_str("query"), Some("b"));
        assert!(location.history().is_empty());

        location.navigate("");
        manager.handle_new_location();
        assert!(!panel.state().contains("query"));
    }

    #[test]
    fn history_steps_push() {
        let options = UrlSyncOptions::default().with_browser_history_steps(true);
        let (root, location, manager) = setup("", options);
        let n = SceneObject::new("Panel", StateSnapshot::from_json(json!({"tab": "a"})));
        StateFieldSync::new()
            .field(SyncedField::string("tab"))
            .with_history_steps(true)
            .attach_to(&n);
        root.add_child(&n).unwrap();
        manager.init_sync(&root);
        n.set_state(StatePatch::new().set("tab", "b"));
        assert!(!location.history()[0].replaced);
    }

    #[test]
    fn cleanup_stops_writes() {
        let (root, location, manager) = setup("", UrlSyncOptions::default());
        let panel = synced(&root, "up");
        manager.init_sync(&root);
        manager.cleanup();
        panel.set_state(StatePatch::new().set("query", "x"));
        assert!(location.history().is_empty());
    }
}
