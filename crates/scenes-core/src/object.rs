#![forbid(unsafe_code)]

//! Scene objects: the nodes of the scene graph.
//!
//! A [`SceneObject`] is a cheap, clonable handle to shared node storage. The
//! parent owns its children through strong handles; the child points back at
//! its parent through a `Weak`, so back-references never keep a subtree
//! alive. Upward walks (state-change bubbling, variable lookup, capability
//! resolution) are iterative loops over the parent chain.
//!
//! # Slots
//!
//! Three well-known children live in named slots: `$timeRange`,
//! `$variables` and `$data`. They are ordinary children tagged with a
//! [`Slot`]; lookups that need "the nearest time range" or "the nearest data
//! provider" check the slot on each ancestor.
//!
//! # Capabilities
//!
//! Behaviour is attached to a node as typed capabilities
//! ([`SceneObject::attach`]). Each capability is stored once per concrete
//! type and retrieved with a type-safe downcast, so "is this node a data
//! provider" is a map lookup, not a structural check.
//!
//! # Invariants
//!
//! 1. `child.parent() == Some(p)` iff `p.all_children()` contains `child`.
//! 2. A node is never its own ancestor.
//! 3. Every `set_state` installs a fresh snapshot and publishes exactly one
//!    `StateChanged` event to the node and each of its ancestors, nearest
//!    first.

use std::any::{Any, TypeId};
use std::borrow::Cow;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tracing::trace;

use crate::error::{SceneError, SceneResult};
use crate::event::{CustomEvent, ListenerList, SceneEvent, StateChangedEvent, Subscription};
use crate::lifecycle::Lifecycle;
use crate::state::{StatePatch, StateSnapshot};

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// Named child positions with tree-wide lookup semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// `$timeRange`: the time range in effect for this subtree.
    TimeRange,
    /// `$variables`: the variable set scoped to this subtree.
    Variables,
    /// `$data`: the data provider feeding this subtree.
    Data,
}

impl Slot {
    /// Order in which slot children are activated with their owner.
    pub const ACTIVATION_ORDER: [Slot; 3] = [Slot::TimeRange, Slot::Variables, Slot::Data];

    /// The state-path name of the slot.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::TimeRange => "$timeRange",
            Self::Variables => "$variables",
            Self::Data => "$data",
        }
    }
}

/// Result of a visitor callback during a tree walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Walk {
    /// Descend into this node's children.
    Continue,
    /// Do not visit this node's children; keep walking siblings.
    SkipChildren,
    /// Abort the walk.
    Stop,
}

struct ChildEntry {
    slot: Option<Slot>,
    object: SceneObject,
}

pub(crate) struct ObjectInner {
    key: String,
    kind: &'static str,
    state: RefCell<Rc<StateSnapshot>>,
    parent: RefCell<Weak<ObjectInner>>,
    children: RefCell<Vec<ChildEntry>>,
    capabilities: RefCell<Vec<(TypeId, Rc<dyn Any>)>>,
    events: ListenerList<SceneEvent>,
    pub(crate) lifecycle: Lifecycle,
}

/// Shared handle to a scene graph node.
///
/// Cloning produces another handle to the same node. Equality is identity.
#[derive(Clone)]
pub struct SceneObject {
    pub(crate) inner: Rc<ObjectInner>,
}

impl SceneObject {
    /// Create a detached node with a generated key.
    #[must_use]
    pub fn new(kind: &'static str, state: StateSnapshot) -> Self {
        let n = NEXT_KEY.fetch_add(1, Ordering::Relaxed);
        Self::new_with_key(format!("scene-object-{n}"), kind, state)
    }

    /// Create a detached node with an explicit key.
    #[must_use]
    pub fn new_with_key(key: impl Into<String>, kind: &'static str, state: StateSnapshot) -> Self {
        Self {
            inner: Rc::new(ObjectInner {
                key: key.into(),
                kind,
                state: RefCell::new(Rc::new(state)),
                parent: RefCell::new(Weak::new()),
                children: RefCell::new(Vec::new()),
                capabilities: RefCell::new(Vec::new()),
                events: ListenerList::default(),
                lifecycle: Lifecycle::default(),
            }),
        }
    }

    /// Stable node key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Runtime type name, used for diagnostics and renderer lookup.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.inner.kind
    }

    /// Current state snapshot.
    #[must_use]
    pub fn state(&self) -> Rc<StateSnapshot> {
        Rc::clone(&self.inner.state.borrow())
    }

    /// Merge `patch` into the current state and publish the change.
    pub fn set_state(&self, patch: StatePatch) {
        let prev = self.state();
        let next = Rc::new(prev.merged(patch));
        *self.inner.state.borrow_mut() = Rc::clone(&next);

        trace!(key = %self.key(), kind = self.kind(), "state changed");
        let event = SceneEvent::StateChanged(StateChangedEvent {
            object: self.clone(),
            prev_state: prev,
            new_state: next,
        });
        self.publish_event(&event, true);
    }

    /// Replace the state identity without changing any field.
    ///
    /// Subscribers re-render exactly as they would after a real change.
    pub fn force_render(&self) {
        self.set_state(StatePatch::new());
    }

    // -- Events ---------------------------------------------------------------

    /// Listen to every event reaching this node, including bubbled ones.
    pub fn subscribe_to_event(&self, callback: impl Fn(&SceneEvent) + 'static) -> Subscription {
        self.inner.events.add(callback)
    }

    /// Listen to this node's own state changes.
    pub fn subscribe_to_state(
        &self,
        callback: impl Fn(&StateChangedEvent) + 'static,
    ) -> Subscription {
        let me = Rc::downgrade(&self.inner);
        self.inner.events.add(move |event| {
            if let SceneEvent::StateChanged(change) = event {
                if std::ptr::eq(Rc::as_ptr(&change.object.inner), me.as_ptr()) {
                    callback(change);
                }
            }
        })
    }

    /// Publish `event` on this node, then on each ancestor if `bubble`.
    pub fn publish_event(&self, event: &SceneEvent, bubble: bool) {
        self.inner.events.emit(event);
        if !bubble {
            return;
        }
        let mut current = self.parent();
        while let Some(node) = current {
            node.inner.events.emit(event);
            current = node.parent();
        }
    }

    /// Publish an application event originating from this node.
    pub fn publish_custom(&self, kind: impl Into<String>, payload: Value, bubble: bool) {
        let event = SceneEvent::Custom(CustomEvent {
            kind: Cow::Owned(kind.into()),
            payload,
            origin: self.clone(),
        });
        self.publish_event(&event, bubble);
    }

    /// Number of listeners registered on this node's bus.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.events.len()
    }

    // -- Tree -----------------------------------------------------------------

    /// The parent, if attached.
    #[must_use]
    pub fn parent(&self) -> Option<SceneObject> {
        self.inner
            .parent
            .borrow()
            .upgrade()
            .map(|inner| SceneObject { inner })
    }

    /// Non-slot children in insertion order.
    #[must_use]
    pub fn children(&self) -> Vec<SceneObject> {
        self.inner
            .children
            .borrow()
            .iter()
            .filter(|entry| entry.slot.is_none())
            .map(|entry| entry.object.clone())
            .collect()
    }

    /// Every child, slot children included, in insertion order.
    #[must_use]
    pub fn all_children(&self) -> Vec<SceneObject> {
        self.inner
            .children
            .borrow()
            .iter()
            .map(|entry| entry.object.clone())
            .collect()
    }

    /// The child stored in `slot`.
    #[must_use]
    pub fn slot(&self, slot: Slot) -> Option<SceneObject> {
        self.inner
            .children
            .borrow()
            .iter()
            .find(|entry| entry.slot == Some(slot))
            .map(|entry| entry.object.clone())
    }

    /// The slot `self` occupies in its parent, if any.
    #[must_use]
    pub fn slot_in_parent(&self) -> Option<Slot> {
        let parent = self.parent()?;
        let children = parent.inner.children.borrow();
        children
            .iter()
            .find(|entry| entry.object.ptr_eq(self))
            .and_then(|entry| entry.slot)
    }

    /// Attach `child` as a regular child.
    pub fn add_child(&self, child: &SceneObject) -> SceneResult<()> {
        self.attach_child(child, None)
    }

    /// Place `child` in `slot`, detaching and returning the previous occupant.
    pub fn set_slot(
        &self,
        slot: Slot,
        child: Option<&SceneObject>,
    ) -> SceneResult<Option<SceneObject>> {
        if let Some(child) = child {
            self.check_attachable(child)?;
        }
        let previous = self.slot(slot);
        if let Some(prev) = &previous {
            self.remove_child(prev)?;
        }
        if let Some(child) = child {
            self.attach_child(child, Some(slot))?;
        }
        Ok(previous)
    }

    /// Detach `child` from this node.
    pub fn remove_child(&self, child: &SceneObject) -> SceneResult<()> {
        let mut children = self.inner.children.borrow_mut();
        let Some(index) = children.iter().position(|e| e.object.ptr_eq(child)) else {
            return Err(SceneError::NotAChild {
                child: child.key().to_owned(),
                parent: self.key().to_owned(),
            });
        };
        children.remove(index);
        drop(children);
        *child.inner.parent.borrow_mut() = Weak::new();
        trace!(parent = %self.key(), child = %child.key(), "child removed");
        Ok(())
    }

    /// Remove this node from its parent, if it has one.
    pub fn detach(&self) {
        if let Some(parent) = self.parent() {
            // The parent link and the child list agree, so removal cannot fail.
            let _ = parent.remove_child(self);
        }
    }

    fn check_attachable(&self, child: &SceneObject) -> SceneResult<()> {
        if let Some(parent) = child.parent() {
            return Err(SceneError::AlreadyParented {
                child: child.key().to_owned(),
                parent: parent.key().to_owned(),
            });
        }
        if child.ptr_eq(self) || self.ancestors().iter().any(|a| a.ptr_eq(child)) {
            return Err(SceneError::WouldCycle {
                child: child.key().to_owned(),
            });
        }
        Ok(())
    }

    fn attach_child(&self, child: &SceneObject, slot: Option<Slot>) -> SceneResult<()> {
        self.check_attachable(child)?;
        *child.inner.parent.borrow_mut() = Rc::downgrade(&self.inner);
        self.inner.children.borrow_mut().push(ChildEntry {
            slot,
            object: child.clone(),
        });
        trace!(parent = %self.key(), child = %child.key(), slot = ?slot, "child attached");
        Ok(())
    }

    /// The topmost ancestor (or `self` when detached).
    #[must_use]
    pub fn root(&self) -> SceneObject {
        let mut current = self.clone();
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    /// Ancestors, nearest first.
    #[must_use]
    pub fn ancestors(&self) -> Vec<SceneObject> {
        let mut out = Vec::new();
        let mut current = self.parent();
        while let Some(node) = current {
            current = node.parent();
            out.push(node);
        }
        out
    }

    /// Depth-first pre-order walk starting at `self`.
    ///
    /// Returns `false` if the visitor stopped the walk.
    pub fn walk(&self, mut visit: impl FnMut(&SceneObject) -> Walk) -> bool {
        let mut stack = vec![self.clone()];
        while let Some(node) = stack.pop() {
            match visit(&node) {
                Walk::Stop => return false,
                Walk::SkipChildren => {}
                Walk::Continue => {
                    let children = node.inner.children.borrow();
                    stack.extend(children.iter().rev().map(|e| e.object.clone()));
                }
            }
        }
        true
    }

    /// Visit every descendant (not `self`) in pre-order.
    pub fn for_each_descendant(&self, mut visit: impl FnMut(&SceneObject)) {
        self.walk(|node| {
            if !node.ptr_eq(self) {
                visit(node);
            }
            Walk::Continue
        });
    }

    /// First node in pre-order (starting at `self`) matching `predicate`.
    #[must_use]
    pub fn find(&self, mut predicate: impl FnMut(&SceneObject) -> bool) -> Option<SceneObject> {
        let mut found = None;
        self.walk(|node| {
            if predicate(node) {
                found = Some(node.clone());
                Walk::Stop
            } else {
                Walk::Continue
            }
        });
        found
    }

    /// Whether `root` is `self` or one of its ancestors.
    #[must_use]
    pub fn is_reachable_from(&self, root: &SceneObject) -> bool {
        if self.ptr_eq(root) {
            return true;
        }
        let mut current = self.parent();
        while let Some(node) = current {
            if node.ptr_eq(root) {
                return true;
            }
            current = node.parent();
        }
        false
    }

    // -- Capabilities ---------------------------------------------------------

    /// Attach a capability, replacing any previous one of the same type.
    pub fn attach<T: Any>(&self, capability: Rc<T>) {
        let id = TypeId::of::<T>();
        let mut caps = self.inner.capabilities.borrow_mut();
        let erased: Rc<dyn Any> = capability;
        if let Some(slot) = caps.iter_mut().find(|(t, _)| *t == id) {
            slot.1 = erased;
        } else {
            caps.push((id, erased));
        }
    }

    /// The capability of type `T`, if attached.
    #[must_use]
    pub fn capability<T: Any>(&self) -> Option<Rc<T>> {
        let id = TypeId::of::<T>();
        let caps = self.inner.capabilities.borrow();
        caps.iter()
            .find(|(t, _)| *t == id)
            .and_then(|(_, cap)| Rc::clone(cap).downcast::<T>().ok())
    }

    /// Whether a capability of type `T` is attached.
    #[must_use]
    pub fn has_capability<T: Any>(&self) -> bool {
        let id = TypeId::of::<T>();
        self.inner.capabilities.borrow().iter().any(|(t, _)| *t == id)
    }

    /// Nearest node (starting at `self`) carrying capability `T`.
    #[must_use]
    pub fn closest<T: Any>(&self) -> Option<(SceneObject, Rc<T>)> {
        let mut current = Some(self.clone());
        while let Some(node) = current {
            if let Some(cap) = node.capability::<T>() {
                return Some((node, cap));
            }
            current = node.parent();
        }
        None
    }

    // -- Identity -------------------------------------------------------------

    /// Identity comparison.
    #[must_use]
    pub fn ptr_eq(&self, other: &SceneObject) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// A non-owning handle.
    #[must_use]
    pub fn downgrade(&self) -> WeakSceneObject {
        WeakSceneObject {
            inner: Rc::downgrade(&self.inner),
        }
    }
}

impl PartialEq for SceneObject {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for SceneObject {}

impl fmt::Debug for SceneObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SceneObject")
            .field("key", &self.key())
            .field("kind", &self.kind())
            .field("active", &self.is_active())
            .finish()
    }
}

/// Non-owning handle to a scene object.
#[derive(Clone, Default)]
pub struct WeakSceneObject {
    inner: Weak<ObjectInner>,
}

impl WeakSceneObject {
    /// Upgrade to a strong handle if the node is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<SceneObject> {
        self.inner.upgrade().map(|inner| SceneObject { inner })
    }

    /// Whether this handle refers to `object`.
    #[must_use]
    pub fn is(&self, object: &SceneObject) -> bool {
        std::ptr::eq(self.inner.as_ptr(), Rc::as_ptr(&object.inner))
    }

    /// Identity comparison between weak handles.
    #[must_use]
    pub fn ptr_eq(&self, other: &WeakSceneObject) -> bool {
        Weak::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for WeakSceneObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(object) => write!(f, "WeakSceneObject({})", object.key()),
            None => f.write_str("WeakSceneObject(<dropped>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::{Cell, RefCell};

    fn node(key: &str) -> SceneObject {
        SceneObject::new_with_key(key, "TestObject", StateSnapshot::new())
    }

    #[test]
    fn set_state_bubbles_to_root_nearest_first() {
        let root = node("root");
        let mid = node("mid");
        let leaf = node("leaf");
        root.add_child(&mid).unwrap();
        mid.add_child(&leaf).unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let s1 = Rc::clone(&seen);
        let _a = root.subscribe_to_event(move |e| s1.borrow_mut().push(("root", e.origin().key().to_owned())));
        let s2 = Rc::clone(&seen);
        let _b = mid.subscribe_to_event(move |e| s2.borrow_mut().push(("mid", e.origin().key().to_owned())));

        leaf.set_state(StatePatch::new().set("title", "x"));
        assert_eq!(
            *seen.borrow(),
            vec![("mid", "leaf".to_owned()), ("root", "leaf".to_owned())]
        );
    }

    #[test]
    fn subscribe_to_state_ignores_descendants() {
        let root = node("root");
        let leaf = node("leaf");
        root.add_child(&leaf).unwrap();

        let count = Rc::new(Cell::new(0));
        let c = Rc::clone(&count);
        let _sub = root.subscribe_to_state(move |_| c.set(c.get() + 1));
        leaf.set_state(StatePatch::new().set("a", 1));
        assert_eq!(count.get(), 0);
        root.set_state(StatePatch::new().set("a", 1));
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn previous_snapshot_is_untouched() {
        let obj = SceneObject::new("TestObject", StateSnapshot::from_json(json!({"a": 1})));
        let before = obj.state();
        obj.set_state(StatePatch::new().set("a", 2));
        assert_eq!(before.get_i64("a"), Some(1));
        assert_eq!(obj.state().get_i64("a"), Some(2));
        assert!(!Rc::ptr_eq(&before, &obj.state()));
    }

    #[test]
    fn force_render_changes_identity_only() {
        let obj = node("x");
        let before = obj.state();
        obj.force_render();
        assert!(!Rc::ptr_eq(&before, &obj.state()));
        assert_eq!(*before, *obj.state());
    }

    #[test]
    fn parent_links_are_consistent() {
        let root = node("root");
        let child = node("child");
        root.add_child(&child).unwrap();
        assert_eq!(child.parent(), Some(root.clone()));
        assert_eq!(root.children(), vec![child.clone()]);

        root.remove_child(&child).unwrap();
        assert!(child.parent().is_none());
        assert!(root.children().is_empty());
        assert!(matches!(
            root.remove_child(&child),
            Err(SceneError::NotAChild { .. })
        ));
    }

    #[test]
    fn rejects_double_parent_and_cycles() {
        let a = node("a");
        let b = node("b");
        let c = node("c");
        a.add_child(&b).unwrap();
        assert!(matches!(
            c.add_child(&b),
            Err(SceneError::AlreadyParented { .. })
        ));
        assert!(matches!(b.add_child(&a), Err(SceneError::WouldCycle { .. })));
        assert!(matches!(a.add_child(&a), Err(SceneError::WouldCycle { .. })));
    }

    #[test]
    fn parent_does_not_outlive_drop() {
        let child = node("child");
        {
            let root = node("root");
            root.add_child(&child).unwrap();
        }
        assert!(child.parent().is_none());
    }

    #[test]
    fn slots_replace_previous_occupant() {
        let root = node("root");
        let first = node("vars-1");
        let second = node("vars-2");
        root.set_slot(Slot::Variables, Some(&first)).unwrap();
        let prev = root.set_slot(Slot::Variables, Some(&second)).unwrap();
        assert_eq!(prev, Some(first.clone()));
        assert!(first.parent().is_none());
        assert_eq!(root.slot(Slot::Variables), Some(second.clone()));
        assert_eq!(second.slot_in_parent(), Some(Slot::Variables));
        assert!(root.children().is_empty());
        assert_eq!(root.all_children().len(), 1);
    }

    #[test]
    fn walk_is_pre_order_and_can_skip() {
        let root = node("root");
        let a = node("a");
        let a1 = node("a1");
        let b = node("b");
        root.add_child(&a).unwrap();
        a.add_child(&a1).unwrap();
        root.add_child(&b).unwrap();

        let mut order = Vec::new();
        root.walk(|n| {
            order.push(n.key().to_owned());
            Walk::Continue
        });
        assert_eq!(order, vec!["root", "a", "a1", "b"]);

        let mut skipped = Vec::new();
        root.walk(|n| {
            skipped.push(n.key().to_owned());
            if n.key() == "a" { Walk::SkipChildren } else { Walk::Continue }
        });
        assert_eq!(skipped, vec!["root", "a", "b"]);

        assert_eq!(root.find(|n| n.key() == "a1"), Some(a1.clone()));
        assert!(a1.is_reachable_from(&root));
        assert!(!root.is_reachable_from(&a1));
        assert_eq!(a1.root(), root);
    }

    #[test]
    fn capabilities_resolve_by_type() {
        struct Marker(u32);
        let root = node("root");
        let leaf = node("leaf");
        root.add_child(&leaf).unwrap();
        root.attach(Rc::new(Marker(7)));

        assert!(leaf.capability::<Marker>().is_none());
        let (owner, cap) = leaf.closest::<Marker>().unwrap();
        assert_eq!(owner, root);
        assert_eq!(cap.0, 7);

        root.attach(Rc::new(Marker(8)));
        assert_eq!(root.capability::<Marker>().unwrap().0, 8);
        assert!(root.has_capability::<Marker>());
    }

    #[test]
    fn weak_handles() {
        let obj = node("w");
        let weak = obj.downgrade();
        assert!(weak.is(&obj));
        drop(obj);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn custom_events_can_stay_local() {
        let root = node("root");
        let leaf = node("leaf");
        root.add_child(&leaf).unwrap();
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        let _sub = root.subscribe_to_event(move |e| {
            if e.custom_kind() == Some("ping") {
                h.set(h.get() + 1);
            }
        });
        leaf.publish_custom("ping", json!(null), false);
        assert_eq!(hits.get(), 0);
        leaf.publish_custom("ping", json!(null), true);
        assert_eq!(hits.get(), 1);
    }
}
