#![forbid(unsafe_code)]

//! Event bus and subscription handles.
//!
//! Every scene object owns an event bus. State changes are published to the
//! changed object's bus and then to each ancestor's bus in turn, so the root
//! observes every mutation in the tree without per-node registration.
//!
//! # Invariants
//!
//! 1. Listeners are invoked in registration order.
//! 2. A listener removed during a publish pass is not invoked later in that
//!    pass; a listener added during a pass is first invoked on the next one.
//! 3. A [`Subscription`] runs its teardown at most once, either through
//!    [`Subscription::unsubscribe`] or on drop.

use std::borrow::Cow;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use serde_json::Value;

use crate::object::SceneObject;
use crate::state::StateSnapshot;

/// Handle to a live registration.
///
/// Dropping the handle releases the registration; `unsubscribe` does the
/// same explicitly. Use [`Subscription::detach`] to keep a registration alive
/// for the lifetime of the source.
#[must_use = "dropping a Subscription immediately unsubscribes"]
pub struct Subscription {
    teardown: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    /// Wrap a teardown closure.
    pub fn new(teardown: impl FnOnce() + 'static) -> Self {
        Self {
            teardown: Some(Box::new(teardown)),
        }
    }

    /// A subscription with nothing to release.
    pub fn empty() -> Self {
        Self { teardown: None }
    }

    /// Combine several subscriptions into one handle.
    ///
    /// Members are released in order.
    pub fn all(subscriptions: Vec<Subscription>) -> Self {
        Self::new(move || {
            for sub in subscriptions {
                sub.unsubscribe();
            }
        })
    }

    /// Release the registration now.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    /// Whether the teardown already ran (or there never was one).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.teardown.is_none()
    }

    /// Forget the handle without releasing the registration.
    pub fn detach(mut self) {
        self.teardown = None;
    }

    fn release(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("closed", &self.is_closed())
            .finish()
    }
}

type Callback<E> = Rc<dyn Fn(&E)>;

struct ListenerInner<E: ?Sized> {
    next_id: Cell<u64>,
    entries: RefCell<Vec<(u64, Callback<E>)>>,
}

/// Ordered list of callbacks shared between a source and its subscriptions.
pub(crate) struct ListenerList<E: 'static> {
    inner: Rc<ListenerInner<E>>,
}

impl<E: 'static> Clone for ListenerList<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<E: 'static> Default for ListenerList<E> {
    fn default() -> Self {
        Self {
            inner: Rc::new(ListenerInner {
                next_id: Cell::new(1),
                entries: RefCell::new(Vec::new()),
            }),
        }
    }
}

impl<E: 'static> ListenerList<E> {
    pub(crate) fn add(&self, callback: impl Fn(&E) + 'static) -> Subscription {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        let callback: Callback<E> = Rc::new(callback);
        self.inner.entries.borrow_mut().push((id, callback));

        let weak = Rc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.entries.borrow_mut().retain(|(entry, _)| *entry != id);
            }
        })
    }

    pub(crate) fn emit(&self, event: &E) {
        let snapshot: Vec<(u64, Callback<E>)> = self.inner.entries.borrow().clone();
        for (id, callback) in snapshot {
            let still_registered = self
                .inner
                .entries
                .borrow()
                .iter()
                .any(|(entry, _)| *entry == id);
            if still_registered {
                callback(event);
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.entries.borrow().len()
    }
}

/// Published after every `set_state`.
#[derive(Clone)]
pub struct StateChangedEvent {
    /// The object whose state changed.
    pub object: SceneObject,
    /// Snapshot before the change.
    pub prev_state: Rc<StateSnapshot>,
    /// Snapshot after the change.
    pub new_state: Rc<StateSnapshot>,
}

impl StateChangedEvent {
    /// Whether `field` changed identity in this update.
    #[must_use]
    pub fn field_changed(&self, field: &str) -> bool {
        !self.prev_state.same_field(&self.new_state, field)
    }
}

impl fmt::Debug for StateChangedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateChangedEvent")
            .field("object", &self.object.key())
            .field("new_state", &self.new_state)
            .finish()
    }
}

/// An application-defined event.
#[derive(Clone)]
pub struct CustomEvent {
    /// Event discriminator.
    pub kind: Cow<'static, str>,
    /// Free-form payload.
    pub payload: Value,
    /// The object that published the event.
    pub origin: SceneObject,
}

impl fmt::Debug for CustomEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomEvent")
            .field("kind", &self.kind)
            .field("payload", &self.payload)
            .field("origin", &self.origin.key())
            .finish()
    }
}

/// Anything that travels over a scene object's event bus.
#[derive(Clone, Debug)]
pub enum SceneEvent {
    /// A state change, bubbled from the changed object to the root.
    StateChanged(StateChangedEvent),
    /// An application event.
    Custom(CustomEvent),
}

impl SceneEvent {
    /// The object that caused the event.
    #[must_use]
    pub fn origin(&self) -> &SceneObject {
        match self {
            Self::StateChanged(e) => &e.object,
            Self::Custom(e) => &e.origin,
        }
    }

    /// Custom event kind, if this is a custom event.
    #[must_use]
    pub fn custom_kind(&self) -> Option<&str> {
        match self {
            Self::Custom(e) => Some(e.kind.as_ref()),
            Self::StateChanged(_) => None,
        }
    }
}
