#![forbid(unsafe_code)]

//! Activation lifecycle.
//!
//! A node is activated when it becomes part of the live scene and
//! deactivated when it leaves it. Activation establishes subscriptions;
//! deactivation releases them.
//!
//! # State machine
//!
//! ```text
//! Inactive --activate()--> Active --deactivate()--> Inactive
//!    ^                       |
//!    +-- handler error ------+   (rollback: release what already succeeded)
//! ```
//!
//! Activation runs in two phases:
//!
//! 1. Slot children (`$timeRange`, `$variables`, `$data`, in that order) that
//!    are not already active are activated, each contributing a cleanup that
//!    deactivates it again.
//! 2. Registered activation handlers run in registration order. A handler may
//!    return a cleanup closure, which joins the release list.
//!
//! # Invariants
//!
//! 1. `activate()` on an active node (or re-entrantly during its own
//!    activation) is a no-op.
//! 2. `deactivate()` on an inactive node is a no-op.
//! 3. After `deactivate()`, the release list and per-node subscription list
//!    are empty; every cleanup ran exactly once, in reverse registration
//!    order, before the subscriptions were dropped.
//! 4. Regular children are never activated or deactivated implicitly.
//!
//! # Failure Modes
//!
//! - **Handler returns `Err`**: remaining handlers are skipped, the cleanups
//!   collected so far run in reverse, subscriptions are dropped and the node
//!   ends inactive. The error is returned to the caller.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::{debug, trace, warn};

use crate::error::SceneResult;
use crate::event::Subscription;
use crate::object::{SceneObject, Slot};

/// Closure run on deactivation.
pub type Cleanup = Box<dyn FnOnce()>;

/// Activation handler; may return a cleanup to run on deactivation.
pub type ActivationHandler = dyn Fn(&SceneObject) -> SceneResult<Option<Cleanup>>;

#[derive(Default)]
pub(crate) struct Lifecycle {
    active: Cell<bool>,
    activating: Cell<bool>,
    activation_count: Cell<u64>,
    handlers: RefCell<Vec<Rc<ActivationHandler>>>,
    release: RefCell<Vec<Cleanup>>,
    subscriptions: RefCell<Vec<Subscription>>,
}

impl SceneObject {
    /// Register an activation handler.
    ///
    /// Handlers run on every activation, in registration order.
    pub fn add_activation_handler(
        &self,
        handler: impl Fn(&SceneObject) -> SceneResult<Option<Cleanup>> + 'static,
    ) {
        self.inner
            .lifecycle
            .handlers
            .borrow_mut()
            .push(Rc::new(handler));
    }

    /// Whether the node is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.lifecycle.active.get()
    }

    /// How many times the node has been activated.
    #[must_use]
    pub fn activation_count(&self) -> u64 {
        self.inner.lifecycle.activation_count.get()
    }

    /// Subscriptions owned by the current activation.
    #[must_use]
    pub fn live_subscription_count(&self) -> usize {
        self.inner.lifecycle.subscriptions.borrow().len()
    }

    /// Cleanups waiting for deactivation.
    #[must_use]
    pub fn pending_cleanup_count(&self) -> usize {
        self.inner.lifecycle.release.borrow().len()
    }

    /// Hand a subscription to the node; it is released on deactivation.
    pub fn add_subscription(&self, subscription: Subscription) {
        self.inner
            .lifecycle
            .subscriptions
            .borrow_mut()
            .push(subscription);
    }

    /// Queue a cleanup for the next deactivation.
    pub fn add_cleanup(&self, cleanup: Cleanup) {
        self.inner.lifecycle.release.borrow_mut().push(cleanup);
    }

    /// Transition to active, running slot activation and handlers.
    pub fn activate(&self) -> SceneResult<()> {
        let lc = &self.inner.lifecycle;
        if lc.active.get() || lc.activating.get() {
            trace!(key = %self.key(), "activate ignored: already active");
            return Ok(());
        }
        lc.activating.set(true);
        lc.active.set(true);
        lc.activation_count.set(lc.activation_count.get() + 1);
        debug!(key = %self.key(), kind = self.kind(), "activating");

        let result = self.run_activation();
        lc.activating.set(false);
        if let Err(err) = &result {
            warn!(key = %self.key(), error = %err, "activation failed, rolling back");
            self.release_all();
        }
        result
    }

    fn run_activation(&self) -> SceneResult<()> {
        for slot in Slot::ACTIVATION_ORDER {
            let Some(child) = self.slot(slot) else {
                continue;
            };
            if child.is_active() {
                continue;
            }
            child.activate()?;
            self.add_cleanup(Box::new(move || child.deactivate()));
        }

        let handlers: Vec<Rc<ActivationHandler>> =
            self.inner.lifecycle.handlers.borrow().clone();
        for handler in handlers {
            if let Some(cleanup) = handler(self)? {
                self.add_cleanup(cleanup);
            }
        }
        Ok(())
    }

    /// Transition to inactive, releasing everything the activation acquired.
    pub fn deactivate(&self) {
        if !self.inner.lifecycle.active.get() {
            return;
        }
        debug!(key = %self.key(), kind = self.kind(), "deactivating");
        self.release_all();
    }

    fn release_all(&self) {
        let lc = &self.inner.lifecycle;
        loop {
            let cleanups = std::mem::take(&mut *lc.release.borrow_mut());
            if cleanups.is_empty() {
                break;
            }
            for cleanup in cleanups.into_iter().rev() {
                cleanup();
            }
        }
        let subscriptions = std::mem::take(&mut *lc.subscriptions.borrow_mut());
        for sub in subscriptions {
            sub.unsubscribe();
        }
        lc.active.set(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SceneError;
    use crate::state::StateSnapshot;

    fn node(key: &str) -> SceneObject {
        SceneObject::new_with_key(key, "TestObject", StateSnapshot::new())
    }

    fn recorder() -> Rc<RefCell<Vec<String>>> {
        Rc::new(RefCell::new(Vec::new()))
    }

    #[test]
    fn handlers_run_in_order_and_cleanups_in_reverse() {
        let obj = node("n");
        let log = recorder();
        for name in ["a", "b"] {
            let log = Rc::clone(&log);
            obj.add_activation_handler(move |_| {
                log.borrow_mut().push(format!("on {name}"));
                let log = Rc::clone(&log);
                Ok(Some(Box::new(move || log.borrow_mut().push(format!("off {name}")))))
            });
        }
        obj.activate().unwrap();
        assert!(obj.is_active());
        obj.deactivate();
        assert!(!obj.is_active());
        assert_eq!(*log.borrow(), vec!["on a", "on b", "off b", "off a"]);
    }

    #[test]
    fn reactivation_is_a_noop() {
        let obj = node("n");
        let log = recorder();
        let l = Rc::clone(&log);
        obj.add_activation_handler(move |_| {
            l.borrow_mut().push("on".into());
            Ok(None)
        });
        obj.activate().unwrap();
        obj.activate().unwrap();
        assert_eq!(log.borrow().len(), 1);
        assert_eq!(obj.activation_count(), 1);
    }

    #[test]
    fn deactivate_is_idempotent() {
        let obj = node("n");
        obj.deactivate();
        obj.activate().unwrap();
        obj.deactivate();
        obj.deactivate();
        assert_eq!(obj.live_subscription_count(), 0);
    }

    #[test]
    fn subscriptions_released_on_deactivate() {
        let obj = node("n");
        let other = node("other");
        obj.add_activation_handler(move |me| {
            me.add_subscription(other.subscribe_to_state(|_| {}));
            Ok(None)
        });
        obj.activate().unwrap();
        assert_eq!(obj.live_subscription_count(), 1);
        obj.deactivate();
        assert_eq!(obj.live_subscription_count(), 0);
    }

    #[test]
    fn failing_handler_rolls_back() {
        let obj = node("n");
        let log = recorder();
        let l = Rc::clone(&log);
        obj.add_activation_handler(move |_| {
            let l = Rc::clone(&l);
            Ok(Some(Box::new(move || l.borrow_mut().push("cleanup first".into()))))
        });
        obj.add_activation_handler(|me| Err(SceneError::activation(me.key(), "boom")));
        let l = Rc::clone(&log);
        obj.add_activation_handler(move |_| {
            l.borrow_mut().push("never".into());
            Ok(None)
        });

        let err = obj.activate().unwrap_err();
        assert!(matches!(err, SceneError::Activation { .. }));
        assert!(!obj.is_active());
        assert_eq!(*log.borrow(), vec!["cleanup first"]);
        assert_eq!(obj.pending_cleanup_count(), 0);
    }

    #[test]
    fn slots_activate_before_handlers_in_order() {
        let owner = node("owner");
        let log = recorder();
        for (slot, name) in [
            (Slot::Data, "data"),
            (Slot::TimeRange, "time"),
            (Slot::Variables, "vars"),
        ] {
            let child = node(name);
            let l = Rc::clone(&log);
            child.add_activation_handler(move |me| {
                l.borrow_mut().push(me.key().to_owned());
                Ok(None)
            });
            owner.set_slot(slot, Some(&child)).unwrap();
        }
        let l = Rc::clone(&log);
        owner.add_activation_handler(move |_| {
            l.borrow_mut().push("owner".into());
            Ok(None)
        });

        owner.activate().unwrap();
        assert_eq!(*log.borrow(), vec!["time", "vars", "data", "owner"]);
        let data = owner.slot(Slot::Data).unwrap();
        assert!(data.is_active());
        owner.deactivate();
        assert!(!data.is_active());
    }

    #[test]
    fn children_are_not_deactivated_implicitly() {
        let parent = node("p");
        let child = node("c");
        parent.add_child(&child).unwrap();
        parent.activate().unwrap();
        child.activate().unwrap();
        parent.deactivate();
        assert!(child.is_active());
    }

    #[test]
    fn already_active_slot_is_left_alone() {
        let owner = node("owner");
        let data = node("data");
        owner.set_slot(Slot::Data, Some(&data)).unwrap();
        data.activate().unwrap();
        owner.activate().unwrap();
        owner.deactivate();
        assert!(data.is_active());
    }
}
