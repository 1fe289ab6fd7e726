#![forbid(unsafe_code)]

//! Push-based streams for a single-threaded event loop.
//!
//! Two primitives cover every asynchronous edge in the scene graph:
//!
//! - [`Subject<T>`]: a multicast stream. Each `next` is delivered to every
//!   live subscriber in registration order. A replaying subject hands the
//!   most recent value to new subscribers immediately.
//! - [`Deferred<T>`]: a value that becomes available exactly once, possibly
//!   later. Producers resolve it through a [`Resolver`]; consumers chain with
//!   [`Deferred::map`], [`Deferred::and_then`] and [`join`].
//!
//! Both hand out [`Subscription`] handles. Dropping the handle detaches the
//! consumer, which is how "last request wins" is implemented: the caller
//! drops the previous handle before subscribing to a new request.
//!
//! # Invariants
//!
//! 1. A `Deferred` resolves at most once; later `resolve` calls are ignored.
//! 2. A consumer subscribed to a resolved `Deferred` is called synchronously.
//! 3. A consumer whose handle was dropped is never called.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::event::{ListenerList, Subscription};

/// Multicast stream with optional replay of the latest value.
pub struct Subject<T: 'static> {
    listeners: ListenerList<T>,
    last: Rc<RefCell<Option<T>>>,
    replay: bool,
}

impl<T: 'static> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Self {
            listeners: self.listeners.clone(),
            last: Rc::clone(&self.last),
            replay: self.replay,
        }
    }
}

impl<T: Clone + 'static> Default for Subject<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + 'static> Subject<T> {
    /// A subject that does not replay.
    #[must_use]
    pub fn new() -> Self {
        Self {
            listeners: ListenerList::default(),
            last: Rc::new(RefCell::new(None)),
            replay: false,
        }
    }

    /// A subject that replays its latest value to new subscribers.
    #[must_use]
    pub fn replaying() -> Self {
        Self {
            replay: true,
            ..Self::new()
        }
    }

    /// Publish a value.
    pub fn next(&self, value: T) {
        *self.last.borrow_mut() = Some(value.clone());
        self.listeners.emit(&value);
    }

    /// Subscribe to future values (and the latest one, when replaying).
    pub fn subscribe(&self, callback: impl Fn(&T) + 'static) -> Subscription {
        let replayed = if self.replay {
            self.last.borrow().clone()
        } else {
            None
        };
        if let Some(value) = replayed {
            callback(&value);
        }
        self.listeners.add(callback)
    }

    /// The most recently published value.
    #[must_use]
    pub fn last(&self) -> Option<T> {
        self.last.borrow().clone()
    }

    /// Live subscriber count.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.listeners.len()
    }
}

impl<T: 'static> fmt::Debug for Subject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subject")
            .field("observers", &self.listeners.len())
            .field("replay", &self.replay)
            .finish()
    }
}

type Waiter<T> = Box<dyn FnOnce(T)>;

enum Slot<T> {
    Pending(Vec<(u64, Waiter<T>)>),
    Ready(T),
}

struct DeferredInner<T> {
    slot: RefCell<Slot<T>>,
    next_id: Cell<u64>,
    upstream: RefCell<Vec<Subscription>>,
}

/// A value that becomes available once.
pub struct Deferred<T: 'static> {
    inner: Rc<DeferredInner<T>>,
}

impl<T: 'static> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

/// Completes a pending [`Deferred`].
pub struct Resolver<T: 'static> {
    inner: Rc<DeferredInner<T>>,
}

impl<T: Clone + 'static> Resolver<T> {
    /// Resolve the value, waking every waiting consumer in order.
    ///
    /// Ignored when the value is already resolved.
    pub fn resolve(&self, value: T) {
        let waiters = {
            let mut slot = self.inner.slot.borrow_mut();
            if matches!(*slot, Slot::Ready(_)) {
                return;
            }
            match std::mem::replace(&mut *slot, Slot::Ready(value.clone())) {
                Slot::Pending(waiters) => waiters,
                Slot::Ready(_) => Vec::new(),
            }
        };
        for (_, waiter) in waiters {
            waiter(value.clone());
        }
    }

    /// Whether the value was already resolved.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(*self.inner.slot.borrow(), Slot::Ready(_))
    }
}

impl<T: Clone + 'static> Deferred<T> {
    fn from_slot(slot: Slot<T>) -> Self {
        Self {
            inner: Rc::new(DeferredInner {
                slot: RefCell::new(slot),
                next_id: Cell::new(1),
                upstream: RefCell::new(Vec::new()),
            }),
        }
    }

    /// An already-resolved value.
    #[must_use]
    pub fn ready(value: T) -> Self {
        Self::from_slot(Slot::Ready(value))
    }

    /// A pending value and the resolver that completes it.
    #[must_use]
    pub fn pending() -> (Self, Resolver<T>) {
        let deferred = Self::from_slot(Slot::Pending(Vec::new()));
        let resolver = Resolver {
            inner: Rc::clone(&deferred.inner),
        };
        (deferred, resolver)
    }

    /// Whether the value is available.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(*self.inner.slot.borrow(), Slot::Ready(_))
    }

    /// The value, if available.
    #[must_use]
    pub fn value(&self) -> Option<T> {
        match &*self.inner.slot.borrow() {
            Slot::Ready(value) => Some(value.clone()),
            Slot::Pending(_) => None,
        }
    }

    /// Receive the value once it is available.
    pub fn subscribe(&self, callback: impl FnOnce(T) + 'static) -> Subscription {
        if let Some(value) = self.value() {
            callback(value);
            return Subscription::empty();
        }
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        if let Slot::Pending(waiters) = &mut *self.inner.slot.borrow_mut() {
            waiters.push((id, Box::new(callback)));
        }
        let weak = Rc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                if let Slot::Pending(waiters) = &mut *inner.slot.borrow_mut() {
                    waiters.retain(|(entry, _)| *entry != id);
                }
            }
        })
    }

    fn hold(&self, upstream: Subscription) {
        if !upstream.is_closed() {
            self.inner.upstream.borrow_mut().push(upstream);
        }
    }

    /// Transform the value once it arrives.
    #[must_use]
    pub fn map<U: Clone + 'static>(&self, f: impl FnOnce(T) -> U + 'static) -> Deferred<U> {
        let (out, resolver) = Deferred::pending();
        let sub = self.subscribe(move |value| resolver.resolve(f(value)));
        out.hold(sub);
        out
    }

    /// Chain another deferred computation.
    #[must_use]
    pub fn and_then<U: Clone + 'static>(
        &self,
        f: impl FnOnce(T) -> Deferred<U> + 'static,
    ) -> Deferred<U> {
        let (out, resolver) = Deferred::pending();
        let holder = out.clone();
        let sub = self.subscribe(move |value| {
            let next = f(value);
            let inner = next.subscribe(move |u| resolver.resolve(u));
            holder.hold(inner);
        });
        out.hold(sub);
        out
    }
}

impl<T: 'static> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ready = matches!(*self.inner.slot.borrow(), Slot::Ready(_));
        f.debug_struct("Deferred").field("ready", &ready).finish()
    }
}

/// Wait for both values.
#[must_use]
pub fn join<A, B>(a: &Deferred<A>, b: &Deferred<B>) -> Deferred<(A, B)>
where
    A: Clone + 'static,
    B: Clone + 'static,
{
    let (out, resolver) = Deferred::pending();
    let resolver = Rc::new(resolver);
    let parts: Rc<RefCell<(Option<A>, Option<B>)>> = Rc::new(RefCell::new((None, None)));

    let finish = {
        let parts = Rc::clone(&parts);
        let resolver = Rc::clone(&resolver);
        move || {
            let ready = {
                let p = parts.borrow();
                match (&p.0, &p.1) {
                    (Some(a), Some(b)) => Some((a.clone(), b.clone())),
                    _ => None,
                }
            };
            if let Some(pair) = ready {
                resolver.resolve(pair);
            }
        }
    };
    let finish = Rc::new(finish);

    let p = Rc::clone(&parts);
    let f = Rc::clone(&finish);
    let sub_a = a.subscribe(move |value| {
        p.borrow_mut().0 = Some(value);
        (*f)();
    });
    let p = Rc::clone(&parts);
    let f = Rc::clone(&finish);
    let sub_b = b.subscribe(move |value| {
        p.borrow_mut().1 = Some(value);
        (*f)();
    });
    out.hold(sub_a);
    out.hold(sub_b);
    out
}

/// Wait for every value, preserving input order.
#[must_use]
pub fn join_all<T: Clone + 'static>(items: Vec<Deferred<T>>) -> Deferred<Vec<T>> {
    if items.is_empty() {
        return Deferred::ready(Vec::new());
    }
    let (out, resolver) = Deferred::pending();
    let resolver = Rc::new(resolver);
    let total = items.len();
    let values: Rc<RefCell<Vec<Option<T>>>> = Rc::new(RefCell::new(vec![None; total]));

    for (index, item) in items.iter().enumerate() {
        let values = Rc::clone(&values);
        let resolver = Rc::clone(&resolver);
        let sub = item.subscribe(move |value| {
            let complete = {
                let mut v = values.borrow_mut();
                v[index] = Some(value);
                if v.iter().all(Option::is_some) {
                    Some(v.iter().flatten().cloned().collect::<Vec<T>>())
                } else {
                    None
                }
            };
            if let Some(all) = complete {
                resolver.resolve(all);
            }
        });
        out.hold(sub);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_multicasts_in_order() {
        let subject: Subject<u32> = Subject::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s1 = Rc::clone(&seen);
        let _a = subject.subscribe(move |v| s1.borrow_mut().push(("a", *v)));
        let s2 = Rc::clone(&seen);
        let _b = subject.subscribe(move |v| s2.borrow_mut().push(("b", *v)));
        subject.next(1);
        assert_eq!(*seen.borrow(), vec![("a", 1), ("b", 1)]);
        assert_eq!(subject.observer_count(), 2);
    }

    #[test]
    fn replaying_subject_delivers_latest() {
        let subject: Subject<u32> = Subject::replaying();
        subject.next(1);
        subject.next(2);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        let _sub = subject.subscribe(move |v| s.borrow_mut().push(*v));
        assert_eq!(*seen.borrow(), vec![2]);
    }

    #[test]
    fn plain_subject_does_not_replay() {
        let subject: Subject<u32> = Subject::new();
        subject.next(1);
        let seen = Rc::new(Cell::new(0));
        let s = Rc::clone(&seen);
        let _sub = subject.subscribe(move |v| s.set(*v));
        assert_eq!(seen.get(), 0);
        assert_eq!(subject.last(), Some(1));
    }

    #[test]
    fn deferred_resolves_once() {
        let (d, r) = Deferred::<u32>::pending();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        let _sub = d.subscribe(move |v| s.borrow_mut().push(v));
        r.resolve(1);
        r.resolve(2);
        assert_eq!(*seen.borrow(), vec![1]);
        assert_eq!(d.value(), Some(1));
    }

    #[test]
    fn dropped_subscription_is_not_called() {
        let (d, r) = Deferred::<u32>::pending();
        let seen = Rc::new(Cell::new(0));
        let s = Rc::clone(&seen);
        let sub = d.subscribe(move |v| s.set(v));
        drop(sub);
        r.resolve(5);
        assert_eq!(seen.get(), 0);
    }

    #[test]
    fn map_and_then_chain() {
        let (d, r) = Deferred::<u32>::pending();
        let chained = d.map(|v| v + 1).and_then(|v| Deferred::ready(v * 10));
        assert!(!chained.is_ready());
        r.resolve(1);
        assert_eq!(chained.value(), Some(20));
    }

    #[test]
    fn join_waits_for_both() {
        let (a, ra) = Deferred::<u32>::pending();
        let b = Deferred::ready("x".to_owned());
        let both = join(&a, &b);
        assert!(!both.is_ready());
        ra.resolve(3);
        assert_eq!(both.value(), Some((3, "x".to_owned())));
    }

    #[test]
    fn join_all_preserves_order() {
        let (a, ra) = Deferred::<u32>::pending();
        let (b, rb) = Deferred::<u32>::pending();
        let all = join_all(vec![a, b]);
        rb.resolve(2);
        ra.resolve(1);
        assert_eq!(all.value(), Some(vec![1, 2]));
        assert_eq!(join_all::<u32>(Vec::new()).value(), Some(Vec::new()));
    }
}
