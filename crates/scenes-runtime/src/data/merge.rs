#![forbid(unsafe_code)]

//! Merging the result streams of several data layers.
//!
//! [`DataLayerMerger::get_merged_stream`] subscribes to every layer and, on
//! each new result, emits all latest results known so far (one per origin
//! key, in first-seen order).
//!
//! # Invariants
//!
//! 1. When the layer list differs from the previous call (length or any
//!    pointer), the latest-results map is cleared first.
//! 2. An envelope whose payload is pointer-equal to the one already stored
//!    for its origin produces no emission.
//! 3. Closing the merged stream deactivates every layer the merger
//!    activated, exactly once each.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use scenes_core::{SceneObject, Subject, Subscription, WeakSceneObject};
use tracing::{trace, warn};

use super::{DataProviderCap, ResultEnvelope};

#[derive(Default)]
struct MergerCore {
    layers: RefCell<Vec<WeakSceneObject>>,
    latest: RefCell<IndexMap<String, ResultEnvelope>>,
}

/// Combines layer results; keeps its map across calls with the same layers.
#[derive(Default)]
pub struct DataLayerMerger {
    core: Rc<MergerCore>,
}

/// A live merged stream. Dropping it tears the subscriptions down.
pub struct MergedStream {
    output: Subject<Vec<ResultEnvelope>>,
    _teardown: Subscription,
}

impl MergedStream {
    /// Receive every merged emission; the latest one is replayed.
    pub fn subscribe(&self, callback: impl Fn(&Vec<ResultEnvelope>) + 'static) -> Subscription {
        self.output.subscribe(callback)
    }

    /// The latest merged emission.
    #[must_use]
    pub fn latest(&self) -> Option<Vec<ResultEnvelope>> {
        self.output.last()
    }

    /// Tear down now.
    pub fn close(self) {}
}

impl DataLayerMerger {
    /// Empty merger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of origins currently remembered.
    #[must_use]
    pub fn latest_count(&self) -> usize {
        self.core.latest.borrow().len()
    }

    fn reset_if_changed(&self, layers: &[SceneObject]) {
        let mut known = self.core.layers.borrow_mut();
        let same = known.len() == layers.len()
            && known.iter().zip(layers).all(|(weak, layer)| weak.is(layer));
        if !same {
            trace!(layers = layers.len(), "layer list changed, merge map cleared");
            self.core.latest.borrow_mut().clear();
            *known = layers.iter().map(SceneObject::downgrade).collect();
        }
    }

    /// Activate (if needed) and subscribe to every layer.
    pub fn get_merged_stream(&self, layers: &[SceneObject]) -> MergedStream {
        self.reset_if_changed(layers);

        let output = Subject::replaying();
        let mut subscriptions = Vec::with_capacity(layers.len());
        let mut activated = Vec::new();

        for layer in layers {
            let Some(cap) = layer.capability::<DataProviderCap>() else {
                warn!(layer = %layer.key(), "data layer without a provider skipped");
                continue;
            };
            if !layer.is_active() {
                match layer.activate() {
                    Ok(()) => activated.push(layer.downgrade()),
                    Err(err) => {
                        warn!(layer = %layer.key(), error = %err, "data layer failed to activate");
                        continue;
                    }
                }
            }
            let core: Weak<MergerCore> = Rc::downgrade(&self.core);
            let out = output.clone();
            subscriptions.push(cap.0.results().subscribe(move |envelope: &ResultEnvelope| {
                let Some(core) = core.upgrade() else {
                    return;
                };
                let snapshot = {
                    let mut latest = core.latest.borrow_mut();
                    if latest
                        .get(&envelope.origin_key)
                        .is_some_and(|prev| Rc::ptr_eq(&prev.data, &envelope.data))
                    {
                        trace!(origin = %envelope.origin_key, "duplicate layer result dropped");
                        return;
                    }
                    latest.insert(envelope.origin_key.clone(), envelope.clone());
                    latest.values().cloned().collect::<Vec<_>>()
                };
                out.next(snapshot);
            }));
        }

        let teardown = Subscription::new(move || {
            drop(subscriptions);
            for layer in activated.iter().filter_map(WeakSceneObject::upgrade) {
                layer.deactivate();
            }
        });
        MergedStream {
            output,
            _teardown: teardown,
        }
    }
}
