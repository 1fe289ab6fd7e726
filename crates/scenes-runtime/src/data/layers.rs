#![forbid(unsafe_code)]

//! Data layers: independent annotation sources merged into one provider.
//!
//! A [`SceneDataLayerSet`] normally sits in the root's `$data` slot. Query
//! runners below it merge its output into their own annotations.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use scenes_core::{
    Cleanup, SceneObject, SceneResult, StatePatch, StateSnapshot, Subject, WeakSceneObject,
};
use serde_json::{Value, json};
use tracing::{debug, trace, warn};

use super::merge::DataLayerMerger;
use super::query_runner::{InFlight, QueryProviders, build_request};
use super::{
    DataProviderCap, LoadingState, PanelData, QueryError, ResultEnvelope, SceneDataProvider,
};
use crate::time_range::get_time_range;
use crate::variables::VariableDependencyConfig;

/// Marks a node as a set of data layers.
#[derive(Debug, Clone, Copy, Default)]
pub struct LayerSetCap;

struct AnnotationsCore {
    me: WeakSceneObject,
    results: Subject<ResultEnvelope>,
    data: RefCell<Option<Rc<PanelData>>>,
    in_flight: InFlight,
    seq: Cell<u64>,
}

impl AnnotationsCore {
    fn publish(&self, data: PanelData) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let data = Rc::new(data);
        *self.data.borrow_mut() = Some(Rc::clone(&data));
        self.results.next(ResultEnvelope::new(&me, data));
        me.force_render();
    }

    fn run(self: &Rc<Self>) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        if me.state().get_bool("isEnabled") == Some(false) {
            trace!(key = %me.key(), "annotation layer disabled");
            return;
        }
        let state = me.state();
        let query = state.get("query").cloned().unwrap_or(Value::Null);
        let seq = self.seq.get() + 1;
        self.seq.set(seq);
        let request = match build_request(
            &me,
            format!("{}-{seq}", me.key()),
            std::slice::from_ref(&query),
            state.get_str("datasource").map(str::to_owned),
            500,
            None,
        ) {
            Ok(request) => Rc::new(request),
            Err(err) => {
                warn!(key = %me.key(), error = %err, "annotation request not built");
                return;
            }
        };
        let Some(provider) = QueryProviders::find(&me, request.datasource.as_deref()) else {
            warn!(key = %me.key(), datasource = ?request.datasource, "no provider for annotations");
            let mut data = PanelData::empty(LoadingState::Error, request.range);
            data.errors.push(QueryError::new("no query provider for annotations"));
            self.publish(data.with_annotations(Vec::new()));
            return;
        };

        debug!(key = %me.key(), request_id = %request.request_id, "running annotation query");
        self.publish(PanelData::empty(LoadingState::Loading, request.range));
        let core = Rc::downgrade(self);
        let range = request.range;
        self.in_flight.start(&provider, request, move |data| {
            let Some(core) = core.upgrade() else {
                return;
            };
            // Provider series are this layer's annotations.
            let mut out = PanelData::empty(data.state, range);
            out.errors = data.errors;
            out.annotations = Some(data.series);
            core.publish(out);
        });
    }
}

impl SceneDataProvider for AnnotationsCore {
    fn data(&self) -> Option<Rc<PanelData>> {
        self.data.borrow().clone()
    }

    fn results(&self) -> Subject<ResultEnvelope> {
        self.results.clone()
    }

    fn run_queries(&self) {
        if let Some(layer) = self.me.upgrade().as_ref().and_then(AnnotationsDataLayer::from_object) {
            layer.core.run();
        }
    }

    fn cancel_query(&self) {
        self.in_flight.cancel();
    }
}

/// A toggleable annotation query.
///
/// # State fields
///
/// `name`, `isEnabled`, `query` (query object), `datasource` (optional).
#[derive(Clone)]
pub struct AnnotationsDataLayer {
    object: SceneObject,
    core: Rc<AnnotationsCore>,
}

impl AnnotationsDataLayer {
    /// Layer `name` running `query`.
    pub fn new(name: impl Into<String>, query: Value) -> Self {
        let state = StateSnapshot::from_json(json!({
            "name": name.into(),
            "isEnabled": true,
            "query": query,
        }));
        let object = SceneObject::new("AnnotationsDataLayer", state);
        let core = Rc::new(AnnotationsCore {
            me: object.downgrade(),
            results: Subject::replaying(),
            data: RefCell::new(None),
            in_flight: InFlight::default(),
            seq: Cell::new(0),
        });
        object.attach(Rc::clone(&core));
        object.attach(Rc::new(DataProviderCap(core.clone())));
        VariableDependencyConfig::for_paths(["query", "datasource"])
            .on_referenced_variable_value_changed(|object, _| {
                if let Some(layer) = AnnotationsDataLayer::from_object(object) {
                    layer.core.run();
                }
            })
            .attach_to(&object);
        object.add_activation_handler(Self::on_activate);
        Self { object, core }
    }

    fn on_activate(object: &SceneObject) -> SceneResult<Option<Cleanup>> {
        let Some(layer) = Self::from_object(object) else {
            return Ok(None);
        };
        if let Some(range) = get_time_range(object) {
            let weak = Rc::downgrade(&layer.core);
            object.add_subscription(range.subscribe_to_value(move |_| {
                if let Some(core) = weak.upgrade() {
                    core.run();
                }
            }));
        }
        layer.core.run();
        let core = Rc::downgrade(&layer.core);
        Ok(Some(Box::new(move || {
            if let Some(core) = core.upgrade() {
                core.in_flight.cancel();
            }
        })))
    }

    /// Use datasource `uid`.
    #[must_use]
    pub fn with_datasource(self, uid: impl Into<String>) -> Self {
        self.object
            .set_state(StatePatch::new().set("datasource", uid.into()));
        self
    }

    /// Recover the layer view of a scene object.
    #[must_use]
    pub fn from_object(object: &SceneObject) -> Option<Self> {
        object.capability::<AnnotationsCore>().map(|core| Self {
            object: object.clone(),
            core,
        })
    }

    /// The underlying scene object.
    #[must_use]
    pub fn object(&self) -> &SceneObject {
        &self.object
    }

    /// Whether the layer contributes annotations.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.object.state().get_bool("isEnabled").unwrap_or(true)
    }

    /// Toggle the layer. Disabling publishes an empty result.
    pub fn set_enabled(&self, enabled: bool) {
        if enabled == self.is_enabled() {
            return;
        }
        debug!(key = %self.object.key(), enabled, "annotation layer toggled");
        self.object
            .set_state(StatePatch::new().set("isEnabled", enabled));
        if enabled {
            if self.object.is_active() {
                self.core.run();
            }
        } else {
            self.core.in_flight.cancel();
            let range = self
                .core
                .data
                .borrow()
                .as_ref()
                .map(|d| d.time_range)
                .or_else(|| get_time_range(&self.object).map(|r| r.value()));
            if let Some(range) = range {
                self.core
                    .publish(PanelData::empty(LoadingState::Done, range).with_annotations(Vec::new()));
            }
        }
    }

    /// Latest data.
    #[must_use]
    pub fn data(&self) -> Option<Rc<PanelData>> {
        self.core.data()
    }
}

impl fmt::Debug for AnnotationsDataLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnnotationsDataLayer")
            .field("key", &self.object.key())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

struct LayerSetCore {
    me: WeakSceneObject,
    results: Subject<ResultEnvelope>,
    data: RefCell<Option<Rc<PanelData>>>,
    merger: DataLayerMerger,
}

impl LayerSetCore {
    fn on_merged(&self, envelopes: &[ResultEnvelope]) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let Some(first) = envelopes.first() else {
            return;
        };
        let mut out = PanelData::empty(LoadingState::Done, first.data.time_range);
        let mut annotations = Vec::new();
        for envelope in envelopes {
            let data = &envelope.data;
            if let Some(frames) = &data.annotations {
                annotations.extend(frames.iter().cloned());
            }
            out.errors.extend(data.errors.iter().cloned());
            out.state = match (out.state, data.state) {
                (LoadingState::Error, _) | (_, LoadingState::Error) => LoadingState::Error,
                (LoadingState::Loading, _) | (_, LoadingState::Loading) => LoadingState::Loading,
                (LoadingState::Streaming, _) | (_, LoadingState::Streaming) => LoadingState::Streaming,
                (state, _) => state,
            };
        }
        trace!(layers = envelopes.len(), frames = annotations.len(), "layer set merged");
        let data = Rc::new(out.with_annotations(annotations));
        *self.data.borrow_mut() = Some(Rc::clone(&data));
        self.results.next(ResultEnvelope::new(&me, data));
        me.force_render();
    }
}

impl SceneDataProvider for LayerSetCore {
    fn data(&self) -> Option<Rc<PanelData>> {
        self.data.borrow().clone()
    }

    fn results(&self) -> Subject<ResultEnvelope> {
        self.results.clone()
    }

    fn run_queries(&self) {
        if let Some(me) = self.me.upgrade() {
            for child in me.children() {
                if let Some(cap) = child.capability::<DataProviderCap>() {
                    cap.0.run_queries();
                }
            }
        }
    }

    fn cancel_query(&self) {
        if let Some(me) = self.me.upgrade() {
            for child in me.children() {
                if let Some(cap) = child.capability::<DataProviderCap>() {
                    cap.0.cancel_query();
                }
            }
        }
    }
}

/// A group of data layers publishing their merged annotations.
#[derive(Clone)]
pub struct SceneDataLayerSet {
    object: SceneObject,
    core: Rc<LayerSetCore>,
}

impl SceneDataLayerSet {
    /// Set over `layers`; they become its children.
    #[must_use]
    pub fn new(layers: Vec<AnnotationsDataLayer>) -> Self {
        let object = SceneObject::new("SceneDataLayerSet", StateSnapshot::new());
        let core = Rc::new(LayerSetCore {
            me: object.downgrade(),
            results: Subject::replaying(),
            data: RefCell::new(None),
            merger: DataLayerMerger::new(),
        });
        object.attach(Rc::clone(&core));
        object.attach(Rc::new(DataProviderCap(core.clone())));
        object.attach(Rc::new(LayerSetCap));
        for layer in &layers {
            if let Err(err) = object.add_child(layer.object()) {
                warn!(error = %err, "data layer not added");
            }
        }
        object.add_activation_handler(|object| {
            let Some(set) = SceneDataLayerSet::from_object(object) else {
                return Ok(None);
            };
            let layers = object.children();
            let stream = set.core.merger.get_merged_stream(&layers);
            let weak = Rc::downgrade(&set.core);
            let subscription = stream.subscribe(move |envelopes| {
                if let Some(core) = weak.upgrade() {
                    core.on_merged(envelopes);
                }
            });
            Ok(Some(Box::new(move || {
                drop(subscription);
                stream.close();
            })))
        });
        Self { object, core }
    }

    /// Recover the layer set view of a scene object.
    #[must_use]
    pub fn from_object(object: &SceneObject) -> Option<Self> {
        object.capability::<LayerSetCore>().map(|core| Self {
            object: object.clone(),
            core,
        })
    }

    /// The underlying scene object.
    #[must_use]
    pub fn object(&self) -> &SceneObject {
        &self.object
    }

    /// The layers.
    #[must_use]
    pub fn layers(&self) -> Vec<AnnotationsDataLayer> {
        self.object
            .children()
            .iter()
            .filter_map(AnnotationsDataLayer::from_object)
            .collect()
    }

    /// Latest merged data.
    #[must_use]
    pub fn data(&self) -> Option<Rc<PanelData>> {
        self.core.data()
    }
}

impl fmt::Debug for SceneDataLayerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SceneDataLayerSet")
            .field("key", &self.object.key())
            .field("layers", &self.object.children().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DataFrame, FnQueryProvider, QueryRunnerOptions, SceneQueryRunner};
    use crate::time_range::{FixedClock, SceneTimeRange};
    use scenes_core::{Slot, Subscription};

    fn annotation_provider() -> FnQueryProvider {
        FnQueryProvider::new(|request, sink| {
            let name = request.queries[0]["name"].as_str().unwrap_or("?").to_owned();
            sink.next(PanelData::empty(LoadingState::Done, request.range).with_series(vec![DataFrame::new(name)]));
            Subscription::empty()
        })
    }

    fn dashboard(layers: &SceneDataLayerSet) -> (SceneObject, SceneQueryRunner) {
        dashboard_with(layers, annotation_provider())
    }

    fn dashboard_with(
        layers: &SceneDataLayerSet,
        provider: FnQueryProvider,
    ) -> (SceneObject, SceneQueryRunner) {
        let root = SceneObject::new("Root", StateSnapshot::new());
        let range = SceneTimeRange::with_clock("now-1h", "now", Rc::new(FixedClock::new(1_000_000_000)));
        root.set_slot(Slot::TimeRange, Some(range.object())).unwrap();
        root.set_slot(Slot::Data, Some(layers.object())).unwrap();
        QueryProviders::new().with_default(provider).attach_to(&root);
        let panel = SceneObject::new("Panel", StateSnapshot::new());
        root.add_child(&panel).unwrap();
        let runner = SceneQueryRunner::new(json!({"refId": "A", "name": "series"}), QueryRunnerOptions::default());
        panel.set_slot(Slot::Data, Some(runner.object())).unwrap();
        (root, runner)
    }

    fn ann_ids(data: &PanelData) -> Vec<String> {
        data.annotations
            .iter()
            .flat_map(|a| a.iter())
            .filter_map(|f| f.ref_id.clone())
            .collect()
    }

    #[test]
    fn layer_set_merges_layer_annotations() {
        let set = SceneDataLayerSet::new(vec![
            AnnotationsDataLayer::new("deploys", json!({"name": "deploys"})),
            AnnotationsDataLayer::new("alerts", json!({"name": "alerts"})),
        ]);
        let (root, _) = dashboard(&set);
        root.activate().unwrap();
        let data = set.data().unwrap();
        assert_eq!(data.state, LoadingState::Done);
        assert_eq!(ann_ids(&data), vec!["deploys", "alerts"]);
    }

    #[test]
    fn runner_carries_ancestor_annotations() {
        let set = SceneDataLayerSet::new(vec![AnnotationsDataLayer::new(
            "deploys",
            json!({"name": "deploys"}),
        )]);
        let (root, runner) = dashboard(&set);
        root.activate().unwrap();
        runner.object().activate().unwrap();
        let data = runner.data().unwrap();
        assert_eq!(data.series[0].ref_id.as_deref(), Some("series"));
        assert_eq!(ann_ids(&data), vec!["deploys"]);
    }

    #[test]
    fn disabling_a_layer_remerges() {
        let deploys = AnnotationsDataLayer::new("deploys", json!({"name": "deploys"}));
        let alerts = AnnotationsDataLayer::new("alerts", json!({"name": "alerts"}));
        let set = SceneDataLayerSet::new(vec![deploys.clone(), alerts]);
        let (root, runner) = dashboard(&set);
        root.activate().unwrap();
        runner.object().activate().unwrap();

        deploys.set_enabled(false);
        assert_eq!(ann_ids(&set.data().unwrap()), vec!["alerts"]);
        assert_eq!(ann_ids(&runner.data().unwrap()), vec!["alerts"]);

        deploys.set_enabled(true);
        assert_eq!(ann_ids(&set.data().unwrap()), vec!["deploys", "alerts"]);
    }

    #[test]
    fn query_annotations_survive_layer_remerge() {
        let provider = FnQueryProvider::new(|request, sink| {
            let name = request.queries[0]["name"].as_str().unwrap_or("?").to_owned();
            let mut data = PanelData::empty(LoadingState::Done, request.range)
                .with_series(vec![DataFrame::new(name.clone())]);
            if name == "series" {
                data = data.with_annotations(vec![DataFrame::new("own")]);
            }
            sink.next(data);
            Subscription::empty()
        });
        let deploys = AnnotationsDataLayer::new("deploys", json!({"name": "deploys"}));
        let alerts = AnnotationsDataLayer::new("alerts", json!({"name": "alerts"}));
        let set = SceneDataLayerSet::new(vec![deploys.clone(), alerts]);
        let (root, runner) = dashboard_with(&set, provider);
        root.activate().unwrap();
        runner.object().activate().unwrap();
        assert_eq!(ann_ids(&runner.data().unwrap()), vec!["own", "deploys", "alerts"]);

        deploys.set_enabled(false);
        assert_eq!(ann_ids(&runner.data().unwrap()), vec!["own", "alerts"]);

        deploys.set_enabled(true);
        assert_eq!(ann_ids(&runner.data().unwrap()), vec!["own", "deploys", "alerts"]);
        assert_eq!(runner.query_runs(), 1);
    }

    #[test]
    fn deactivating_the_set_deactivates_layers() {
        let layer = AnnotationsDataLayer::new("deploys", json!({"name": "deploys"}));
        let set = SceneDataLayerSet::new(vec![layer.clone()]);
        let (root, _) = dashboard(&set);
        root.activate().unwrap();
        assert!(layer.object().is_active());
        root.deactivate();
        assert!(!set.object().is_active());
        assert!(!layer.object().is_active());
    }
}
