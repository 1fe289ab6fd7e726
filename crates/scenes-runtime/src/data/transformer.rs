#![forbid(unsafe_code)]

//! Post-processing of another provider's data.
//!
//! # Source resolution
//!
//! 1. The transformer's own `$data` slot, which must be a plain provider
//!    (a layer set is rejected).
//! 2. Otherwise the nearest provider seen from the transformer's
//!    grandparent (its parent holds the transformer itself in `$data`).
//! 3. Otherwise activation fails with [`SceneError::MissingDataProvider`].
//!
//! # Invariants
//!
//! 1. Input whose `series` and `annotations` are pointer-equal to the input
//!    behind the cached output only patches `state` on that output; the
//!    pipelines do not run. While a transform of the same frames is still
//!    running, the new input only replaces what that transform will publish
//!    around its results.
//! 2. Series and annotation steps run as two pipelines and are joined
//!    before publishing.
//! 3. At most one transform is in flight; a new input drops the previous
//!    subscription, so the latest input wins.
//! 4. A failing step never escapes: the source data is republished with
//!    the error appended and state [`LoadingState::Error`].

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use scenes_core::{
    SceneError, SceneObject, SceneResult, Slot, StateSnapshot, Subject, Subscription,
    WeakSceneObject, join,
};
use tracing::{debug, trace};

use super::layers::LayerSetCap;
use super::transformations::run_pipeline;
use super::{
    DataProviderCap, DataProviderRef, DataTopic, DataTransformation, LoadingState, PanelData,
    QueryError, ResultEnvelope, SceneDataProvider, get_data,
};

struct TransformerCore {
    me: WeakSceneObject,
    transformations: RefCell<Vec<Rc<dyn DataTransformation>>>,
    results: Subject<ResultEnvelope>,
    output: RefCell<Option<Rc<PanelData>>>,
    output_input: RefCell<Option<Rc<PanelData>>>,
    last_input: RefCell<Option<Rc<PanelData>>>,
    in_flight: RefCell<Option<(Rc<PanelData>, Subscription)>>,
    generation: Cell<u64>,
    completed: Cell<u64>,
    runs: Cell<u64>,
}

impl TransformerCore {
    fn publish(&self, data: PanelData) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let data = Rc::new(data);
        *self.output.borrow_mut() = Some(Rc::clone(&data));
        self.results.next(ResultEnvelope::new(&me, data));
        me.force_render();
    }

    fn source(&self) -> SceneResult<DataProviderRef> {
        let me = self
            .me
            .upgrade()
            .ok_or_else(|| SceneError::Configuration("transformer dropped".into()))?;
        if let Some(own) = me.slot(Slot::Data) {
            if own.has_capability::<LayerSetCap>() {
                return Err(SceneError::InvalidDataSource {
                    object: me.key().to_owned(),
                    reason: "a data layer set cannot feed a transformer".into(),
                });
            }
            return DataProviderRef::from_object(&own).ok_or_else(|| SceneError::InvalidDataSource {
                object: me.key().to_owned(),
                reason: format!("{} is not a data provider", own.key()),
            });
        }
        me.parent()
            .and_then(|parent| parent.parent())
            .and_then(|grandparent| get_data(&grandparent))
            .ok_or_else(|| SceneError::MissingDataProvider {
                object: me.key().to_owned(),
            })
    }

    /// Input of the transform still waiting for its pipelines.
    fn pending_input(&self) -> Option<Rc<PanelData>> {
        if self.completed.get() == self.generation.get() {
            return None;
        }
        self.in_flight
            .borrow()
            .as_ref()
            .map(|(input, _)| Rc::clone(input))
    }

    fn transform(self: &Rc<Self>, data: Rc<PanelData>, force: bool) {
        *self.last_input.borrow_mut() = Some(Rc::clone(&data));

        let steps = self.transformations.borrow().clone();
        if steps.is_empty() {
            drop(self.in_flight.borrow_mut().take());
            *self.output_input.borrow_mut() = Some(Rc::clone(&data));
            self.publish((*data).clone());
            return;
        }

        if !force {
            if let Some(pending) = self.pending_input() {
                if pending.same_frames(&data) {
                    trace!(state = ?data.state, "frames already transforming, deferring state");
                    return;
                }
            } else {
                let source = self.output_input.borrow().clone();
                let output = self.output.borrow().clone();
                if let (Some(source), Some(output)) = (source, output) {
                    if source.same_frames(&data) {
                        trace!(state = ?data.state, "frames unchanged, patching state only");
                        let mut patched = (*output).clone();
                        patched.state = data.state;
                        *self.output_input.borrow_mut() = Some(Rc::clone(&data));
                        self.publish(patched);
                        return;
                    }
                }
            }
        }

        drop(self.in_flight.borrow_mut().take());
        self.runs.set(self.runs.get() + 1);
        let generation = self.generation.get() + 1;
        self.generation.set(generation);

        let (series_steps, annotation_steps): (Vec<_>, Vec<_>) = steps
            .into_iter()
            .partition(|step| step.topic() == DataTopic::Series);
        let series = run_pipeline(series_steps, data.series.to_vec());
        let annotations = run_pipeline(
            annotation_steps,
            data.annotations.as_deref().map(<[_]>::to_vec).unwrap_or_default(),
        );

        let core = Rc::downgrade(self);
        let input = Rc::clone(&data);
        let subscription = join(&series, &annotations).subscribe(move |(series, annotations)| {
            let Some(core) = core.upgrade() else {
                return;
            };
            core.completed.set(generation);
            // Inputs that arrived while the pipelines ran carry the newest state.
            let latest = core.last_input.borrow().clone();
            let base = match latest {
                Some(latest) if latest.same_frames(&input) => latest,
                _ => Rc::clone(&input),
            };
            let mut out = (*base).clone();
            match (series, annotations) {
                (Ok(series), Ok(annotations)) => {
                    out.series = Rc::from(series);
                    if base.annotations.is_some() || !annotations.is_empty() {
                        out.annotations = Some(Rc::from(annotations));
                    }
                }
                (Err(err), _) | (_, Err(err)) => {
                    debug!(error = %err, "transformation failed");
                    out.errors.push(QueryError::new(err.to_string()));
                    out.state = LoadingState::Error;
                }
            }
            *core.output_input.borrow_mut() = Some(base);
            core.publish(out);
        });
        if self.completed.get() != generation {
            *self.in_flight.borrow_mut() = Some((data, subscription));
        }
    }
}

impl SceneDataProvider for TransformerCore {
    fn data(&self) -> Option<Rc<PanelData>> {
        self.output.borrow().clone()
    }

    fn results(&self) -> Subject<ResultEnvelope> {
        self.results.clone()
    }

    fn run_queries(&self) {
        if let Ok(source) = self.source() {
            source.provider.run_queries();
        }
    }

    fn cancel_query(&self) {
        if let Ok(source) = self.source() {
            source.provider.cancel_query();
        }
    }

    fn is_data_ready_to_display(&self) -> bool {
        self.source()
            .map_or(true, |source| source.provider.is_data_ready_to_display())
    }
}

/// Applies transformations to the data of another provider.
#[derive(Clone)]
pub struct SceneDataTransformer {
    object: SceneObject,
    core: Rc<TransformerCore>,
}

impl SceneDataTransformer {
    /// Transformer running `transformations` in order.
    pub fn new(transformations: Vec<Rc<dyn DataTransformation>>) -> Self {
        let object = SceneObject::new("SceneDataTransformer", StateSnapshot::new());
        let core = Rc::new(TransformerCore {
            me: object.downgrade(),
            transformations: RefCell::new(transformations),
            results: Subject::replaying(),
            output: RefCell::new(None),
            output_input: RefCell::new(None),
            last_input: RefCell::new(None),
            in_flight: RefCell::new(None),
            generation: Cell::new(0),
            completed: Cell::new(0),
            runs: Cell::new(0),
        });
        object.attach(Rc::clone(&core));
        object.attach(Rc::new(DataProviderCap(core.clone())));

        let weak = Rc::downgrade(&core);
        object.add_activation_handler(move |_| {
            let Some(core) = weak.upgrade() else {
                return Ok(None);
            };
            let source = core.source()?;
            debug!(source = %source.object.key(), "transformer attached to source");
            let inner = Rc::downgrade(&core);
            let subscription = source.provider.results().subscribe(move |envelope| {
                if let Some(core) = inner.upgrade() {
                    core.transform(Rc::clone(&envelope.data), false);
                }
            });
            let cancel = Rc::downgrade(&core);
            Ok(Some(Box::new(move || {
                drop(subscription);
                if let Some(core) = cancel.upgrade() {
                    drop(core.in_flight.borrow_mut().take());
                }
            })))
        });
        Self { object, core }
    }

    /// Recover the transformer view of a scene object.
    #[must_use]
    pub fn from_object(object: &SceneObject) -> Option<Self> {
        object.capability::<TransformerCore>().map(|core| Self {
            object: object.clone(),
            core,
        })
    }

    /// The underlying scene object.
    #[must_use]
    pub fn object(&self) -> &SceneObject {
        &self.object
    }

    /// Use `source` as the explicit input.
    ///
    /// # Errors
    ///
    /// Fails when `source` already has a parent.
    pub fn set_source(&self, source: &SceneObject) -> SceneResult<()> {
        self.object.set_slot(Slot::Data, Some(source)).map(|_| ())
    }

    /// The resolved source.
    ///
    /// # Errors
    ///
    /// See the module documentation.
    pub fn source(&self) -> SceneResult<DataProviderRef> {
        self.core.source()
    }

    /// Transform `data` (normally fed by the source subscription).
    pub fn transform(&self, data: Rc<PanelData>) {
        self.core.transform(data, false);
    }

    /// Re-run the pipelines on the last input.
    pub fn reprocess_transformations(&self) {
        let last = self.core.last_input.borrow().clone();
        if let Some(data) = last {
            self.core.transform(data, true);
        }
    }

    /// Replace the steps and re-run.
    pub fn set_transformations(&self, transformations: Vec<Rc<dyn DataTransformation>>) {
        *self.core.transformations.borrow_mut() = transformations;
        self.reprocess_transformations();
    }

    /// Latest output.
    #[must_use]
    pub fn data(&self) -> Option<Rc<PanelData>> {
        self.core.data()
    }

    /// Output stream.
    #[must_use]
    pub fn results(&self) -> Subject<ResultEnvelope> {
        self.core.results()
    }

    /// How many times the pipelines actually ran.
    #[must_use]
    pub fn transform_runs(&self) -> u64 {
        self.core.runs.get()
    }
}

impl fmt::Debug for SceneDataTransformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SceneDataTransformer")
            .field("key", &self.object.key())
            .field("steps", &self.core.transformations.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{
        CustomTransformation, DataFrame, FilterByRefIdTransformation, SceneDataLayerSet,
        TransformError,
    };
    use crate::time_range::TimeRangeValue;
    use scenes_core::{Deferred, Resolver};

    fn input(state: LoadingState) -> PanelData {
        PanelData::empty(state, TimeRangeValue { from: 0, to: 1 })
            .with_series(vec![DataFrame::new("A"), DataFrame::new("B")])
    }

    fn filter_a() -> Vec<Rc<dyn DataTransformation>> {
        vec![Rc::new(FilterByRefIdTransformation::new(["A"]))]
    }

    #[test]
    fn state_only_change_skips_pipeline() {
        let t = SceneDataTransformer::new(filter_a());
        let first = Rc::new(input(LoadingState::Loading));
        t.transform(Rc::clone(&first));
        assert_eq!(t.transform_runs(), 1);
        assert_eq!(t.data().unwrap().series.len(), 1);

        let mut second = (*first).clone();
        second.state = LoadingState::Done;
        t.transform(Rc::new(second));
        assert_eq!(t.transform_runs(), 1);
        let out = t.data().unwrap();
        assert_eq!(out.state, LoadingState::Done);
        assert_eq!(out.series.len(), 1);

        t.transform(Rc::new(input(LoadingState::Done)));
        assert_eq!(t.transform_runs(), 2);

        t.reprocess_transformations();
        assert_eq!(t.transform_runs(), 3);
    }

    #[test]
    fn failure_becomes_error_state() {
        let steps: Vec<Rc<dyn DataTransformation>> = vec![Rc::new(CustomTransformation::new(
            "explode",
            |_| Err(TransformError::new("explode", "no")),
        ))];
        let t = SceneDataTransformer::new(steps);
        let mut data = input(LoadingState::Done);
        data.errors.push(QueryError::new("upstream"));
        t.transform(Rc::new(data));
        let out = t.data().unwrap();
        assert_eq!(out.state, LoadingState::Error);
        assert_eq!(out.errors.len(), 2);
        assert_eq!(out.errors[0].message, "upstream");
        assert_eq!(out.series.len(), 2);
    }

    #[test]
    fn latest_input_wins() {
        let resolvers: Rc<RefCell<Vec<Resolver<Result<Vec<DataFrame>, TransformError>>>>> =
            Rc::new(RefCell::new(Vec::new()));
        let r = Rc::clone(&resolvers);
        let steps: Vec<Rc<dyn DataTransformation>> =
            vec![Rc::new(CustomTransformation::deferred("slow", move |_| {
                let (d, resolver) = Deferred::pending();
                r.borrow_mut().push(resolver);
                d
            }))];
        let t = SceneDataTransformer::new(steps);
        t.transform(Rc::new(input(LoadingState::Done)));
        t.transform(Rc::new(input(LoadingState::Done)));
        assert_eq!(resolvers.borrow().len(), 2);

        let second = resolvers.borrow_mut().pop().unwrap();
        let first = resolvers.borrow_mut().pop().unwrap();
        second.resolve(Ok(vec![DataFrame::new("second")]));
        first.resolve(Ok(vec![DataFrame::new("first")]));
        assert_eq!(
            t.data().unwrap().series[0].ref_id.as_deref(),
            Some("second")
        );
    }

    #[test]
    fn state_arriving_mid_transform_is_published_with_its_results() {
        let resolvers: Rc<RefCell<Vec<Resolver<Result<Vec<DataFrame>, TransformError>>>>> =
            Rc::new(RefCell::new(Vec::new()));
        let r = Rc::clone(&resolvers);
        let steps: Vec<Rc<dyn DataTransformation>> =
            vec![Rc::new(CustomTransformation::deferred("slow", move |_| {
                let (d, resolver) = Deferred::pending();
                r.borrow_mut().push(resolver);
                d
            }))];
        let t = SceneDataTransformer::new(steps);

        t.transform(Rc::new(input(LoadingState::Done)));
        let first = resolvers.borrow_mut().pop().unwrap();
        first.resolve(Ok(vec![DataFrame::new("first")]));

        let loading = Rc::new(input(LoadingState::Loading));
        t.transform(Rc::clone(&loading));
        let mut done = (*loading).clone();
        done.state = LoadingState::Done;
        t.transform(Rc::new(done));
        assert_eq!(t.transform_runs(), 2);
        assert_eq!(resolvers.borrow().len(), 1);
        let out = t.data().unwrap();
        assert_eq!(out.series[0].ref_id.as_deref(), Some("first"));

        let second = resolvers.borrow_mut().pop().unwrap();
        second.resolve(Ok(vec![DataFrame::new("second")]));
        let out = t.data().unwrap();
        assert_eq!(out.series[0].ref_id.as_deref(), Some("second"));
        assert_eq!(out.state, LoadingState::Done);

        let mut streaming = (*loading).clone();
        streaming.state = LoadingState::Streaming;
        t.transform(Rc::new(streaming));
        assert_eq!(t.transform_runs(), 2);
        let out = t.data().unwrap();
        assert_eq!(out.series[0].ref_id.as_deref(), Some("second"));
        assert_eq!(out.state, LoadingState::Streaming);
    }

    #[test]
    fn annotation_steps_only_touch_annotations() {
        let steps: Vec<Rc<dyn DataTransformation>> = vec![Rc::new(
            CustomTransformation::new("drop-annotations", |_| Ok(Vec::new()))
                .with_topic(DataTopic::Annotations),
        )];
        let t = SceneDataTransformer::new(steps);
        let data = input(LoadingState::Done).with_annotations(vec![DataFrame::new("ann")]);
        t.transform(Rc::new(data));
        let out = t.data().unwrap();
        assert_eq!(out.series.len(), 2);
        assert_eq!(out.annotations.as_ref().map(|a| a.len()), Some(0));
    }

    #[test]
    fn missing_source_fails_activation() {
        let t = SceneDataTransformer::new(filter_a());
        let err = t.object().activate().unwrap_err();
        assert!(matches!(err, SceneError::MissingDataProvider { .. }));
        assert!(!t.object().is_active());
    }

    #[test]
    fn layer_set_is_rejected_as_source() {
        let t = SceneDataTransformer::new(filter_a());
        let layers = SceneDataLayerSet::new(Vec::new());
        t.set_source(layers.object()).unwrap();
        assert!(matches!(t.source(), Err(SceneError::InvalidDataSource { .. })));
    }
}
