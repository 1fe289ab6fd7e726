#![forbid(unsafe_code)]

//! The query runner and the query provider boundary.
//!
//! A [`SceneQueryRunner`] turns its `queries` state into a [`QueryRequest`]
//! (queries interpolated against the visible variables, the nearest time
//! range, an interval derived from `maxDataPoints` and `minInterval`) and
//! hands it to the [`QueryProvider`] registered for its datasource. The
//! provider answers through a [`ResultSink`], any number of times, ending
//! in a terminal state.
//!
//! # Invariants
//!
//! 1. At most one request is in flight; starting a new one closes the sink
//!    of the previous one, so its late emissions are dropped.
//! 2. Nothing is dispatched while a referenced variable is loading; the
//!    runner re-runs once the variable set reports completion.
//! 3. Activation dispatches only when there is no settled data or the
//!    request would differ from the last one.
//!
//! # State fields
//!
//! `queries` (array of query objects), `datasource` (uid, optional),
//! `maxDataPoints`, `minInterval` (optional).

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use scenes_core::{
    Cleanup, SceneError, SceneObject, SceneResult, Slot, StatePatch, StateSnapshot, Subject,
    Subscription, WeakSceneObject,
};
use serde_json::{Value, json};
use tracing::{debug, error, trace};

use super::layers::LayerSetCap;
use super::merge::{DataLayerMerger, MergedStream};
use super::{
    DataFrame, DataProviderCap, LoadingState, PanelData, QueryError, ResultEnvelope,
    SceneDataProvider,
};
use crate::interpolate::{InterpolateOptions, ScopedVar, ScopedVars, interpolate, interpolate_json};
use crate::time_range::{TimeRangeValue, calculate_interval, get_time_range};
use crate::variables::VariableDependencyConfig;

/// What a provider is asked to execute.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    /// Unique per dispatch.
    pub request_id: String,
    /// Interpolated query objects.
    pub queries: Vec<Value>,
    /// Datasource uid; `None` selects the default provider.
    pub datasource: Option<String>,
    /// Resolved time range.
    pub range: TimeRangeValue,
    /// Interval in display form.
    pub interval: String,
    /// Interval in milliseconds.
    pub interval_ms: i64,
    /// Point budget.
    pub max_data_points: u32,
    /// `__interval` and `__interval_ms`.
    pub scoped_vars: ScopedVars,
}

impl QueryRequest {
    /// Whether `other` asks for the same thing (ids aside).
    #[must_use]
    pub fn same_target(&self, other: &Self) -> bool {
        self.queries == other.queries
            && self.datasource == other.datasource
            && self.range == other.range
            && self.interval_ms == other.interval_ms
            && self.max_data_points == other.max_data_points
    }
}

struct SinkInner {
    closed: Cell<bool>,
    on_data: Box<dyn Fn(PanelData)>,
}

/// Where a provider sends its answers. Emissions after [`close`] are
/// ignored.
///
/// [`close`]: ResultSink::close
#[derive(Clone)]
pub struct ResultSink {
    inner: Rc<SinkInner>,
}

impl ResultSink {
    /// Sink forwarding to `on_data`.
    pub fn new(on_data: impl Fn(PanelData) + 'static) -> Self {
        Self {
            inner: Rc::new(SinkInner {
                closed: Cell::new(false),
                on_data: Box::new(on_data),
            }),
        }
    }

    /// Deliver a result.
    pub fn next(&self, data: PanelData) {
        if self.inner.closed.get() {
            trace!(state = ?data.state, "result after cancellation dropped");
            return;
        }
        (self.inner.on_data)(data);
    }

    /// Stop forwarding.
    pub fn close(&self) {
        self.inner.closed.set(true);
    }

    /// Whether the sink was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }
}

impl fmt::Debug for ResultSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultSink")
            .field("closed", &self.inner.closed.get())
            .finish()
    }
}

/// Executes queries. Results may arrive synchronously or later.
pub trait QueryProvider {
    /// Start `request`; dropping the returned subscription cancels it.
    fn query(&self, request: Rc<QueryRequest>, sink: ResultSink) -> Subscription;
}

type QueryFn = dyn Fn(Rc<QueryRequest>, ResultSink) -> Subscription;

/// A provider backed by a closure.
#[derive(Clone)]
pub struct FnQueryProvider {
    query: Rc<QueryFn>,
}

impl FnQueryProvider {
    /// Wrap `query`.
    pub fn new(query: impl Fn(Rc<QueryRequest>, ResultSink) -> Subscription + 'static) -> Self {
        Self {
            query: Rc::new(query),
        }
    }
}

impl QueryProvider for FnQueryProvider {
    fn query(&self, request: Rc<QueryRequest>, sink: ResultSink) -> Subscription {
        (self.query)(request, sink)
    }
}

impl fmt::Debug for FnQueryProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnQueryProvider").finish_non_exhaustive()
    }
}

/// Providers by datasource uid, attached as a capability on an ancestor.
#[derive(Default)]
pub struct QueryProviders {
    default: Option<Rc<dyn QueryProvider>>,
    by_uid: HashMap<String, Rc<dyn QueryProvider>>,
}

impl QueryProviders {
    /// No providers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider used when a request names no datasource.
    #[must_use]
    pub fn with_default(mut self, provider: impl QueryProvider + 'static) -> Self {
        self.default = Some(Rc::new(provider));
        self
    }

    /// Provider for datasource `uid`.
    #[must_use]
    pub fn with_provider(mut self, uid: impl Into<String>, provider: impl QueryProvider + 'static) -> Self {
        self.by_uid.insert(uid.into(), Rc::new(provider));
        self
    }

    /// Make the providers visible to `object`'s subtree.
    pub fn attach_to(self, object: &SceneObject) {
        object.attach(Rc::new(self));
    }

    /// Provider for `uid`, or the default.
    #[must_use]
    pub fn get(&self, uid: Option<&str>) -> Option<Rc<dyn QueryProvider>> {
        match uid {
            Some(uid) => self.by_uid.get(uid).cloned().or_else(|| self.default.clone()),
            None => self.default.clone(),
        }
    }

    /// Nearest registry seen from `object`, asked for `uid`.
    #[must_use]
    pub fn find(object: &SceneObject, uid: Option<&str>) -> Option<Rc<dyn QueryProvider>> {
        object
            .closest::<QueryProviders>()
            .and_then(|(_, providers)| providers.get(uid))
    }
}

impl fmt::Debug for QueryProviders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut uids: Vec<&String> = self.by_uid.keys().collect();
        uids.sort();
        f.debug_struct("QueryProviders")
            .field("default", &self.default.is_some())
            .field("uids", &uids)
            .finish()
    }
}

/// Runner settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRunnerOptions {
    /// Point budget for the interval calculation.
    pub max_data_points: u32,
    /// Lower bound for the interval, e.g. `10s`.
    pub min_interval: Option<String>,
    /// Datasource uid.
    pub datasource: Option<String>,
}

impl Default for QueryRunnerOptions {
    fn default() -> Self {
        Self {
            max_data_points: 500,
            min_interval: None,
            datasource: None,
        }
    }
}

impl QueryRunnerOptions {
    /// Set the point budget.
    #[must_use]
    pub fn with_max_data_points(mut self, max_data_points: u32) -> Self {
        self.max_data_points = max_data_points;
        self
    }

    /// Set the interval floor.
    #[must_use]
    pub fn with_min_interval(mut self, min_interval: impl Into<String>) -> Self {
        self.min_interval = Some(min_interval.into());
        self
    }

    /// Set the datasource.
    #[must_use]
    pub fn with_datasource(mut self, datasource: impl Into<String>) -> Self {
        self.datasource = Some(datasource.into());
        self
    }
}

/// Build a request for `queries` as seen from `object`.
pub(crate) fn build_request(
    object: &SceneObject,
    request_id: String,
    queries: &[Value],
    datasource: Option<String>,
    max_data_points: u32,
    min_interval: Option<&str>,
) -> SceneResult<QueryRequest> {
    let range = get_time_range(object)
        .ok_or_else(|| SceneError::Configuration(format!("{} has no time range", object.key())))?
        .value();
    let interval = calculate_interval(range, max_data_points, min_interval);
    let mut scoped_vars = ScopedVars::new();
    scoped_vars.insert(
        "__interval".into(),
        ScopedVar::new(interval.interval.clone()),
    );
    scoped_vars.insert(
        "__interval_ms".into(),
        ScopedVar::new(interval.interval_ms.to_string()),
    );
    let options = InterpolateOptions::default().with_scoped_vars(scoped_vars.clone());
    let queries = queries
        .iter()
        .map(|query| interpolate_json(object, query, &options).unwrap_or_else(|_| query.clone()))
        .collect();
    let datasource = datasource.map(|ds| interpolate(object, &ds, None, None));
    Ok(QueryRequest {
        request_id,
        queries,
        datasource,
        range,
        interval: interval.interval,
        interval_ms: interval.interval_ms,
        max_data_points,
        scoped_vars,
    })
}

/// One in-flight request: its sink and the provider's subscription.
#[derive(Default)]
pub(crate) struct InFlight {
    current: RefCell<Option<(ResultSink, Subscription)>>,
}

impl InFlight {
    /// Close and drop the current request. Returns whether there was one.
    pub(crate) fn cancel(&self) -> bool {
        let current = self.current.borrow_mut().take();
        match current {
            Some((sink, subscription)) => {
                sink.close();
                drop(subscription);
                true
            }
            None => false,
        }
    }

    /// Dispatch `request` to `provider`, replacing any previous request.
    pub(crate) fn start(
        &self,
        provider: &Rc<dyn QueryProvider>,
        request: Rc<QueryRequest>,
        on_data: impl Fn(PanelData) + 'static,
    ) {
        self.cancel();
        let sink = ResultSink::new(on_data);
        let subscription = provider.query(request, sink.clone());
        if sink.is_closed() {
            return;
        }
        *self.current.borrow_mut() = Some((sink, subscription));
    }
}

struct RunnerCore {
    me: WeakSceneObject,
    results: Subject<ResultEnvelope>,
    data: RefCell<Option<Rc<PanelData>>>,
    in_flight: InFlight,
    last_request: RefCell<Option<Rc<QueryRequest>>>,
    own_annotations: RefCell<Option<Rc<[DataFrame]>>>,
    layer_annotations: RefCell<Option<Rc<[DataFrame]>>>,
    merger: DataLayerMerger,
    dependencies: Rc<VariableDependencyConfig>,
    seq: Cell<u64>,
    runs: Cell<u64>,
}

impl RunnerCore {
    fn publish(&self, data: PanelData) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let data = Rc::new(data);
        *self.data.borrow_mut() = Some(Rc::clone(&data));
        self.results.next(ResultEnvelope::new(&me, data));
        me.force_render();
    }

    /// Annotations the queries returned, followed by those of ancestor layers.
    fn with_layer_annotations(&self, mut data: PanelData) -> PanelData {
        let own = self.own_annotations.borrow().clone();
        let layers = self.layer_annotations.borrow().clone();
        data.annotations = match (own, layers) {
            (Some(own), Some(layers)) if !own.is_empty() => {
                Some(own.iter().chain(layers.iter()).cloned().collect())
            }
            (own, None) => own,
            (_, layers) => layers,
        };
        data
    }

    fn next_request(&self, me: &SceneObject) -> SceneResult<QueryRequest> {
        let state = me.state();
        let queries = match state.get("queries") {
            Some(Value::Array(items)) => items.clone(),
            Some(other) => vec![other.clone()],
            None => Vec::new(),
        };
        let max_data_points = state
            .get_i64("maxDataPoints")
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(500);
        let seq = self.seq.get() + 1;
        self.seq.set(seq);
        build_request(
            me,
            format!("{}-{seq}", me.key()),
            &queries,
            state.get_str("datasource").map(str::to_owned),
            max_data_points,
            state.get_str("minInterval"),
        )
    }

    fn run_queries(self: &Rc<Self>) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        if self.dependencies.has_dependency_in_loading_state(&me) {
            debug!(key = %me.key(), "variables loading, query deferred");
            return;
        }
        let request = match self.next_request(&me) {
            Ok(request) => Rc::new(request),
            Err(err) => {
                error!(key = %me.key(), error = %err, "cannot build query request");
                return;
            }
        };
        let Some(provider) = QueryProviders::find(&me, request.datasource.as_deref()) else {
            error!(
                key = %me.key(),
                datasource = ?request.datasource,
                "no query provider registered"
            );
            self.in_flight.cancel();
            let message = match &request.datasource {
                Some(uid) => format!("no query provider for datasource {uid}"),
                None => "no default query provider".to_owned(),
            };
            let mut data = PanelData::empty(LoadingState::Error, request.range);
            data.errors.push(QueryError::new(message));
            data.request = Some(Rc::clone(&request));
            *self.last_request.borrow_mut() = Some(request);
            self.publish(data);
            return;
        };

        debug!(
            key = %me.key(),
            request_id = %request.request_id,
            queries = request.queries.len(),
            interval = %request.interval,
            "running queries"
        );
        self.runs.set(self.runs.get() + 1);
        *self.last_request.borrow_mut() = Some(Rc::clone(&request));

        let previous = self.data.borrow().clone();
        let loading = PanelData {
            state: LoadingState::Loading,
            series: previous
                .as_ref()
                .map_or_else(|| Rc::from(Vec::new()), |d| Rc::clone(&d.series)),
            annotations: previous.as_ref().and_then(|d| d.annotations.clone()),
            errors: Vec::new(),
            time_range: request.range,
            request: Some(Rc::clone(&request)),
        };
        self.publish(loading);

        let core = Rc::downgrade(self);
        let req = Rc::clone(&request);
        self.in_flight.start(&provider, request, move |mut data| {
            let Some(core) = core.upgrade() else {
                return;
            };
            trace!(request_id = %req.request_id, state = ?data.state, "query result");
            data.request = Some(Rc::clone(&req));
            data.time_range = req.range;
            *core.own_annotations.borrow_mut() = data.annotations.clone();
            let data = core.with_layer_annotations(data);
            core.publish(data);
        });
    }

    fn cancel_query(&self) {
        if !self.in_flight.cancel() {
            return;
        }
        let current = self.data.borrow().clone();
        if let Some(current) = current {
            if matches!(current.state, LoadingState::Loading | LoadingState::Streaming) {
                debug!("query cancelled");
                let mut done = (*current).clone();
                done.state = LoadingState::Done;
                self.publish(done);
            }
        }
    }

    fn needs_run(&self, me: &SceneObject) -> bool {
        let settled = self
            .data
            .borrow()
            .as_ref()
            .is_some_and(|d| !matches!(d.state, LoadingState::NotStarted | LoadingState::Loading));
        if !settled {
            return true;
        }
        let last = self.last_request.borrow().clone();
        let Some(last) = last else {
            return true;
        };
        // Compare without consuming a request id.
        let seq = self.seq.get();
        let next = self.next_request(me);
        self.seq.set(seq);
        next.map_or(true, |next| !next.same_target(&last))
    }

    fn on_layers(&self, envelopes: &[ResultEnvelope]) {
        let frames: Vec<DataFrame> = envelopes
            .iter()
            .filter_map(|e| e.data.annotations.as_deref())
            .flat_map(|a| a.iter().cloned())
            .collect();
        trace!(layers = envelopes.len(), frames = frames.len(), "layer annotations merged");
        *self.layer_annotations.borrow_mut() = Some(Rc::from(frames));
        let current = self.data.borrow().clone();
        if let Some(current) = current {
            let data = self.with_layer_annotations((*current).clone());
            self.publish(data);
        }
    }
}

impl SceneDataProvider for RunnerCore {
    fn data(&self) -> Option<Rc<PanelData>> {
        self.data.borrow().clone()
    }

    fn results(&self) -> Subject<ResultEnvelope> {
        self.results.clone()
    }

    fn run_queries(&self) {
        if let Some(runner) = self.me.upgrade().as_ref().and_then(SceneQueryRunner::from_object) {
            runner.run_queries();
        }
    }

    fn cancel_query(&self) {
        RunnerCore::cancel_query(self);
    }

    fn is_data_ready_to_display(&self) -> bool {
        !self.dependencies.is_waiting_for_variables()
    }
}

/// Data layer sets on the ancestors of `object`, nearest first.
fn ancestor_layer_sets(object: &SceneObject) -> Vec<SceneObject> {
    object
        .ancestors()
        .into_iter()
        .filter_map(|node| node.slot(Slot::Data))
        .filter(|data| !data.ptr_eq(object) && data.has_capability::<LayerSetCap>())
        .collect()
}

/// Issues queries for its subtree.
#[derive(Clone)]
pub struct SceneQueryRunner {
    object: SceneObject,
    core: Rc<RunnerCore>,
}

impl SceneQueryRunner {
    /// Runner for `queries` (a query object or an array of them).
    pub fn new(queries: Value, options: QueryRunnerOptions) -> Self {
        let queries = match queries {
            Value::Array(items) => Value::Array(items),
            single => json!([single]),
        };
        let mut state = StatePatch::new()
            .set("queries", queries)
            .set("maxDataPoints", options.max_data_points);
        if let Some(ds) = options.datasource {
            state.insert("datasource", ds);
        }
        if let Some(min) = options.min_interval {
            state.insert("minInterval", min);
        }
        let object = SceneObject::new("SceneQueryRunner", StateSnapshot::new().merged(state));

        let dependencies = VariableDependencyConfig::for_paths(["queries", "datasource", "minInterval"])
            .on_referenced_variable_value_changed(|object, variable| {
                if let Some(runner) = SceneQueryRunner::from_object(object) {
                    debug!(key = %object.key(), variable = %variable.name(), "referenced variable changed");
                    runner.run_queries();
                }
            })
            .on_variable_update_completed(|object| {
                if let Some(runner) = SceneQueryRunner::from_object(object) {
                    runner.run_queries();
                }
            })
            .attach_to(&object);

        let core = Rc::new(RunnerCore {
            me: object.downgrade(),
            results: Subject::replaying(),
            data: RefCell::new(None),
            in_flight: InFlight::default(),
            last_request: RefCell::new(None),
            own_annotations: RefCell::new(None),
            layer_annotations: RefCell::new(None),
            merger: DataLayerMerger::new(),
            dependencies,
            seq: Cell::new(0),
            runs: Cell::new(0),
        });
        object.attach(Rc::clone(&core));
        object.attach(Rc::new(DataProviderCap(core.clone())));
        object.add_activation_handler(Self::on_activate);
        Self { object, core }
    }

    fn on_activate(object: &SceneObject) -> SceneResult<Option<Cleanup>> {
        let Some(runner) = Self::from_object(object) else {
            return Ok(None);
        };
        let time_range = get_time_range(object).ok_or_else(|| {
            SceneError::Configuration(format!("{} has no time range", object.key()))
        })?;

        let weak = Rc::downgrade(&runner.core);
        object.add_subscription(time_range.subscribe_to_value(move |_| {
            if let Some(core) = weak.upgrade() {
                core.run_queries();
            }
        }));

        let layers = ancestor_layer_sets(object);
        let mut merged: Option<(MergedStream, Subscription)> = None;
        if !layers.is_empty() {
            let stream = runner.core.merger.get_merged_stream(&layers);
            let weak = Rc::downgrade(&runner.core);
            let subscription = stream.subscribe(move |envelopes| {
                if let Some(core) = weak.upgrade() {
                    core.on_layers(envelopes);
                }
            });
            merged = Some((stream, subscription));
        }

        if runner.core.needs_run(object) {
            runner.run_queries();
        } else {
            trace!(key = %object.key(), "request unchanged, keeping data");
        }

        let core = Rc::downgrade(&runner.core);
        Ok(Some(Box::new(move || {
            drop(merged);
            if let Some(core) = core.upgrade() {
                core.in_flight.cancel();
            }
        })))
    }

    /// Recover the runner view of a scene object.
    #[must_use]
    pub fn from_object(object: &SceneObject) -> Option<Self> {
        object.capability::<RunnerCore>().map(|core| Self {
            object: object.clone(),
            core,
        })
    }

    /// The underlying scene object.
    #[must_use]
    pub fn object(&self) -> &SceneObject {
        &self.object
    }

    /// Build and dispatch a request, cancelling the previous one.
    pub fn run_queries(&self) {
        self.core.run_queries();
    }

    /// Cancel the in-flight request; loading data settles as done.
    pub fn cancel_query(&self) {
        self.core.cancel_query();
    }

    /// Replace the queries and re-run when active.
    pub fn set_queries(&self, queries: Value) {
        self.object.set_state(StatePatch::new().set("queries", queries));
        if self.object.is_active() {
            self.run_queries();
        }
    }

    /// Latest data.
    #[must_use]
    pub fn data(&self) -> Option<Rc<PanelData>> {
        self.core.data.borrow().clone()
    }

    /// Result stream.
    #[must_use]
    pub fn results(&self) -> Subject<ResultEnvelope> {
        self.core.results.clone()
    }

    /// The last dispatched request.
    #[must_use]
    pub fn last_request(&self) -> Option<Rc<QueryRequest>> {
        self.core.last_request.borrow().clone()
    }

    /// How many requests reached a provider.
    #[must_use]
    pub fn query_runs(&self) -> u64 {
        self.core.runs.get()
    }

    /// Whether a request is in flight.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.core.in_flight.current.borrow().is_some()
    }
}

impl fmt::Debug for SceneQueryRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SceneQueryRunner")
            .field("key", &self.object.key())
            .field("runs", &self.core.runs.get())
            .finish()
    }
}
