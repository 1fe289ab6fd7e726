//! Dashboard E2E tests through the public facade.
//!
//! Builds a complete scene with the prelude: time range, variables, an
//! annotation layer, a panel whose runner feeds a transformer, and URL sync.
//!
//! ```sh
//! cargo test -p scenes --test dashboard_e2e
//! ```

use std::cell::RefCell;
use std::rc::Rc;

use scenes::prelude::*;
use scenes::{
    AnnotationsDataLayer, CustomTransformation, DataFrame, FixedClock, FnQueryProvider,
    MemoryLocation, QueryError, SceneDataLayerSet, TransformError, UrlValue,
};
use tracing::Level;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .try_init();
}

/// Answers synchronously; queries with `"fail": true` produce an error.
fn provider(log: Rc<RefCell<Vec<Value>>>) -> FnQueryProvider {
    FnQueryProvider::new(move |request, sink| {
        log.borrow_mut().extend(request.queries.iter().cloned());
        if request.queries.iter().any(|q| q["fail"] == json!(true)) {
            sink.next(
                PanelData::empty(LoadingState::Error, request.range)
                    .with_error(QueryError::new("backend down").with_ref_id("A")),
            );
            return Subscription::empty();
        }
        let frames = request
            .queries
            .iter()
            .map(|q| DataFrame::new(q["refId"].as_str().unwrap_or("A")))
            .collect();
        sink.next(PanelData::empty(LoadingState::Done, request.range).with_series(frames));
        Subscription::empty()
    })
}

struct Scene {
    root: SceneObject,
    panel: SceneObject,
    env: SceneVariable,
    runner: SceneQueryRunner,
    transformer: SceneDataTransformer,
    log: Rc<RefCell<Vec<Value>>>,
}

fn build(steps: Vec<Rc<dyn DataTransformation>>) -> Scene {
    let root = SceneObject::new_with_key("dash", "Dashboard", StateSnapshot::new());
    let range = SceneTimeRange::with_clock("now-1h", "now", Rc::new(FixedClock::new(1_700_000_000_000)));
    root.set_slot(Slot::TimeRange, Some(range.object())).unwrap();

    let env = SceneVariable::new("env", CustomSource::new("prod,staging"), VariableConfig::default());
    let vars = SceneVariableSet::new(vec![env.clone()]);
    root.set_slot(Slot::Variables, Some(vars.object())).unwrap();

    let layers = SceneDataLayerSet::new(vec![AnnotationsDataLayer::new(
        "deploys",
        json!({"refId": "deploys", "expr": "deploys{env=\"$env\"}"}),
    )]);
    root.set_slot(Slot::Data, Some(layers.object())).unwrap();

    let log = Rc::new(RefCell::new(Vec::new()));
    QueryProviders::new()
        .with_default(provider(Rc::clone(&log)))
        .attach_to(&root);

    let panel = SceneObject::new_with_key("panel", "Panel", StateSnapshot::new());
    root.add_child(&panel).unwrap();
    let runner = SceneQueryRunner::new(
        json!({"refId": "A", "expr": "cpu{env=\"$env\"}"}),
        QueryRunnerOptions::default(),
    );
    let transformer = SceneDataTransformer::new(steps);
    panel.set_slot(Slot::Data, Some(transformer.object())).unwrap();
    transformer.set_source(runner.object()).unwrap();

    Scene {
        root,
        panel,
        env,
        runner,
        transformer,
        log,
    }
}

#[test]
fn full_dashboard_flows_end_to_end() {
    init_tracing();
    let scene = build(Vec::new());
    let location = Rc::new(MemoryLocation::new(""));
    let manager = UrlSyncManager::new(location.clone(), UrlSyncOptions::default());

    scene.root.activate().unwrap();
    manager.init_sync(&scene.root);
    scene.panel.activate().unwrap();

    let out = scene.transformer.data().unwrap();
    assert_eq!(out.state, LoadingState::Done);
    assert_eq!(out.series[0].ref_id.as_deref(), Some("A"));
    let annotations = out.annotations.as_ref().unwrap();
    assert_eq!(annotations[0].ref_id.as_deref(), Some("deploys"));

    scene.env.change_value_to("staging", None);
    let log = scene.log.borrow();
    assert!(log.iter().any(|q| q["expr"] == json!("cpu{env=\"staging\"}")));
    assert!(log.iter().any(|q| q["expr"] == json!("deploys{env=\"staging\"}")));
    assert_eq!(
        location.params().get("var-env"),
        Some(UrlValue::Single("staging".to_owned()))
    );
    assert_eq!(scene.runner.query_runs(), 2);
}

#[test]
fn query_errors_reach_consumers_as_data() {
    init_tracing();
    let scene = build(Vec::new());
    scene.root.activate().unwrap();
    scene.panel.activate().unwrap();

    scene
        .runner
        .set_queries(json!([{"refId": "A", "fail": true}]));
    let out = scene.transformer.data().unwrap();
    assert_eq!(out.state, LoadingState::Error);
    assert_eq!(out.error().unwrap().to_string(), "A: backend down");
}

#[test]
fn transformation_failure_keeps_source_series() {
    init_tracing();
    let steps: Vec<Rc<dyn DataTransformation>> = vec![Rc::new(CustomTransformation::new(
        "strict",
        |frames| {
            if frames.len() > 1 {
                Err(TransformError::new("strict", "too many frames"))
            } else {
                Ok(frames)
            }
        },
    ))];
    let scene = build(steps);
    scene.root.activate().unwrap();
    scene.panel.activate().unwrap();
    assert_eq!(scene.transformer.data().unwrap().state, LoadingState::Done);

    scene.runner.set_queries(json!([{"refId": "A"}, {"refId": "B"}]));
    let out = scene.transformer.data().unwrap();
    assert_eq!(out.state, LoadingState::Error);
    assert_eq!(out.series.len(), 2);
    assert_eq!(
        out.error().unwrap().message,
        "transformation strict failed: too many frames"
    );
}

#[test]
fn teardown_releases_everything() {
    let scene = build(Vec::new());
    scene.root.activate().unwrap();
    scene.panel.activate().unwrap();
    scene.panel.deactivate();
    scene.root.deactivate();

    let mut active = Vec::new();
    scene.root.for_each_descendant(|node| {
        if node.is_active() {
            active.push(node.key().to_owned());
        }
    });
    assert!(active.is_empty(), "still active: {active:?}");
    assert_eq!(scene.root.live_subscription_count(), 0);
}
