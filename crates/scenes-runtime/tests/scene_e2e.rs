//! Scene E2E tests.
//!
//! A dashboard-shaped tree: time range and variables on the root, a panel
//! with a query runner and a transformer, the URL kept in sync.
//!
//! ```sh
//! cargo test -p scenes-runtime --test scene_e2e
//! ```

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use scenes_core::{SceneObject, Slot, StateSnapshot, Subscription};
use scenes_runtime::data::{
    FilterByRefIdTransformation, FnQueryProvider, LimitTransformation, SceneDataTransformer,
};
use scenes_runtime::variables::CustomSource;
use scenes_runtime::{
    DataFrame, DataTransformation, Field, FixedClock, LoadingState, MemoryLocation, PanelData,
    QueryProviders, QueryRunnerOptions, SceneQueryRunner, SceneTimeRange, SceneVariable,
    SceneVariableSet, UrlSyncManager, UrlSyncOptions, UrlValue, VariableConfig,
    VariableDependencyConfig,
};
use serde_json::{Value, json};

const NOW: i64 = 1_700_000_000_000;

struct Dashboard {
    root: SceneObject,
    panel: SceneObject,
    region: SceneVariable,
    runner: SceneQueryRunner,
    exprs: Rc<RefCell<Vec<String>>>,
    referenced: Rc<Cell<u32>>,
}

/// Provider answering synchronously with one frame per query, named after
/// the query's `refId`, holding the query text.
fn echo_provider(exprs: Rc<RefCell<Vec<String>>>) -> FnQueryProvider {
    FnQueryProvider::new(move |request, sink| {
        let mut frames = Vec::new();
        for query in &request.queries {
            let expr = query["expr"].as_str().unwrap_or_default().to_owned();
            exprs.borrow_mut().push(expr.clone());
            let ref_id = query["refId"].as_str().unwrap_or("A");
            frames.push(
                DataFrame::new(ref_id)
                    .with_field(Field::new("expr", vec![Value::String(expr)]))
                    .with_field(Field::new("value", (0..5).map(|i| json!(i)).collect())),
            );
        }
        sink.next(PanelData::empty(LoadingState::Done, request.range).with_series(frames));
        Subscription::empty()
    })
}

fn dashboard() -> Dashboard {
    let root = SceneObject::new_with_key("dashboard", "Dashboard", StateSnapshot::new());
    let range = SceneTimeRange::with_clock("now-6h", "now", Rc::new(FixedClock::new(NOW)));
    root.set_slot(Slot::TimeRange, Some(range.object())).unwrap();

    let region = SceneVariable::new("region", CustomSource::new("us,eu"), VariableConfig::default());
    let set = SceneVariableSet::new(vec![region.clone()]);
    root.set_slot(Slot::Variables, Some(set.object())).unwrap();

    let exprs = Rc::new(RefCell::new(Vec::new()));
    QueryProviders::new()
        .with_default(echo_provider(Rc::clone(&exprs)))
        .attach_to(&root);

    let panel = SceneObject::new_with_key(
        "panel-1",
        "Panel",
        StateSnapshot::from_json(json!({ "title": "Requests in $region" })),
    );
    let referenced = Rc::new(Cell::new(0));
    let r = Rc::clone(&referenced);
    VariableDependencyConfig::for_paths(["title"])
        .on_referenced_variable_value_changed(move |_, variable| {
            assert_eq!(variable.name(), "region");
            r.set(r.get() + 1);
        })
        .attach_to(&panel);
    root.add_child(&panel).unwrap();

    let runner = SceneQueryRunner::new(
        json!([
            {"refId": "A", "expr": "sum(rate(http_requests{region=\"$region\"}[$__interval]))"},
            {"refId": "B", "expr": "up{region=\"$region\"}"},
        ]),
        QueryRunnerOptions::default().with_max_data_points(360),
    );
    panel.set_slot(Slot::Data, Some(runner.object())).unwrap();

    Dashboard {
        root,
        panel,
        region,
        runner,
        exprs,
        referenced,
    }
}

#[test]
fn region_change_requeries_and_updates_url() {
    let d = dashboard();
    let location = Rc::new(MemoryLocation::new(""));
    let manager = UrlSyncManager::new(location.clone(), UrlSyncOptions::default());

    d.root.activate().unwrap();
    manager.init_sync(&d.root);
    d.panel.activate().unwrap();

    assert_eq!(d.region.value().first(), Some("us"));
    assert_eq!(
        d.exprs.borrow().as_slice(),
        [
            "sum(rate(http_requests{region=\"us\"}[1m]))",
            "up{region=\"us\"}"
        ]
    );

    d.region.change_value_to("eu", None);

    assert_eq!(d.referenced.get(), 1);
    assert_eq!(d.runner.query_runs(), 2);
    let exprs = d.exprs.borrow();
    assert_eq!(exprs[exprs.len() - 1], "up{region=\"eu\"}");
    assert_eq!(
        location.params().get("var-region"),
        Some(UrlValue::Single("eu".into()))
    );
    assert!(location.history().iter().all(|entry| entry.replaced));

    let data = d.runner.data().unwrap();
    assert_eq!(data.state, LoadingState::Done);
    assert_eq!(data.series.len(), 2);
}

#[test]
fn url_value_wins_over_default_selection() {
    let d = dashboard();
    let location = Rc::new(MemoryLocation::new("var-region=eu"));
    let manager = UrlSyncManager::new(location.clone(), UrlSyncOptions::default());

    manager.init_sync(&d.root);
    d.root.activate().unwrap();
    d.panel.activate().unwrap();

    assert_eq!(d.region.value().first(), Some("eu"));
    assert_eq!(d.exprs.borrow()[1], "up{region=\"eu\"}");
    assert!(location.history().is_empty());
}

#[test]
fn browser_navigation_changes_variable_and_requeries() {
    let d = dashboard();
    let location = Rc::new(MemoryLocation::new(""));
    let manager = UrlSyncManager::new(location.clone(), UrlSyncOptions::default());
    d.root.activate().unwrap();
    manager.init_sync(&d.root);
    d.panel.activate().unwrap();

    location.navigate("var-region=eu");
    manager.handle_new_location();

    assert_eq!(d.region.value().first(), Some("eu"));
    assert_eq!(d.runner.query_runs(), 2);
    assert_eq!(d.referenced.get(), 1);
}

#[test]
fn transformer_follows_runner() {
    let d = dashboard();
    let steps: Vec<Rc<dyn DataTransformation>> = vec![
        Rc::new(FilterByRefIdTransformation::new(["B"])),
        Rc::new(LimitTransformation { limit: 2 }),
    ];
    let transformer = SceneDataTransformer::new(steps);
    d.panel.set_slot(Slot::Data, Some(transformer.object())).unwrap();
    transformer.set_source(d.runner.object()).unwrap();

    d.root.activate().unwrap();
    d.panel.activate().unwrap();
    assert!(d.runner.object().is_active());

    let out = transformer.data().unwrap();
    assert_eq!(out.state, LoadingState::Done);
    assert_eq!(out.series.len(), 1);
    assert_eq!(out.series[0].ref_id.as_deref(), Some("B"));
    assert_eq!(out.series[0].len(), 2);

    let runs = transformer.transform_runs();
    d.region.change_value_to("eu", None);
    assert!(transformer.transform_runs() > runs);
    let out = transformer.data().unwrap();
    assert_eq!(
        out.series[0].fields[0].values[0],
        json!("up{region=\"eu\"}")
    );

    d.panel.deactivate();
    assert!(!transformer.object().is_active());
    assert!(!d.runner.object().is_active());
}

#[test]
fn deactivated_panel_ignores_variable_changes() {
    let d = dashboard();
    d.root.activate().unwrap();
    d.panel.activate().unwrap();
    d.panel.deactivate();

    d.region.change_value_to("eu", None);
    assert_eq!(d.runner.query_runs(), 1);
    assert_eq!(d.referenced.get(), 0);
}
