//! Property-based invariant tests for state snapshots and activation.
//!
//! 1. `set_state` never mutates the previous snapshot.
//! 2. The current snapshot equals the previous one with the patch applied.
//! 3. Fields not named in a patch keep their identity.
//! 4. Any activate/deactivate sequence ends with zero live subscriptions and
//!    zero pending cleanups when the node is inactive.
//! 5. Every cleanup registered during an activation runs exactly once.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;

use proptest::prelude::*;
use scenes_core::{SceneObject, StatePatch, StateSnapshot};
use serde_json::{Value, json};

// ── Strategies ────────────────────────────────────────────────────────────

fn field_name() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["a", "b", "c", "d", "title", "width"]).prop_map(str::to_owned)
}

fn field_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(|n| json!(n)),
        "[a-z]{0,6}".prop_map(|s| json!(s)),
        any::<bool>().prop_map(|b| json!(b)),
    ]
}

fn patch_entries() -> impl Strategy<Value = Vec<(String, Option<Value>)>> {
    prop::collection::vec((field_name(), prop::option::of(field_value())), 0..8)
}

fn build_patch(entries: &[(String, Option<Value>)]) -> StatePatch {
    entries
        .iter()
        .fold(StatePatch::new(), |patch, (k, v)| match v {
            Some(v) => patch.set(k.clone(), v.clone()),
            None => patch.remove(k.clone()),
        })
}

#[derive(Debug, Clone)]
enum Op {
    Activate,
    Deactivate,
    Subscribe,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![Just(Op::Activate), Just(Op::Deactivate), Just(Op::Subscribe)]
}

proptest! {
    #[test]
    fn previous_snapshot_is_never_mutated(
        initial in prop::collection::btree_map(field_name(), field_value(), 0..6),
        entries in patch_entries(),
    ) {
        let map: serde_json::Map<String, Value> = initial.clone().into_iter().collect();
        let obj = SceneObject::new("Prop", StateSnapshot::from(map));
        let before = obj.state();
        let before_json = before.to_json();

        obj.set_state(build_patch(&entries));

        prop_assert_eq!(before.to_json(), before_json);

        let mut expected: BTreeMap<String, Value> = initial;
        for (k, v) in &entries {
            match v {
                Some(v) => { expected.insert(k.clone(), v.clone()); }
                None => { expected.remove(k); }
            }
        }
        let expected_json = Value::Object(expected.into_iter().collect());
        prop_assert_eq!(obj.state().to_json(), expected_json);

        let touched: Vec<&str> = entries.iter().map(|(k, _)| k.as_str()).collect();
        for key in before.keys() {
            if !touched.contains(&key) {
                prop_assert!(before.same_field(&obj.state(), key));
            }
        }
    }

    #[test]
    fn activation_is_symmetric(ops in prop::collection::vec(op(), 0..32)) {
        let obj = SceneObject::new("Prop", StateSnapshot::new());
        let source = SceneObject::new("Source", StateSnapshot::new());
        let registered = Rc::new(Cell::new(0u32));
        let released = Rc::new(Cell::new(0u32));

        let r = Rc::clone(&registered);
        let d = Rc::clone(&released);
        obj.add_activation_handler(move |_| {
            r.set(r.get() + 1);
            let d = Rc::clone(&d);
            Ok(Some(Box::new(move || d.set(d.get() + 1))))
        });

        for op in ops {
            match op {
                Op::Activate => obj.activate().unwrap(),
                Op::Deactivate => obj.deactivate(),
                Op::Subscribe => {
                    if obj.is_active() {
                        obj.add_subscription(source.subscribe_to_state(|_| {}));
                    }
                }
            }
        }
        obj.deactivate();

        prop_assert_eq!(obj.live_subscription_count(), 0);
        prop_assert_eq!(obj.pending_cleanup_count(), 0);
        prop_assert_eq!(source.listener_count(), 0);
        prop_assert_eq!(registered.get(), released.get());
        prop_assert_eq!(u64::from(registered.get()), obj.activation_count());
    }
}
