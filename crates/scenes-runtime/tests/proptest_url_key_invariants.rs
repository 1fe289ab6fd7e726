//! Property-based invariant tests for URL key uniquing and query strings.
//!
//! 1. Live claimants of one base key always hold pairwise distinct keys.
//! 2. A claimant keeps its key while it stays live, whatever happens to
//!    the others.
//! 3. Serialized parameters parse back to the same keys and values.

use std::collections::{BTreeMap, BTreeSet};

use proptest::prelude::*;
use scenes_core::{SceneObject, StateSnapshot};
use scenes_runtime::url_sync::UniqueUrlKeyMapper;
use scenes_runtime::{QueryParams, UrlValue};

#[derive(Debug, Clone)]
enum Op {
    Add,
    Remove(usize),
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            2 => Just(Op::Add),
            1 => any::<usize>().prop_map(Op::Remove),
        ],
        1..24,
    )
}

proptest! {
    #[test]
    fn live_keys_are_distinct_and_stable(ops in ops()) {
        let root = SceneObject::new("Root", StateSnapshot::new());
        let mapper = UniqueUrlKeyMapper::new();
        let mut live: Vec<(SceneObject, String)> = Vec::new();

        for op in ops {
            match op {
                Op::Add => {
                    let panel = SceneObject::new("Panel", StateSnapshot::new());
                    root.add_child(&panel).unwrap();
                    let key = mapper.get_unique_key("query", &panel, &root);
                    live.push((panel, key));
                }
                Op::Remove(i) => {
                    if !live.is_empty() {
                        let (panel, _) = live.remove(i % live.len());
                        root.remove_child(&panel).unwrap();
                    }
                }
            }

            let mut seen = BTreeSet::new();
            for (panel, key) in &live {
                let now = mapper.get_unique_key("query", panel, &root);
                prop_assert_eq!(&now, key);
                prop_assert!(seen.insert(now), "duplicate key {key}");
            }
        }
    }

    #[test]
    fn first_claimants_get_sequential_keys(n in 1usize..8) {
        let root = SceneObject::new("Root", StateSnapshot::new());
        let mapper = UniqueUrlKeyMapper::new();
        for i in 0..n {
            let panel = SceneObject::new("Panel", StateSnapshot::new());
            root.add_child(&panel).unwrap();
            let expected = if i == 0 { "var".to_owned() } else { format!("var-{}", i + 1) };
            prop_assert_eq!(mapper.get_unique_key("var", &panel, &root), expected);
        }
    }

    #[test]
    fn query_string_parses_back(
        entries in prop::collection::btree_map(
            "[a-z][a-z0-9-]{0,6}",
            prop::collection::vec("[ -~]{0,10}", 1..3),
            0..5,
        ),
    ) {
        let mut params = QueryParams::new();
        for (key, values) in &entries {
            let value = if values.len() == 1 {
                UrlValue::Single(values[0].clone())
            } else {
                UrlValue::Multi(values.clone())
            };
            params.set(key, Some(&value));
        }
        let parsed = QueryParams::parse(&params.to_query_string());
        let back: BTreeMap<String, Vec<String>> = parsed
            .keys()
            .map(|k| (k.to_owned(), parsed.get(k).map(|v| v.as_list()).unwrap_or_default()))
            .collect();
        prop_assert_eq!(back, entries);
    }
}
