#![forbid(unsafe_code)]

//! Unique URL keys for objects sharing a parameter name.
//!
//! Each base key owns a list of slots. Slot `0` maps to `key`, slot `i` to
//! `key-{i+1}`. An object keeps its slot for as long as it stays live, so
//! removing one claimant never renames the others.
//!
//! A slot is free when its object was dropped, is no longer reachable from
//! the root, or was activated before and is now inactive. Objects that were
//! never activated count as live, so keys can be assigned while a scene is
//! still being built.

use std::cell::RefCell;
use std::collections::HashMap;

use scenes_core::{SceneObject, WeakSceneObject};
use tracing::trace;

/// Assigns `key`, `key-2`, `key-3`, ... to competing objects.
#[derive(Debug, Default)]
pub struct UniqueUrlKeyMapper {
    slots: RefCell<HashMap<String, Vec<WeakSceneObject>>>,
}

fn slot_name(key: &str, index: usize) -> String {
    if index == 0 {
        key.to_owned()
    } else {
        format!("{key}-{}", index + 1)
    }
}

fn is_live(claimant: &WeakSceneObject, root: &SceneObject) -> bool {
    claimant.upgrade().is_some_and(|object| {
        object.is_reachable_from(root) && (object.is_active() || object.activation_count() == 0)
    })
}

impl UniqueUrlKeyMapper {
    /// Empty mapper.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The key `object` uses for parameter `key` in the scene under `root`.
    pub fn get_unique_key(&self, key: &str, object: &SceneObject, root: &SceneObject) -> String {
        let mut slots = self.slots.borrow_mut();
        let claimants = slots.entry(key.to_owned()).or_default();

        if let Some(index) = claimants.iter().position(|c| c.is(object)) {
            return slot_name(key, index);
        }

        let index = match claimants.iter().position(|c| !is_live(c, root)) {
            Some(free) => {
                claimants[free] = object.downgrade();
                free
            }
            None => {
                claimants.push(object.downgrade());
                claimants.len() - 1
            }
        };
        let unique = slot_name(key, index);
        trace!(key, unique = %unique, object = %object.key(), "url key assigned");
        unique
    }

    /// Forget every assignment.
    pub fn clear(&self) {
        self.slots.borrow_mut().clear();
    }
}
