#![forbid(unsafe_code)]

//! Variable lookup through the scene tree.
//!
//! Lookup starts at the given object and walks toward the root, checking
//! each node's `$variables` slot. The nearest set that defines a name wins.

use std::collections::BTreeSet;

use scenes_core::{SceneObject, Slot};

use super::dependency::VariableDependencyConfig;
use super::set::SceneVariableSet;
use super::SceneVariable;

fn sets_from(object: &SceneObject) -> impl Iterator<Item = SceneVariableSet> {
    std::iter::once(object.clone())
        .chain(object.ancestors())
        .filter_map(|node| node.slot(Slot::Variables))
        .filter_map(|slot| SceneVariableSet::from_object(&slot))
}

/// The nearest variable named `name`, starting at `object`.
#[must_use]
pub fn lookup_variable(name: &str, object: &SceneObject) -> Option<SceneVariable> {
    sets_from(object).find_map(|set| set.get_by_name(name))
}

/// The nearest variable set, starting at `object`.
#[must_use]
pub fn nearest_variable_set(object: &SceneObject) -> Option<SceneVariableSet> {
    sets_from(object).next()
}

/// Every variable visible from `object`, nearest definition per name.
#[must_use]
pub fn visible_variables(object: &SceneObject) -> Vec<SceneVariable> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for set in sets_from(object) {
        for variable in set.variables() {
            if seen.insert(variable.name()) {
                out.push(variable);
            }
        }
    }
    out
}

/// The set a variable belongs to.
pub(crate) fn owning_set(variable: &SceneVariable) -> Option<SceneVariableSet> {
    variable
        .object()
        .parent()
        .and_then(|parent| SceneVariableSet::from_object(&parent))
}

/// Whether `object` references a variable that is still loading.
///
/// Objects without a dependency tracker never wait.
#[must_use]
pub fn has_variable_dependency_in_loading_state(object: &SceneObject) -> bool {
    object
        .capability::<VariableDependencyConfig>()
        .is_some_and(|dep| dep.has_dependency_in_loading_state(object))
}
