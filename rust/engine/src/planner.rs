//! Dependency planner.
//!
//! Turns the check catalog into an ordered sequence of *levels*, sets
//! of checks whose dependencies are satisfied by earlier levels, via
//! Kahn's layering. `A|B` OR-tokens contribute edges from every
//! alternative; the runtime later enforces that at least one
//! alternative actually succeeded. Planning is deterministic for a
//! fixed input: all containers are insertion-ordered.

use indexmap::{IndexMap, IndexSet};

use crate::error::{EngineError, EngineResult};
use crate::spec::CheckSpec;

/// The layered topological order produced by planning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    /// Levels in execution order; checks within a level have no edges
    /// between them and may run concurrently.
    pub levels: Vec<Vec<String>>,
}

impl ExecutionPlan {
    /// Total number of planned checks across all levels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    /// Whether the plan contains no checks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

/// Build the execution plan for a set of checks.
///
/// Only edges between checks present in `subset` are considered, which
/// lets the wave planner reuse this for sub-graphs built from forward
/// run requests. Dependencies outside the subset are assumed already
/// satisfied (the runtime re-verifies against the journal).
///
/// # Errors
///
/// - [`EngineError::UnknownCheck`] when a dependency names a check that
///   exists in neither the subset nor the full catalog.
/// - [`EngineError::PlanningCycle`] when layering cannot consume every
///   check; the error names the cycle members.
pub fn plan(
    specs: &IndexMap<String, CheckSpec>,
    subset: &IndexSet<String>,
) -> EngineResult<ExecutionPlan> {
    // Edges and in-degrees over the subset only.
    let mut in_degree: IndexMap<&str, usize> = IndexMap::new();
    let mut dependents: IndexMap<&str, Vec<&str>> = IndexMap::new();

    for id in subset {
        let spec = specs.get(id).ok_or_else(|| EngineError::UnknownCheck {
            check_id: id.clone(),
        })?;
        in_degree.entry(id.as_str()).or_insert(0);
        for dep in spec.dependency_ids() {
            if !specs.contains_key(dep) {
                return Err(EngineError::UnknownCheck {
                    check_id: dep.to_string(),
                });
            }
            if !subset.contains(dep) {
                continue;
            }
            // Dedup parallel edges (e.g. `a` and `a|b` on one check) so
            // the in-degree decrement stays balanced.
            let entry = dependents.entry(dep).or_default();
            if !entry.contains(&id.as_str()) {
                entry.push(id.as_str());
                *in_degree.entry(id.as_str()).or_insert(0) += 1;
            }
        }
    }

    // Kahn's layering: emit the zero-in-degree set as one level, then
    // decrement its dependents.
    let mut levels: Vec<Vec<String>> = Vec::new();
    let mut remaining = in_degree.len();

    while remaining > 0 {
        let ready: Vec<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();

        if ready.is_empty() {
            let cycle: Vec<String> = in_degree
                .iter()
                .filter(|(_, degree)| **degree > 0)
                .map(|(id, _)| (*id).to_string())
                .collect();
            return Err(EngineError::PlanningCycle { nodes: cycle });
        }

        for id in &ready {
            // shift_remove keeps the remaining entries in catalog
            // order, which is what makes level order deterministic.
            in_degree.shift_remove(*id);
            if let Some(deps) = dependents.get(*id) {
                for dependent in deps {
                    if let Some(degree) = in_degree.get_mut(*dependent) {
                        *degree -= 1;
                    }
                }
            }
        }

        remaining -= ready.len();
        levels.push(ready.into_iter().map(String::from).collect());
    }

    Ok(ExecutionPlan { levels })
}

/// Plan the full catalog.
///
/// # Errors
///
/// Same as [`plan`].
pub fn plan_all(specs: &IndexMap<String, CheckSpec>) -> EngineResult<ExecutionPlan> {
    let subset: IndexSet<String> = specs.keys().cloned().collect();
    plan(specs, &subset)
}

/// The transitive dependency closure (ancestors) of each check.
///
/// Used by the routing decider to validate that `goto` targets are
/// true ancestors, and by the wave planner to pull dependencies into a
/// forward-run sub-graph.
#[must_use]
pub fn ancestors(specs: &IndexMap<String, CheckSpec>) -> IndexMap<String, IndexSet<String>> {
    let mut closure: IndexMap<String, IndexSet<String>> = IndexMap::new();

    for id in specs.keys() {
        let mut seen: IndexSet<String> = IndexSet::new();
        let mut stack: Vec<&str> = specs
            .get(id)
            .map(|spec| spec.dependency_ids().collect())
            .unwrap_or_default();
        while let Some(dep) = stack.pop() {
            if !seen.insert(dep.to_string()) {
                continue;
            }
            if let Some(spec) = specs.get(dep) {
                stack.extend(spec.dependency_ids());
            }
        }
        closure.insert(id.clone(), seen);
    }

    closure
}

/// The transitive dependents (descendants) of a check, in catalog order.
#[must_use]
pub fn descendants(specs: &IndexMap<String, CheckSpec>, root: &str) -> IndexSet<String> {
    let mut result: IndexSet<String> = IndexSet::new();
    let mut changed = true;
    // Fixed-point sweep in catalog order keeps the result deterministic
    // without needing a reverse adjacency map.
    while changed {
        changed = false;
        for (id, spec) in specs {
            if result.contains(id) {
                continue;
            }
            let depends_on_root = spec
                .dependency_ids()
                .any(|dep| dep == root || result.contains(dep));
            if depends_on_root {
                result.insert(id.clone());
                changed = true;
            }
        }
    }
    result
}
