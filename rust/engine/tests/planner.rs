//! Tests for dependency planning: layering, OR-token expansion, cycle
//! detection, and the transitive closures used by routing.

mod common;

use indexmap::IndexSet;
use serde_json::json;

use proctor_engine::error::EngineError;
use proctor_engine::planner::{ancestors, descendants, plan, plan_all};
use proctor_engine::spec::CheckSpec;
use proctor_engine::types::CheckType;

use common::catalog;

fn noop(id: &str) -> CheckSpec {
    CheckSpec::new(id, CheckType::Noop)
}

#[test]
fn single_check_plans_one_level() {
    let checks = catalog(vec![noop("only")]);
    let plan = plan_all(&checks).expect("plans");
    assert_eq!(plan.levels, vec![vec!["only".to_string()]]);
}

#[test]
fn diamond_plans_three_levels() {
    let checks = catalog(vec![
        noop("a"),
        noop("b").with_depends_on(&["a"]),
        noop("c").with_depends_on(&["a"]),
        noop("d").with_depends_on(&["b", "c"]),
    ]);
    let plan = plan_all(&checks).expect("plans");
    assert_eq!(
        plan.levels,
        vec![
            vec!["a".to_string()],
            vec!["b".to_string(), "c".to_string()],
            vec!["d".to_string()],
        ]
    );
    assert_eq!(plan.len(), 4);
}

#[test]
fn or_token_adds_edges_from_all_alternatives() {
    let checks = catalog(vec![
        noop("a"),
        noop("b"),
        noop("c").with_depends_on(&["a|b"]),
    ]);
    let plan = plan_all(&checks).expect("plans");
    // c must come after both alternatives.
    assert_eq!(
        plan.levels,
        vec![
            vec!["a".to_string(), "b".to_string()],
            vec!["c".to_string()],
        ]
    );
}

#[test]
fn duplicate_edges_from_overlapping_tokens_stay_balanced() {
    // `a` appears both as a plain token and inside an OR-group.
    let checks = catalog(vec![
        noop("a"),
        noop("b"),
        noop("c").with_depends_on(&["a", "a|b"]),
    ]);
    let plan = plan_all(&checks).expect("plans");
    assert_eq!(plan.levels.len(), 2);
    assert_eq!(plan.levels[1], vec!["c".to_string()]);
}

#[test]
fn cycle_is_detected_and_named() {
    let checks = catalog(vec![
        noop("a").with_depends_on(&["b"]),
        noop("b").with_depends_on(&["a"]),
        noop("free"),
    ]);
    let error = plan_all(&checks).expect_err("cycle");
    match error {
        EngineError::PlanningCycle { nodes } => {
            assert!(nodes.contains(&"a".to_string()));
            assert!(nodes.contains(&"b".to_string()));
            assert!(!nodes.contains(&"free".to_string()));
        }
        other => panic!("expected PlanningCycle, got {other:?}"),
    }
}

#[test]
fn unknown_dependency_is_rejected() {
    let checks = catalog(vec![noop("a").with_depends_on(&["ghost"])]);
    let error = plan_all(&checks).expect_err("unknown");
    assert!(matches!(error, EngineError::UnknownCheck { check_id } if check_id == "ghost"));
}

#[test]
fn planning_is_deterministic_for_fixed_input() {
    let checks = catalog(vec![
        noop("z"),
        noop("m").with_depends_on(&["z"]),
        noop("a").with_depends_on(&["z"]),
    ]);
    let first = plan_all(&checks).expect("plans");
    let second = plan_all(&checks).expect("plans");
    assert_eq!(first, second);
    // Level order follows catalog insertion order, not alphabetical.
    assert_eq!(first.levels[1], vec!["m".to_string(), "a".to_string()]);
}

#[test]
fn subset_planning_ignores_outside_edges() {
    let checks = catalog(vec![
        noop("base"),
        noop("mid").with_depends_on(&["base"]),
        noop("top").with_depends_on(&["mid"]),
    ]);
    // Planning {mid, top} treats base as already satisfied.
    let subset: IndexSet<String> = ["mid", "top"].iter().map(|s| (*s).to_string()).collect();
    let plan = plan(&checks, &subset).expect("plans");
    assert_eq!(
        plan.levels,
        vec![vec!["mid".to_string()], vec!["top".to_string()]]
    );
}

#[test]
fn ancestors_are_transitive() {
    let checks = catalog(vec![
        noop("a"),
        noop("b").with_depends_on(&["a"]),
        noop("c").with_depends_on(&["b"]),
    ]);
    let closure = ancestors(&checks);
    let c_ancestors = closure.get("c").expect("c closure");
    assert!(c_ancestors.contains("a"));
    assert!(c_ancestors.contains("b"));
    assert!(closure.get("a").expect("a closure").is_empty());
}

#[test]
fn descendants_are_transitive_and_cover_or_groups() {
    let checks = catalog(vec![
        noop("root"),
        noop("left").with_depends_on(&["root"]),
        noop("right"),
        noop("join").with_depends_on(&["left|right"]),
    ]);
    let down = descendants(&checks, "root");
    assert!(down.contains("left"));
    assert!(down.contains("join"));
    assert!(!down.contains("right"));
}

#[test]
fn provider_config_does_not_affect_planning() {
    let checks = catalog(vec![
        noop("a").with_config(json!({"anything": true})),
        noop("b").with_depends_on(&["a"]),
    ]);
    let plan = plan_all(&checks).expect("plans");
    assert_eq!(plan.levels.len(), 2);
}
