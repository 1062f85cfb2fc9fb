//! Tests for nested workflow runs: child execution, event bubbling,
//! and the depth limit.

mod common;

use serde_json::json;

use proctor_engine::engine::run;
use proctor_engine::events::EventPayload;
use proctor_engine::spec::CheckSpec;
use proctor_engine::types::{CheckStatus, CheckType, SkipReason};

use common::{catalog, collecting_config, run_options};

fn nested_workflow(id: &str) -> CheckSpec {
    CheckSpec::new(id, CheckType::Workflow).with_config(json!({
        "checks": {
            "inner_a": { "type": "command", "exec": "echo inner" },
            "inner_b": { "type": "noop", "depends_on": ["inner_a"] },
        }
    }))
}

#[tokio::test]
async fn nested_workflow_runs_and_reports_child_statistics() {
    let checks = catalog(vec![nested_workflow("wf")]);
    let (config, _emitter) = collecting_config();

    let result = run(checks, config, run_options()).await.expect("runs");

    let group = result.results.get("wf").expect("group");
    let wf = &group.checks[0];
    assert_eq!(wf.status, CheckStatus::Success);

    // The child run's result document is the check's output.
    let content = wf.content.as_ref().expect("content");
    let child_stats = content.get("statistics").expect("statistics");
    assert_eq!(child_stats.get("successful_executions"), Some(&json!(2)));
    assert_eq!(child_stats.get("failed_executions"), Some(&json!(0)));
}

#[tokio::test]
async fn child_events_bubble_with_the_workflow_id() {
    let checks = catalog(vec![nested_workflow("wf")]);
    let (config, emitter) = collecting_config();

    run(checks, config, run_options()).await.expect("runs");

    // Bubbled child events reach the parent bus, stamped with the
    // owning workflow check id.
    let bubbled: Vec<_> = emitter
        .events()
        .into_iter()
        .filter(|event| event.workflow_id.as_deref() == Some("wf"))
        .collect();
    assert!(!bubbled.is_empty());
    assert!(bubbled.iter().any(|event| {
        matches!(
            &event.payload,
            EventPayload::CheckCompleted { check_id, status, .. }
                if check_id == "inner_a" && *status == CheckStatus::Success
        )
    }));
}

#[tokio::test]
async fn depth_limit_skips_the_workflow_check() {
    let checks = catalog(vec![nested_workflow("wf")]);
    let (mut config, _emitter) = collecting_config();
    config.options.max_workflow_depth = 0;

    let result = run(checks, config, run_options()).await.expect("runs");

    let group = result.results.get("wf").expect("group");
    let wf = &group.checks[0];
    assert_eq!(wf.status, CheckStatus::Skipped);
    assert_eq!(wf.skip_reason, Some(SkipReason::DepthLimit));
}

#[tokio::test]
async fn malformed_nested_checks_fail_the_workflow_check() {
    let broken = CheckSpec::new("wf", CheckType::Workflow).with_config(json!({
        "checks": {
            "inner": { "type": "noop", "depends_on": ["ghost"] },
        }
    }));
    let checks = catalog(vec![broken]);
    let (config, _emitter) = collecting_config();

    let result = run(checks, config, run_options()).await.expect("runs");

    let group = result.results.get("wf").expect("group");
    assert_eq!(group.checks[0].status, CheckStatus::Failed);
}
