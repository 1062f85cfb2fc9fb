//! End-to-end engine runs: the diamond, OR-dependencies, goto loops,
//! forEach fanout, wave retry, cycle handling, and the fail-fast and
//! retry paths.

mod common;

use std::sync::Arc;

use serde_json::json;

use proctor_engine::engine::{EngineConfig, run};
use proctor_engine::error::EngineError;
use proctor_engine::events::EventPayload;
use proctor_engine::provider::ProviderRegistry;
use proctor_engine::results::RunResult;
use proctor_engine::spec::{CheckSpec, FailCondition, RoutingDirective};
use proctor_engine::types::{CheckStatus, CheckType, SkipReason};

use common::{SequenceProvider, catalog, collecting_config, echo_check, failing_check, run_options};

/// The folded result for a single check (group defaults to its id).
fn check_result<'r>(result: &'r RunResult, id: &str) -> &'r proctor_engine::results::CheckResult {
    result
        .results
        .get(id)
        .and_then(|group| group.checks.iter().find(|check| check.check_id == id))
        .unwrap_or_else(|| panic!("no result for {id}"))
}

#[tokio::test]
async fn diamond_runs_in_level_order() {
    let checks = catalog(vec![
        echo_check("a", "A"),
        echo_check("b", "B").with_depends_on(&["a"]),
        echo_check("c", "C").with_depends_on(&["a"]),
        echo_check("d", "D").with_depends_on(&["b", "c"]),
    ]);
    let (config, emitter) = collecting_config();

    let result = run(checks, config, run_options()).await.expect("runs");

    let stats = &result.statistics;
    assert_eq!(stats.total_checks_configured, 4);
    assert_eq!(stats.total_executions, 4);
    assert_eq!(stats.successful_executions, 4);
    assert_eq!(stats.failed_executions, 0);
    assert_eq!(stats.skipped_checks, 0);
    for id in ["a", "b", "c", "d"] {
        let check = stats.checks.get(id).expect("stats");
        assert_eq!((check.total, check.success), (1, 1));
    }
    assert_eq!(check_result(&result, "d").content, Some(json!("D")));

    // The wave barrier orders d after both b and c.
    let events = emitter.events();
    let completed = |id: &str| {
        events
            .iter()
            .position(|event| {
                matches!(
                    &event.payload,
                    EventPayload::CheckCompleted { check_id, .. } if check_id == id
                )
            })
            .unwrap_or_else(|| panic!("{id} never completed"))
    };
    let scheduled_d = events
        .iter()
        .position(|event| {
            matches!(
                &event.payload,
                EventPayload::CheckScheduled { check_id, .. } if check_id == "d"
            )
        })
        .expect("d scheduled");
    assert!(completed("a") < scheduled_d);
    assert!(completed("b") < scheduled_d);
    assert!(completed("c") < scheduled_d);
}

#[tokio::test]
async fn or_dependency_is_satisfied_by_one_alternative() {
    let checks = catalog(vec![
        failing_check("a"),
        echo_check("b", "B"),
        echo_check("c", "C").with_depends_on(&["a|b"]),
    ]);
    let (config, _emitter) = collecting_config();

    let result = run(checks, config, run_options()).await.expect("runs");

    let stats = &result.statistics;
    assert_eq!(stats.successful_executions, 2);
    assert_eq!(stats.failed_executions, 1);
    assert_eq!(check_result(&result, "c").status, CheckStatus::Success);
    assert_eq!(check_result(&result, "a").status, CheckStatus::Failed);
}

#[tokio::test]
async fn unsatisfied_dependency_skips_the_dependent() {
    let checks = catalog(vec![
        failing_check("a"),
        echo_check("b", "B").with_depends_on(&["a"]),
    ]);
    let (config, _emitter) = collecting_config();

    let result = run(checks, config, run_options()).await.expect("runs");

    let b = check_result(&result, "b");
    assert_eq!(b.status, CheckStatus::Skipped);
    assert_eq!(b.skip_reason, Some(SkipReason::DependencyFailed));
}

#[tokio::test]
async fn goto_loop_reruns_until_the_condition_clears() {
    let counter = CheckSpec::new("counter", CheckType::Memory).with_config(json!({
        "op": "increment",
        "key": "n",
        "namespace": "loops",
    }));
    let looper = CheckSpec::new("loop", CheckType::Noop)
        .with_depends_on(&["counter"])
        .with_on_success(RoutingDirective {
            goto_js: Some("memory.get('n', 'loops') < 3 ? 'counter' : null".to_string()),
            ..RoutingDirective::default()
        });
    let checks = catalog(vec![counter, looper]);

    let (config, emitter) = collecting_config();
    let memory = Arc::clone(&config.memory);

    let result = run(checks, config, run_options()).await.expect("runs");

    assert_eq!(memory.get("n", Some("loops")), Some(json!(3)));
    assert_eq!(result.statistics.checks.get("counter").expect("counter").total, 3);
    assert_eq!(result.statistics.checks.get("loop").expect("loop").total, 3);

    // Each honored goto surfaced as a preemptive forward-run request.
    let gotos = emitter
        .events()
        .iter()
        .filter(|event| {
            matches!(
                &event.payload,
                EventPayload::ForwardRunRequested { target, goto_event, .. }
                    if target == "counter" && goto_event.is_some()
            )
        })
        .count();
    assert_eq!(gotos, 2);
}

#[tokio::test]
async fn goto_loop_limit_skips_the_initiator() {
    let counter = CheckSpec::new("counter", CheckType::Memory).with_config(json!({
        "op": "increment",
        "key": "n",
    }));
    // Unconditional goto: only the loop limit stops it.
    let looper = CheckSpec::new("loop", CheckType::Noop)
        .with_depends_on(&["counter"])
        .with_on_success(RoutingDirective {
            goto: Some("counter".to_string()),
            ..RoutingDirective::default()
        });
    let checks = catalog(vec![counter, looper]);

    let (mut config, _emitter) = collecting_config();
    config.options.max_routing_loops = 2;
    let memory = Arc::clone(&config.memory);

    let result = run(checks, config, run_options()).await.expect("runs");

    // Two honored jumps: three executions of each check, then the
    // initiating check is marked with the loop limit.
    assert_eq!(memory.get("n", None), Some(json!(3)));
    let looper = check_result(&result, "loop");
    assert_eq!(looper.status, CheckStatus::Skipped);
    assert_eq!(looper.skip_reason, Some(SkipReason::RoutingLoopLimit));
    let stats = result.statistics.checks.get("loop").expect("loop");
    assert_eq!(stats.success, 3);
    assert_eq!(stats.skipped, 1);
}

#[tokio::test]
async fn goto_to_a_non_ancestor_is_rejected() {
    let a = echo_check("a", "A").with_on_success(RoutingDirective {
        goto: Some("b".to_string()),
        ..RoutingDirective::default()
    });
    let b = echo_check("b", "B");
    let checks = catalog(vec![a, b]);
    let (config, emitter) = collecting_config();

    let result = run(checks, config, run_options()).await.expect("runs");

    // No re-run happened: the directive was dropped.
    assert_eq!(result.statistics.checks.get("b").expect("b").total, 1);
    assert!(!emitter.events().iter().any(|event| {
        matches!(&event.payload, EventPayload::ForwardRunRequested { .. })
    }));
}

#[tokio::test]
async fn for_each_fans_out_and_aggregates_history() {
    let list = echo_check("listItems", "'[1,2,3,4,5]'").with_for_each();
    let process = CheckSpec::new("processItem", CheckType::Script)
        .with_depends_on(&["listItems"])
        .with_config(json!({"expr": "outputs.listItems * 2"}));
    let verify = CheckSpec::new("verify", CheckType::Script)
        .with_depends_on(&["processItem"])
        .with_config(json!({
            "expr": "length(outputs.history['processItem']) == 5 \
                     && contains(outputs.history['processItem'], 2) \
                     && contains(outputs.history['processItem'], 10)",
        }));
    let checks = catalog(vec![list, process, verify]);
    let (config, _emitter) = collecting_config();

    let result = run(checks, config, run_options()).await.expect("runs");

    let process = check_result(&result, "processItem");
    assert_eq!(
        process.aggregated,
        Some(json!([2, 4, 6, 8, 10])),
    );
    assert_eq!(check_result(&result, "verify").content, Some(json!(true)));

    let stats = &result.statistics;
    assert_eq!(stats.checks.get("processItem").expect("stats").total, 5);
    assert_eq!(stats.checks.get("verify").expect("stats").total, 1);
}

#[tokio::test]
async fn empty_for_each_sequence_skips_dependents() {
    let list = echo_check("listItems", "'[]'").with_for_each();
    let process = CheckSpec::new("processItem", CheckType::Script)
        .with_depends_on(&["listItems"])
        .with_config(json!({"expr": "outputs.listItems"}));
    let checks = catalog(vec![list, process]);
    let (config, _emitter) = collecting_config();

    let result = run(checks, config, run_options()).await.expect("runs");

    let process = check_result(&result, "processItem");
    assert_eq!(process.status, CheckStatus::Skipped);
    assert_eq!(process.skip_reason, Some(SkipReason::DependencyFailed));
    let stats = result.statistics.checks.get("processItem").expect("stats");
    assert_eq!((stats.total, stats.skipped), (1, 1));
}

#[tokio::test]
async fn on_finish_retries_if_skipped_checks_only() {
    let gated = CheckSpec::new("gated", CheckType::Noop).with_if("memory.has('ready')");
    let first = CheckSpec::new("first", CheckType::Noop);
    let seed = CheckSpec::new("seed", CheckType::Memory)
        .with_depends_on(&["first"])
        .with_config(json!({"op": "set", "key": "ready", "value": true}));
    let mut finisher = CheckSpec::new("finisher", CheckType::Noop).with_depends_on(&["seed"]);
    finisher.on_finish = true;
    let checks = catalog(vec![gated, first, seed, finisher]);

    let (config, emitter) = collecting_config();

    let result = run(checks, config, run_options()).await.expect("runs");

    let gated = result.statistics.checks.get("gated").expect("gated");
    assert_eq!(gated.total, 2);
    assert_eq!(gated.skipped, 1);
    assert_eq!(gated.success, 1);
    // Dependencies of the retried check are not re-run.
    assert_eq!(result.statistics.checks.get("seed").expect("seed").total, 1);
    assert_eq!(result.statistics.checks.get("first").expect("first").total, 1);

    assert!(emitter.events().iter().any(|event| {
        matches!(&event.payload, EventPayload::WaveRetry { .. })
    }));
}

#[tokio::test]
async fn cycle_completes_with_a_synthesized_failure() {
    let checks = catalog(vec![
        CheckSpec::new("a", CheckType::Noop).with_depends_on(&["b"]),
        CheckSpec::new("b", CheckType::Noop).with_depends_on(&["a"]),
    ]);
    let (config, emitter) = collecting_config();

    // Completed, not an error: callers get a structured report.
    let result = run(checks, config, run_options()).await.expect("completes");

    assert_eq!(result.statistics.failed_executions, 1);
    let failed: Vec<_> = result
        .statistics
        .checks
        .iter()
        .filter(|(_, stats)| stats.failed > 0)
        .collect();
    assert_eq!(failed.len(), 1);

    assert!(emitter.events().iter().any(|event| {
        matches!(
            &event.payload,
            EventPayload::CheckErrored { error, .. } if error.contains("cycle")
        )
    }));
}

#[tokio::test]
async fn run_directive_reexecutes_the_target_once_per_wave() {
    let a = echo_check("a", "A").with_on_success(RoutingDirective {
        // The duplicate target collapses to one request.
        run: vec!["t".to_string(), "t".to_string()],
        ..RoutingDirective::default()
    });
    let b = echo_check("b", "B").with_on_success(RoutingDirective {
        run: vec!["t".to_string()],
        ..RoutingDirective::default()
    });
    let t = echo_check("t", "T");
    let checks = catalog(vec![a, b, t]);
    let (config, emitter) = collecting_config();

    let result = run(checks, config, run_options()).await.expect("runs");

    // Initial execution plus exactly one forward re-run.
    assert_eq!(result.statistics.checks.get("t").expect("t").total, 2);
    let honored = emitter
        .events()
        .iter()
        .filter(|event| {
            matches!(
                &event.payload,
                EventPayload::ForwardRunRequested { target, .. } if target == "t"
            )
        })
        .count();
    assert_eq!(honored, 1);
}

#[tokio::test]
async fn fail_if_predicate_fails_the_check() {
    let mut build = echo_check("build", "'{\"warnings\": 3}'");
    build.fail_if.insert(
        "warnings".to_string(),
        FailCondition::new("output.warnings > 0"),
    );
    let checks = catalog(vec![build]);
    let (config, _emitter) = collecting_config();

    let result = run(checks, config, run_options()).await.expect("runs");

    let build = check_result(&result, "build");
    assert_eq!(build.status, CheckStatus::Failed);
    assert_eq!(result.statistics.failed_executions, 1);
}

#[tokio::test]
async fn halting_fail_if_with_fail_fast_stops_the_run() {
    let mut gate = echo_check("gate", "'{\"broken\": true}'");
    gate.fail_if.insert(
        "halt".to_string(),
        FailCondition {
            condition: "output.broken".to_string(),
            severity: proctor_engine::types::Severity::Critical,
            halt: true,
        },
    );
    let downstream = echo_check("downstream", "D").with_depends_on(&["gate"]);
    let checks = catalog(vec![gate, downstream]);

    let (mut config, _emitter) = collecting_config();
    config.options.fail_fast = true;

    let result = run(checks, config, run_options()).await.expect("runs");

    assert_eq!(result.statistics.failed_executions, 1);
    // The downstream level was never scheduled.
    assert_eq!(
        result.statistics.checks.get("downstream").expect("stats").total,
        0
    );
}

#[tokio::test]
async fn transient_errors_are_retried_and_journalled_per_attempt() {
    let sequence = Arc::new(SequenceProvider::new(vec![
        Err(EngineError::TemporaryUnavailable {
            message: "flaky".to_string(),
        }),
        Ok(json!("recovered")),
    ]));

    let mut registry = ProviderRegistry::with_defaults();
    registry.register_arc(CheckType::Noop.as_str(), sequence.clone());
    let mut config = EngineConfig::default();
    config.providers = Arc::new(registry);

    let mut flaky = CheckSpec::new("flaky", CheckType::Noop);
    flaky.retry.max_attempts = 3;
    flaky.retry.base_delay = proctor_engine::types::Duration::from_millis(1);
    let checks = catalog(vec![flaky]);

    let result = run(checks, config, run_options()).await.expect("runs");

    assert_eq!(sequence.calls(), 2);
    let stats = result.statistics.checks.get("flaky").expect("stats");
    // The failed attempt stays observable next to the success.
    assert_eq!((stats.total, stats.failed, stats.success), (2, 1, 1));
    assert_eq!(check_result(&result, "flaky").content, Some(json!("recovered")));
}

#[tokio::test]
async fn terminal_errors_are_not_retried() {
    let sequence = Arc::new(SequenceProvider::new(vec![Err(
        EngineError::ProviderFailed {
            check_id: "fixed".to_string(),
            reason: "bad input".to_string(),
        },
    )]));

    let mut registry = ProviderRegistry::with_defaults();
    registry.register_arc(CheckType::Noop.as_str(), sequence.clone());
    let mut config = EngineConfig::default();
    config.providers = Arc::new(registry);

    let mut fixed = CheckSpec::new("fixed", CheckType::Noop);
    fixed.retry.max_attempts = 3;
    let checks = catalog(vec![fixed]);

    let result = run(checks, config, run_options()).await.expect("runs");

    assert_eq!(sequence.calls(), 1);
    let stats = result.statistics.checks.get("fixed").expect("stats");
    assert_eq!((stats.total, stats.failed), (1, 1));
}

#[tokio::test]
async fn trigger_mismatch_skips_the_check() {
    let mut pr_only = echo_check("pr_only", "P");
    pr_only.triggers = vec!["pr_opened".to_string()];
    let always = echo_check("always", "A");
    let checks = catalog(vec![pr_only, always]);
    let (config, _emitter) = collecting_config();

    let result = run(checks, config, run_options()).await.expect("runs");

    let skipped = check_result(&result, "pr_only");
    assert_eq!(skipped.status, CheckStatus::Skipped);
    assert_eq!(skipped.skip_reason, Some(SkipReason::TriggerMismatch));
    assert_eq!(check_result(&result, "always").status, CheckStatus::Success);
}

#[tokio::test]
async fn tag_filters_exclude_checks() {
    let mut slow = echo_check("slow", "S");
    slow.tags = vec!["slow".to_string()];
    let fast = echo_check("fast", "F");
    let checks = catalog(vec![slow, fast]);

    let (config, _emitter) = collecting_config();
    let mut options = run_options();
    options.exclude_tags = vec!["slow".to_string()];

    let result = run(checks, config, options).await.expect("runs");

    assert_eq!(
        check_result(&result, "slow").skip_reason,
        Some(SkipReason::TagFilter)
    );
    assert_eq!(check_result(&result, "fast").status, CheckStatus::Success);
}

#[tokio::test]
async fn single_check_runs_exactly_once_at_wave_one() {
    let checks = catalog(vec![echo_check("only", "hello")]);
    let (config, emitter) = collecting_config();

    let result = run(checks, config, run_options()).await.expect("runs");

    let stats = result.statistics.checks.get("only").expect("stats");
    assert_eq!((stats.total, stats.success), (1, 1));

    let completed: Vec<u32> = emitter
        .events()
        .iter()
        .filter(|event| {
            matches!(&event.payload, EventPayload::CheckCompleted { check_id, .. } if check_id == "only")
        })
        .map(|event| event.wave)
        .collect();
    assert_eq!(completed, vec![1]);
}

#[tokio::test]
async fn debug_mode_captures_per_execution_records() {
    let checks = catalog(vec![
        echo_check("a", "A"),
        echo_check("b", "B").with_depends_on(&["a"]),
    ]);
    let (config, _emitter) = collecting_config();
    let mut options = run_options();
    options.debug = true;

    let result = run(checks, config, options).await.expect("runs");

    let records = result.debug.expect("debug records");
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|record| record.provider == "command"));
    assert!(records.iter().any(|record| record.check_id == "b"));
}

#[tokio::test]
async fn statistics_balance_for_every_check() {
    let checks = catalog(vec![
        echo_check("ok", "fine"),
        failing_check("broken"),
        echo_check("dependent", "d").with_depends_on(&["broken"]),
    ]);
    let (config, _emitter) = collecting_config();

    let result = run(checks, config, run_options()).await.expect("runs");

    for (id, stats) in &result.statistics.checks {
        assert_eq!(
            stats.total,
            stats.success + stats.failed + stats.skipped,
            "unbalanced stats for {id}"
        );
    }
    assert_eq!(
        result.statistics.total_executions,
        result.statistics.successful_executions + result.statistics.failed_executions
    );
}
