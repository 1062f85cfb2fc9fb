//! Tests for cooperative cancellation: external cancel tokens, the
//! global run timeout, and per-check timeouts.

mod common;

use serde_json::json;

use proctor_engine::cancel::CancelToken;
use proctor_engine::engine::run;
use proctor_engine::events::EventPayload;
use proctor_engine::spec::CheckSpec;
use proctor_engine::types::{CheckStatus, CheckType, Duration};

use common::{catalog, collecting_config, echo_check, run_options};

#[tokio::test]
async fn a_cancelled_token_stops_the_run_before_any_work() {
    let checks = catalog(vec![echo_check("a", "A")]);
    let (config, emitter) = collecting_config();

    let cancel = CancelToken::new();
    cancel.cancel();
    let mut options = run_options();
    options.cancel = Some(cancel);

    let result = run(checks, config, options).await.expect("completes");

    assert_eq!(result.statistics.total_executions, 0);
    assert!(emitter.events().iter().any(|event| {
        matches!(&event.payload, EventPayload::Shutdown { .. })
    }));
}

#[tokio::test]
async fn global_timeout_drains_in_flight_work_and_stops() {
    let slow = CheckSpec::new("slow", CheckType::Command)
        .with_config(json!({"exec": "sleep 0.2; echo done"}));
    let dependent = echo_check("dependent", "after").with_depends_on(&["slow"]);
    let checks = catalog(vec![slow, dependent]);

    let (config, emitter) = collecting_config();
    let mut options = run_options();
    options.timeout = Some(Duration::from_millis(50));

    let result = run(checks, config, options).await.expect("completes");

    // The in-flight check finished at the level barrier; the next
    // level was never scheduled.
    let slow = result.statistics.checks.get("slow").expect("slow");
    assert_eq!(slow.success, 1);
    let dependent = result.statistics.checks.get("dependent").expect("dependent");
    assert_eq!(dependent.total, 0);

    assert!(emitter.events().iter().any(|event| {
        matches!(
            &event.payload,
            EventPayload::Shutdown { error: Some(reason) } if reason.contains("timeout")
        )
    }));
}

#[tokio::test]
async fn per_check_timeout_fails_the_attempt() {
    let mut hung = CheckSpec::new("hung", CheckType::Command)
        .with_config(json!({"exec": "sleep 5"}));
    hung.timeout = Some(Duration::from_millis(50));
    let checks = catalog(vec![hung]);
    let (config, emitter) = collecting_config();

    let result = run(checks, config, run_options()).await.expect("completes");

    let group = result.results.get("hung").expect("group");
    assert_eq!(group.checks[0].status, CheckStatus::Failed);
    assert!(emitter.events().iter().any(|event| {
        matches!(
            &event.payload,
            EventPayload::CheckErrored { error, .. } if error.contains("timed out")
        )
    }));
}
