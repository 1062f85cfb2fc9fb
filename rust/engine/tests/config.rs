//! Tests for configuration document loading: option defaults, unknown
//! key handling, check parsing, and catalog validation.

use serde_json::json;

use proctor_engine::config::load_str;
use proctor_engine::error::EngineError;
use proctor_engine::spec::{DependsToken, SessionMode};
use proctor_engine::types::{CheckType, Severity};

const MINIMAL: &str = r#"
version: "1.0"
checks:
  lint:
    type: command
    exec: cargo clippy
"#;

#[test]
fn minimal_document_loads_with_defaults() {
    let loaded = load_str(MINIMAL, false).expect("loads");
    assert_eq!(loaded.version, "1.0");
    assert_eq!(loaded.options.max_parallelism, 4);
    assert_eq!(loaded.options.max_ai_concurrency, None);
    assert!(!loaded.options.fail_fast);
    assert_eq!(loaded.options.max_routing_loops, 10);
    assert_eq!(loaded.options.max_workflow_depth, 5);
    assert!(loaded.options.suppression_enabled);
    assert!(loaded.warnings.is_empty());

    let lint = loaded.checks.get("lint").expect("lint");
    assert_eq!(lint.check_type, CheckType::Command);
    assert_eq!(lint.provider_config, json!({"exec": "cargo clippy"}));
    assert_eq!(lint.retry.max_attempts, 1);
}

#[test]
fn top_level_options_are_recognized() {
    let source = r#"
version: "1.0"
max_parallelism: 2
max_ai_concurrency: 1
fail_fast: true
routing:
  max_loops: 3
limits:
  max_workflow_depth: 2
output:
  suppression_enabled: false
env_allowlist: [CI, HOME]
checks:
  noop:
    type: noop
"#;
    let loaded = load_str(source, false).expect("loads");
    assert_eq!(loaded.options.max_parallelism, 2);
    assert_eq!(loaded.options.max_ai_concurrency, Some(1));
    assert!(loaded.options.fail_fast);
    assert_eq!(loaded.options.max_routing_loops, 3);
    assert_eq!(loaded.options.max_workflow_depth, 2);
    assert!(!loaded.options.suppression_enabled);
    assert_eq!(loaded.options.env_allowlist, vec!["CI", "HOME"]);
}

#[test]
fn unknown_top_level_key_warns_by_default() {
    let source = r#"
version: "1.0"
surprise: true
checks:
  noop:
    type: noop
"#;
    let loaded = load_str(source, false).expect("loads");
    assert_eq!(loaded.warnings.len(), 1);
    assert!(loaded.warnings[0].contains("surprise"));
}

#[test]
fn unknown_top_level_key_fails_under_strict() {
    let source = r#"
version: "1.0"
surprise: true
checks:
  noop:
    type: noop
"#;
    let error = load_str(source, true).expect_err("strict");
    assert!(matches!(error, EngineError::InvalidConfig { .. }));
}

#[test]
fn full_check_spec_round_trips() {
    let source = r#"
version: "1.0"
checks:
  overview:
    type: ai
    prompt: "Summarize the change"
  security:
    type: ai
    prompt: "Review for security issues"
    on: [pr_opened, pr_updated]
    depends_on: [overview]
    if: "hasFileMatching('src/**')"
    fail_if:
      critical:
        condition: "countIssues('critical') > 0"
        severity: critical
        halt: true
    on_success:
      run: [notify]
    on_fail:
      goto: overview
    group: review
    tags: [security, slow]
    timeout: 90s
    retry:
      max_attempts: 3
      base_delay: 50ms
      backoff: 2.0
    reuse_session: overview
    session_mode: append
  notify:
    type: http
    url: https://example.test/hook
    depends_on: [security]
"#;
    let loaded = load_str(source, true).expect("loads");
    let security = loaded.checks.get("security").expect("security");

    assert_eq!(security.check_type, CheckType::Ai);
    assert_eq!(security.triggers, vec!["pr_opened", "pr_updated"]);
    assert_eq!(
        security.depends_on,
        vec![DependsToken::One("overview".to_string())]
    );
    assert_eq!(security.if_expr.as_deref(), Some("hasFileMatching('src/**')"));

    let critical = security.fail_if.get("critical").expect("predicate");
    assert_eq!(critical.severity, Severity::Critical);
    assert!(critical.halt);

    assert_eq!(
        security.on_success.as_ref().expect("on_success").run,
        vec!["notify"]
    );
    assert_eq!(
        security.on_fail.as_ref().expect("on_fail").goto.as_deref(),
        Some("overview")
    );
    assert_eq!(security.group.as_deref(), Some("review"));
    assert_eq!(security.tags, vec!["security", "slow"]);
    assert_eq!(security.timeout.expect("timeout").to_string(), "90s");
    assert_eq!(security.retry.max_attempts, 3);
    assert_eq!(security.retry.base_delay.to_string(), "50ms");
    assert_eq!(security.reuse_session.as_deref(), Some("overview"));
    assert_eq!(security.session_mode, SessionMode::Append);
    // The prompt lands in the opaque provider config.
    assert_eq!(
        security.provider_config.get("prompt").and_then(|v| v.as_str()),
        Some("Review for security issues")
    );
}

#[test]
fn bare_fail_if_string_becomes_a_named_predicate() {
    let source = r#"
version: "1.0"
checks:
  build:
    type: command
    exec: make
    fail_if: "contains(output, 'warning')"
"#;
    let loaded = load_str(source, false).expect("loads");
    let build = loaded.checks.get("build").expect("build");
    let predicate = build.fail_if.get("fail_if").expect("predicate");
    assert_eq!(predicate.condition, "contains(output, 'warning')");
    assert_eq!(predicate.severity, Severity::Error);
    assert!(!predicate.halt);
}

#[test]
fn or_tokens_parse_from_depends_on() {
    let source = r#"
version: "1.0"
checks:
  a:
    type: noop
  b:
    type: noop
  c:
    type: noop
    depends_on: ["a|b"]
"#;
    let loaded = load_str(source, false).expect("loads");
    let c = loaded.checks.get("c").expect("c");
    assert_eq!(
        c.depends_on,
        vec![DependsToken::AnyOf(vec!["a".to_string(), "b".to_string()])]
    );
}

#[test]
fn dangling_dependency_is_rejected() {
    let source = r#"
version: "1.0"
checks:
  a:
    type: noop
    depends_on: [ghost]
"#;
    let error = load_str(source, false).expect_err("dangling");
    assert!(matches!(error, EngineError::InvalidConfig { .. }));
}

#[test]
fn self_dependency_is_rejected() {
    let source = r#"
version: "1.0"
checks:
  a:
    type: noop
    depends_on: [a]
"#;
    assert!(load_str(source, false).is_err());
}

#[test]
fn session_reuse_must_target_an_ai_check() {
    let source = r#"
version: "1.0"
checks:
  setup:
    type: command
    exec: "true"
  review:
    type: ai
    prompt: p
    reuse_session: setup
"#;
    assert!(load_str(source, false).is_err());
}

#[test]
fn zero_parallelism_is_rejected() {
    let source = r#"
version: "1.0"
max_parallelism: 0
checks:
  a:
    type: noop
"#;
    assert!(load_str(source, false).is_err());
}

#[test]
fn broken_expressions_warn_but_load() {
    let source = r#"
version: "1.0"
checks:
  a:
    type: noop
    if: "1 +"
"#;
    let loaded = load_str(source, false).expect("loads");
    assert_eq!(loaded.warnings.len(), 1);
    assert!(loaded.warnings[0].contains('a'));
    // Strict mode promotes the warning to an error.
    assert!(load_str(source, true).is_err());
}
