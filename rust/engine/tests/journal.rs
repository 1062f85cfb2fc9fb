//! Tests for the append-only journal: ordering, snapshots, scope
//! visibility, current values, and history aggregation.

use chrono::Utc;
use serde_json::json;

use proctor_engine::journal::{Journal, JournalEntry};
use proctor_engine::scope::Scope;
use proctor_engine::types::{CheckStatus, SkipReason};

fn entry(check_id: &str, wave: u32, scope: Scope, status: CheckStatus) -> JournalEntry {
    let now = Utc::now();
    JournalEntry {
        sequence: 0,
        check_id: check_id.to_string(),
        wave,
        scope,
        attempt: 1,
        status,
        skip_reason: None,
        started_at: now,
        ended_at: now,
        duration_ms: 1,
        output: None,
        error: None,
        session_id: None,
    }
}

fn success_with(check_id: &str, wave: u32, scope: Scope, output: serde_json::Value) -> JournalEntry {
    JournalEntry {
        output: Some(output),
        ..entry(check_id, wave, scope, CheckStatus::Success)
    }
}

#[test]
fn append_assigns_increasing_sequences() {
    let journal = Journal::new();
    let first = journal.append(entry("a", 1, Scope::root(), CheckStatus::Success));
    let second = journal.append(entry("b", 1, Scope::root(), CheckStatus::Success));
    assert!(second > first);
    assert_eq!(journal.len(), 2);
}

#[test]
fn snapshot_bounds_reads() {
    let journal = Journal::new();
    journal.append(success_with("a", 1, Scope::root(), json!(1)));
    let snapshot = journal.begin_snapshot();
    journal.append(success_with("b", 1, Scope::root(), json!(2)));

    let visible = journal.read_visible(snapshot, &Scope::root());
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].check_id, "a");
}

#[test]
fn scoped_entries_are_invisible_to_root_readers() {
    let journal = Journal::new();
    let child = Scope::root().child("items", 0);
    journal.append(success_with("worker", 1, child.clone(), json!(10)));

    let snapshot = journal.begin_snapshot();
    assert!(journal.read_visible(snapshot, &Scope::root()).is_empty());
    // A reader inside the fanout sees it.
    assert_eq!(journal.read_visible(snapshot, &child).len(), 1);
}

#[test]
fn root_entries_are_visible_inside_fanouts() {
    let journal = Journal::new();
    journal.append(success_with("setup", 1, Scope::root(), json!("ready")));

    let child = Scope::root().child("items", 3);
    assert_eq!(
        journal.current_value("setup", &child),
        Some(json!("ready"))
    );
}

#[test]
fn current_value_takes_the_latest_successful_entry() {
    let journal = Journal::new();
    journal.append(success_with("counter", 1, Scope::root(), json!(1)));
    journal.append(success_with("counter", 2, Scope::root(), json!(2)));
    journal.append(entry("counter", 3, Scope::root(), CheckStatus::Failed));

    assert_eq!(journal.current_value("counter", &Scope::root()), Some(json!(2)));
}

#[test]
fn history_aggregates_descendant_scopes_oldest_first() {
    let journal = Journal::new();
    for index in 0..3 {
        journal.append(success_with(
            "process",
            1,
            Scope::root().child("items", index),
            json!(index * 2),
        ));
    }
    // Failed iterations contribute nothing.
    journal.append(entry(
        "process",
        1,
        Scope::root().child("items", 3),
        CheckStatus::Failed,
    ));

    let history = journal.history("process", &Scope::root());
    assert_eq!(history, vec![json!(0), json!(2), json!(4)]);
}

#[test]
fn history_is_scoped_to_the_readers_branch() {
    let journal = Journal::new();
    let left = Scope::root().child("items", 0);
    let right = Scope::root().child("items", 1);
    journal.append(success_with("process", 1, left.clone(), json!("left")));
    journal.append(success_with("process", 1, right, json!("right")));

    // A reader inside one branch sees only its own iteration.
    assert_eq!(journal.history("process", &left), vec![json!("left")]);
}

#[test]
fn has_success_covers_both_directions() {
    let journal = Journal::new();
    let child = Scope::root().child("items", 0);
    journal.append(success_with("fanned", 1, child.clone(), json!(1)));

    // Aggregation: the root observes the fanned-out success.
    assert!(journal.has_success("fanned", &Scope::root()));
    // Containment: the fanout observes root-level successes.
    journal.append(success_with("base", 1, Scope::root(), json!(2)));
    assert!(journal.has_success("base", &child));
    // Sibling branches stay isolated.
    let sibling = Scope::root().child("items", 1);
    assert!(!journal.has_success("fanned", &sibling));
}

#[test]
fn skipped_entries_never_carry_outputs() {
    let journal = Journal::new();
    journal.append(JournalEntry::skipped(
        "gated",
        1,
        Scope::root(),
        SkipReason::IfCondition,
    ));

    assert_eq!(journal.current_value("gated", &Scope::root()), None);
    assert!(journal.was_skipped_with("gated", SkipReason::IfCondition));
    assert!(!journal.was_skipped_with("gated", SkipReason::TriggerMismatch));
}

#[test]
fn latest_session_id_skips_failed_entries() {
    let journal = Journal::new();
    journal.append(JournalEntry {
        session_id: Some("s-1".to_string()),
        ..success_with("review", 1, Scope::root(), json!({}))
    });
    journal.append(entry("review", 2, Scope::root(), CheckStatus::Failed));

    assert_eq!(
        journal.latest_session_id("review", &Scope::root()),
        Some("s-1".to_string())
    );
}
