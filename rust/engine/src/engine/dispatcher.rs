//! Level dispatch.
//!
//! Executes one level of the current wave: expands forEach fanout into
//! scoped sub-executions, issues them concurrently up to
//! `max_parallelism`, and enforces the wave barrier: the caller does
//! not see results until every scheduled execution has produced a
//! journal entry or been skipped.
//!
//! Checks are issued in catalog order and admitted FIFO by the
//! semaphore, which is the documented tie-break when a level is wider
//! than the parallelism budget.

use std::sync::Arc;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use indexmap::IndexSet;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::cancel::CancelToken;
use crate::journal::JournalEntry;
use crate::runtime::{ExecReport, Runtime};
use crate::scope::Scope;
use crate::spec::CheckSpec;
use crate::types::{CheckStatus, SkipReason};

/// One planned check within a level, optionally pinned to an explicit
/// scope by a per-item forward-run descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ScheduledCheck {
    pub check_id: String,
    pub pinned_scope: Option<Scope>,
}

impl ScheduledCheck {
    /// A check scheduled at its natural (fanout-expanded) scope.
    pub(crate) fn plain(check_id: String) -> Self {
        Self {
            check_id,
            pinned_scope: None,
        }
    }
}

/// Execute one level and return every report once the barrier is met.
pub(crate) async fn run_level(
    runtime: &Arc<Runtime>,
    level: Vec<ScheduledCheck>,
    wave: u32,
    event: &str,
    cancel: &CancelToken,
) -> Vec<ExecReport> {
    let mut reports = Vec::new();
    let mut executions: Vec<(String, Scope)> = Vec::new();

    for scheduled in level {
        if let Some(scope) = scheduled.pinned_scope {
            executions.push((scheduled.check_id, scope));
            continue;
        }

        let Some(spec) = runtime.specs.get(&scheduled.check_id) else {
            // The runtime journals the unknown check as failed.
            executions.push((scheduled.check_id, Scope::root()));
            continue;
        };

        let scopes = expand_scopes(runtime, spec);
        if scopes.is_empty() {
            // A forEach parent produced an empty sequence: zero
            // sub-executions, and the dependent is skipped.
            reports.push(runtime.skip_check(
                &spec.id,
                wave,
                Scope::root(),
                SkipReason::DependencyFailed,
            ));
            continue;
        }
        for scope in scopes {
            executions.push((spec.id.clone(), scope));
        }
    }

    let semaphore = Arc::new(Semaphore::new(runtime.options.max_parallelism));

    let mut futs: FuturesUnordered<_> = executions
        .into_iter()
        .map(|(check_id, scope)| {
            let runtime = Arc::clone(runtime);
            let cancel = cancel.clone();
            let semaphore = Arc::clone(&semaphore);
            let event = event.to_string();

            async move {
                // Acquire a permit to bound concurrency. The semaphore
                // is never closed; a failed acquire only happens during
                // teardown, where running unthrottled is harmless.
                let _permit = semaphore.acquire_owned().await.ok();

                runtime.emit(
                    wave,
                    crate::events::EventPayload::CheckScheduled {
                        check_id: check_id.clone(),
                        scope: scope.clone(),
                    },
                );

                runtime
                    .execute_check(&check_id, scope, wave, &event, cancel)
                    .await
            }
        })
        .collect();

    while let Some(report) = futs.next().await {
        reports.push(report);
    }

    log_level_stats(wave, &reports);
    reports
}

/// Compute the scopes a check executes at, one per item of each
/// forEach dependency.
///
/// Starts from the root scope and, for every forEach dependency in
/// declaration order, replaces each accumulated scope with one child
/// scope per item of the parent's latest observable output at that
/// position. Nested fanouts accumulate naturally because the parent's
/// own entries already carry their fanned-out scopes.
///
/// Returns an empty list when a forEach parent has no successful
/// entries or produced an empty sequence; the caller skips the check
/// with a dependency failure.
fn expand_scopes(runtime: &Runtime, spec: &CheckSpec) -> Vec<Scope> {
    let for_each_deps: Vec<&str> = {
        let mut seen = IndexSet::new();
        spec.dependency_ids()
            .filter(|dep| {
                runtime
                    .specs
                    .get(*dep)
                    .is_some_and(|parent| parent.for_each)
            })
            .filter(|dep| seen.insert(*dep))
            .collect()
    };

    let mut scopes = vec![Scope::root()];

    for dep in for_each_deps {
        // Latest successful entry per distinct scope of the parent; a
        // re-run (goto loop) overwrites its earlier iteration.
        let mut latest: indexmap::IndexMap<String, JournalEntry> = indexmap::IndexMap::new();
        for entry in runtime.journal.all_entries() {
            if entry.check_id == dep && entry.status == CheckStatus::Success {
                latest.insert(entry.scope.key(), entry);
            }
        }

        let mut next: Vec<Scope> = Vec::new();
        let mut seen: IndexSet<String> = IndexSet::new();

        for base in &scopes {
            for entry in latest.values() {
                let observable =
                    entry.scope.is_prefix_of(base) || base.is_prefix_of(&entry.scope);
                if !observable {
                    continue;
                }
                let item_count = match &entry.output {
                    Some(Value::Array(items)) => items.len(),
                    Some(Value::Null) | None => 0,
                    // A non-array output is a single-item sequence.
                    Some(_) => 1,
                };
                // The deeper of the two scopes anchors the fanout.
                let anchor = if entry.scope.segments().len() >= base.segments().len() {
                    &entry.scope
                } else {
                    base
                };
                for index in 0..item_count {
                    let scope = anchor.child(dep, index);
                    if seen.insert(scope.key()) {
                        next.push(scope);
                    }
                }
            }
        }

        scopes = next;
        if scopes.is_empty() {
            break;
        }
    }

    scopes
}

/// Per-level statistics, traced at debug level.
fn log_level_stats(wave: u32, reports: &[ExecReport]) {
    let mut success = 0usize;
    let mut failed = 0usize;
    let mut skipped = 0usize;
    for report in reports {
        match report.entry.status {
            CheckStatus::Success => success += 1,
            CheckStatus::Failed => failed += 1,
            CheckStatus::Skipped => skipped += 1,
        }
    }
    tracing::debug!(
        target: "proctor::dispatcher",
        wave,
        total = reports.len(),
        success,
        failed,
        skipped,
        "level complete",
    );
}
