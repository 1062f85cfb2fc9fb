//! Run results and statistics.
//!
//! At termination the engine folds the journal into a structured
//! result: per-group check results (latest content, forEach-aggregated
//! history, collected issues) plus balanced statistics. Suppressed
//! issues are filtered here, by a post-processor, so the raw issues
//! remain in the journal for audit.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::EngineOptions;
use crate::journal::Journal;
use crate::scope::Scope;
use crate::spec::CheckSpec;
use crate::types::{CheckStatus, Issue, SkipReason, issues_from_value};

/// Per-check execution counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CheckStats {
    /// All journalled executions (success + failed + skipped).
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Accumulated execution time across attempts.
    pub duration_ms: u64,
}

/// Run-level statistics.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunStatistics {
    /// Checks in the catalog (not executions).
    pub total_checks_configured: usize,
    /// Executions that reached a provider (success + failed).
    pub total_executions: usize,
    pub successful_executions: usize,
    pub failed_executions: usize,
    /// Executions skipped before their provider ran.
    pub skipped_checks: usize,
    /// Accumulated execution time across all entries.
    pub total_duration_ms: u64,
    /// Per-check counters, in catalog order.
    pub checks: IndexMap<String, CheckStats>,
}

/// Debug capture for one execution, present when the run requested
/// debug output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugRecord {
    pub check_id: String,
    pub scope: Scope,
    pub wave: u32,
    pub attempt: u32,
    pub provider: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The folded result for one check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub check_id: String,
    /// Status of the latest execution.
    pub status: CheckStatus,
    /// Skip reason of the latest execution, when skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    /// The most recent successful output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    /// All successful outputs when more than one execution produced
    /// output (forEach fanout, goto loops); `None` for single-shot
    /// checks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregated: Option<Value>,
    /// Issues collected across successful outputs, post-suppression.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<Issue>,
}

/// Check results sharing one `group` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupResult {
    pub group: String,
    pub checks: Vec<CheckResult>,
}

/// The structured result returned at run termination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    /// Results grouped by `CheckSpec::group` (default: check id), in
    /// catalog order.
    pub results: IndexMap<String, GroupResult>,
    /// Balanced statistics.
    pub statistics: RunStatistics,
    /// Per-execution debug records, when requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<Vec<DebugRecord>>,
}

/// Fold the journal into the final result document.
#[must_use]
pub fn collect(
    specs: &IndexMap<String, CheckSpec>,
    journal: &Journal,
    options: &EngineOptions,
    debug: Option<Vec<DebugRecord>>,
) -> RunResult {
    let entries = journal.all_entries();

    // -- Statistics --
    let mut statistics = RunStatistics {
        total_checks_configured: specs.len(),
        ..RunStatistics::default()
    };
    for id in specs.keys() {
        statistics.checks.insert(id.clone(), CheckStats::default());
    }

    for entry in &entries {
        let stats = statistics.checks.entry(entry.check_id.clone()).or_default();
        stats.total += 1;
        stats.duration_ms += entry.duration_ms;
        statistics.total_duration_ms += entry.duration_ms;
        match entry.status {
            CheckStatus::Success => {
                stats.success += 1;
                statistics.successful_executions += 1;
                statistics.total_executions += 1;
            }
            CheckStatus::Failed => {
                stats.failed += 1;
                statistics.failed_executions += 1;
                statistics.total_executions += 1;
            }
            CheckStatus::Skipped => {
                stats.skipped += 1;
                statistics.skipped_checks += 1;
            }
        }
    }

    // -- Grouped results --
    let root = Scope::root();
    let mut results: IndexMap<String, GroupResult> = IndexMap::new();

    for (id, spec) in specs {
        let history = journal.history(id, &root);
        // Latest entry regardless of scope: a fanned-out check has no
        // root-scope entries, yet its summary belongs in the results.
        let latest = entries.iter().rev().find(|entry| &entry.check_id == id);

        let issues: Vec<Issue> = history
            .iter()
            .flat_map(|value| issues_from_value(value))
            .filter(|issue| !(options.suppression_enabled && issue.suppressed))
            .collect();

        let check_result = CheckResult {
            check_id: id.clone(),
            status: latest.map_or(CheckStatus::Skipped, |entry| entry.status),
            skip_reason: latest.and_then(|entry| entry.skip_reason),
            content: history.last().cloned(),
            aggregated: (history.len() > 1).then(|| Value::Array(history.clone())),
            issues,
        };

        let group = spec.group_key().to_string();
        results
            .entry(group.clone())
            .or_insert_with(|| GroupResult {
                group,
                checks: Vec::new(),
            })
            .checks
            .push(check_result);
    }

    RunResult {
        results,
        statistics,
        debug,
    }
}
