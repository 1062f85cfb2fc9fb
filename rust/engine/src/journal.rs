//! Append-only execution journal.
//!
//! Every check execution attempt is recorded as an immutable
//! [`JournalEntry`]. Appends are totally ordered by an increasing
//! sequence number; reads never fail. Visibility between scopes follows
//! prefix containment (see [`Scope`]); `history` additionally
//! aggregates entries written in *descendant* scopes, which is what
//! carries forEach iteration outputs back to readers outside the
//! fanout.

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::scope::Scope;
use crate::types::{CheckStatus, SkipReason};

/// Structured error recorded on a failed entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryError {
    /// Stable error code (see `EngineError::code`).
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional detail (stderr tail, predicate name, cycle nodes, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl EntryError {
    /// Build an entry error from an engine error.
    #[must_use]
    pub fn from_engine(error: &crate::error::EngineError) -> Self {
        Self {
            code: error.code().to_string(),
            message: error.to_string(),
            detail: None,
        }
    }
}

/// Immutable record of one check execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Total order position, assigned by [`Journal::append`].
    #[serde(default)]
    pub sequence: u64,

    /// The executed check.
    pub check_id: String,

    /// Planning epoch the execution belonged to.
    pub wave: u32,

    /// forEach position; root when empty.
    #[serde(default)]
    pub scope: Scope,

    /// 1-based attempt number within the retry loop.
    pub attempt: u32,

    /// Final status of this attempt.
    pub status: CheckStatus,

    /// Why the execution was skipped, when it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,

    /// Wall-clock start of the attempt.
    pub started_at: DateTime<Utc>,

    /// Wall-clock end of the attempt.
    pub ended_at: DateTime<Utc>,

    /// Elapsed execution time in milliseconds.
    pub duration_ms: u64,

    /// Output value produced by the provider; opaque to the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    /// Structured error for failed attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EntryError>,

    /// Provider-opaque session handle id for AI session reuse.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl JournalEntry {
    /// Build a skipped entry for a check that never reached its provider.
    #[must_use]
    pub fn skipped(check_id: impl Into<String>, wave: u32, scope: Scope, reason: SkipReason) -> Self {
        let now = Utc::now();
        Self {
            sequence: 0,
            check_id: check_id.into(),
            wave,
            scope,
            attempt: 1,
            status: CheckStatus::Skipped,
            skip_reason: Some(reason),
            started_at: now,
            ended_at: now,
            duration_ms: 0,
            output: None,
            error: None,
            session_id: None,
        }
    }
}

/// A read watermark: entries with `sequence` at or below the snapshot
/// are visible to readers holding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Snapshot(u64);

/// The append-only journal for one run.
///
/// Interior mutability behind an [`RwLock`] gives totally ordered
/// appends and concurrent reads; poisoned locks are recovered so a
/// panicked provider task cannot block later reads.
#[derive(Debug, Default)]
pub struct Journal {
    entries: RwLock<Vec<JournalEntry>>,
}

impl Journal {
    /// Create an empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, assigning and returning its sequence number.
    pub fn append(&self, mut entry: JournalEntry) -> u64 {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let sequence = entries.len() as u64 + 1;
        entry.sequence = sequence;
        entries.push(entry);
        sequence
    }

    /// Take a snapshot of the current sequence position.
    #[must_use]
    pub fn begin_snapshot(&self) -> Snapshot {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Snapshot(entries.len() as u64)
    }

    /// All entries at or below `snapshot` whose scope is a prefix of
    /// the reader's scope, in sequence order.
    #[must_use]
    pub fn read_visible(&self, snapshot: Snapshot, scope: &Scope) -> Vec<JournalEntry> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries
            .iter()
            .filter(|entry| entry.sequence <= snapshot.0 && entry.scope.is_prefix_of(scope))
            .cloned()
            .collect()
    }

    /// The most recent output value for a check visible at `scope`.
    ///
    /// Only successful entries carry outputs; the nearest-scope rule is
    /// implicit in sequence order (a later, deeper entry wins over an
    /// earlier ancestor entry).
    #[must_use]
    pub fn current_value(&self, check_id: &str, scope: &Scope) -> Option<Value> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries
            .iter()
            .rev()
            .find(|entry| {
                entry.check_id == check_id
                    && entry.status.is_success()
                    && entry.scope.is_prefix_of(scope)
            })
            .and_then(|entry| entry.output.clone())
    }

    /// All successful output values for a check observable from
    /// `scope`, oldest first.
    ///
    /// Unlike [`current_value`](Self::current_value), history also
    /// includes entries written in scopes *below* the reader. This is
    /// the forEach aggregation carrier: a reader at the root sees one
    /// value per completed iteration of a fanned-out check.
    #[must_use]
    pub fn history(&self, check_id: &str, scope: &Scope) -> Vec<Value> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries
            .iter()
            .filter(|entry| {
                entry.check_id == check_id
                    && entry.status.is_success()
                    && (entry.scope.is_prefix_of(scope) || scope.is_prefix_of(&entry.scope))
            })
            .filter_map(|entry| entry.output.clone())
            .collect()
    }

    /// Whether a check has at least one successful entry observable
    /// from `scope` (ancestor or descendant, the dependency
    /// satisfaction rule, matching [`history`](Self::history)).
    #[must_use]
    pub fn has_success(&self, check_id: &str, scope: &Scope) -> bool {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.iter().any(|entry| {
            entry.check_id == check_id
                && entry.status.is_success()
                && (entry.scope.is_prefix_of(scope) || scope.is_prefix_of(&entry.scope))
        })
    }

    /// The most recent entry (any status) for a check visible at `scope`.
    #[must_use]
    pub fn latest_entry(&self, check_id: &str, scope: &Scope) -> Option<JournalEntry> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries
            .iter()
            .rev()
            .find(|entry| entry.check_id == check_id && entry.scope.is_prefix_of(scope))
            .cloned()
    }

    /// The session id recorded by the most recent successful entry of
    /// a check visible at `scope`, for AI session reuse.
    #[must_use]
    pub fn latest_session_id(&self, check_id: &str, scope: &Scope) -> Option<String> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries
            .iter()
            .rev()
            .filter(|entry| {
                entry.check_id == check_id
                    && entry.status.is_success()
                    && entry.scope.is_prefix_of(scope)
            })
            .find_map(|entry| entry.session_id.clone())
    }

    /// Whether a check was ever skipped with the given reason.
    #[must_use]
    pub fn was_skipped_with(&self, check_id: &str, reason: SkipReason) -> bool {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries
            .iter()
            .any(|entry| entry.check_id == check_id && entry.skip_reason == Some(reason))
    }

    /// A clone of every entry, in sequence order.
    #[must_use]
    pub fn all_entries(&self) -> Vec<JournalEntry> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.clone()
    }

    /// The number of entries appended so far.
    #[must_use]
    pub fn len(&self) -> usize {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.len()
    }

    /// Whether the journal is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
