//! Execution scopes for forEach fanout.
//!
//! A [`Scope`] identifies a position inside nested forEach fanouts as an
//! ordered sequence of `(check_id, item_index)` pairs. The root scope is
//! the empty sequence. Visibility between journal entries and readers is
//! defined by prefix containment: an entry written at scope `S` is
//! visible to a reader at scope `S'` iff `S` is a (non-strict) prefix
//! of `S'`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One fanout step: the forEach check and the item index within its
/// output sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeSegment {
    /// The forEach check that produced the item sequence.
    pub check_id: String,
    /// Zero-based index into that sequence.
    pub index: usize,
}

/// An ordered sequence of fanout steps; empty at the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope(Vec<ScopeSegment>);

impl Scope {
    /// The root scope (no fanout).
    #[must_use]
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Whether this is the root scope.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// The fanout segments, outermost first.
    #[must_use]
    pub fn segments(&self) -> &[ScopeSegment] {
        &self.0
    }

    /// Extend this scope with one more fanout step.
    #[must_use]
    pub fn child(&self, check_id: impl Into<String>, index: usize) -> Self {
        let mut segments = self.0.clone();
        segments.push(ScopeSegment {
            check_id: check_id.into(),
            index,
        });
        Self(segments)
    }

    /// Whether this scope is a (non-strict) prefix of `other`.
    ///
    /// This is the visibility rule: an entry at scope `S` is observable
    /// by a reader at `S'` iff `S.is_prefix_of(S')`.
    #[must_use]
    pub fn is_prefix_of(&self, other: &Scope) -> bool {
        self.0.len() <= other.0.len() && other.0[..self.0.len()] == self.0[..]
    }

    /// The item index this scope pins for a given forEach check, if any.
    ///
    /// Used to substitute a single item for the parent's full output
    /// sequence when gathering dependency results inside a fanout.
    #[must_use]
    pub fn item_index_for(&self, check_id: &str) -> Option<usize> {
        self.0
            .iter()
            .rev()
            .find(|segment| segment.check_id == check_id)
            .map(|segment| segment.index)
    }

    /// A stable string key for dedup sets.
    #[must_use]
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.0 {
            write!(f, "/{}[{}]", segment.check_id, segment.index)?;
        }
        Ok(())
    }
}

impl From<Vec<ScopeSegment>> for Scope {
    fn from(segments: Vec<ScopeSegment>) -> Self {
        Self(segments)
    }
}
