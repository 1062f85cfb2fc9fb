use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, EngineResult};

/// The built-in check types recognized by the engine.
///
/// Each variant corresponds to a provider registered in the default
/// [`ProviderRegistry`](crate::provider::ProviderRegistry). The `Display`
/// implementation produces the canonical lowercase string, and
/// `PartialEq<str>` allows ergonomic comparison with type strings from
/// configuration documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckType {
    Ai,
    Command,
    Http,
    Script,
    Memory,
    Workflow,
    Noop,
}

impl CheckType {
    /// All known check types.
    pub const ALL: &[CheckType] = &[
        Self::Ai,
        Self::Command,
        Self::Http,
        Self::Script,
        Self::Memory,
        Self::Workflow,
        Self::Noop,
    ];

    /// Return the canonical string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ai => "ai",
            Self::Command => "command",
            Self::Http => "http",
            Self::Script => "script",
            Self::Memory => "memory",
            Self::Workflow => "workflow",
            Self::Noop => "noop",
        }
    }
}

impl fmt::Display for CheckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ai" => Ok(Self::Ai),
            "command" => Ok(Self::Command),
            "http" => Ok(Self::Http),
            "script" => Ok(Self::Script),
            "memory" => Ok(Self::Memory),
            "workflow" => Ok(Self::Workflow),
            "noop" => Ok(Self::Noop),
            other => Err(EngineError::InvalidConfig {
                reason: format!("unknown check type: {other}"),
            }),
        }
    }
}

impl PartialEq<str> for CheckType {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&str> for CheckType {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

/// The final status of one check execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    /// The execution completed successfully.
    Success,
    /// The execution failed (provider error or `fail_if` predicate).
    Failed,
    /// The execution was skipped before the provider ran.
    Skipped,
}

impl CheckStatus {
    /// Whether this status represents a successful outcome.
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// Return the `snake_case` string matching serde serialization.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// Why a check execution was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The `if` guard evaluated to false. The only reason eligible for
    /// a later wave-retry.
    IfCondition,
    /// A dependency produced no visible successful entry.
    DependencyFailed,
    /// The check's triggers did not include the current event.
    TriggerMismatch,
    /// The check was excluded by run-level tag filters.
    TagFilter,
    /// The nested workflow depth limit was reached.
    DepthLimit,
    /// The routing loop counter for this check reached its limit.
    RoutingLoopLimit,
}

impl SkipReason {
    /// Return the `snake_case` string matching serde serialization.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IfCondition => "if_condition",
            Self::DependencyFailed => "dependency_failed",
            Self::TriggerMismatch => "trigger_mismatch",
            Self::TagFilter => "tag_filter",
            Self::DepthLimit => "depth_limit",
            Self::RoutingLoopLimit => "routing_loop_limit",
        }
    }
}

/// Severity of a reported issue.
///
/// Ordered from least to most severe so that `Ord` comparisons can be
/// used for thresholds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    #[default]
    Error,
    Critical,
}

impl Severity {
    /// Return the lowercase string representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            other => Err(EngineError::InvalidConfig {
                reason: format!("unknown severity: {other}"),
            }),
        }
    }
}

/// A structured issue reported by a provider inside its output value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    /// The file the issue refers to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// The 1-based line number, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,

    /// The severity of the issue.
    #[serde(default)]
    pub severity: Severity,

    /// Human-readable description.
    pub message: String,

    /// Optional rule identifier for suppression and grouping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,

    /// Whether the issue was suppressed at its source (e.g. by an
    /// inline disable comment). Suppressed issues stay in the journal
    /// but are filtered from results when suppression is enabled.
    #[serde(default)]
    pub suppressed: bool,
}

/// Extract structured issues from a provider output value.
///
/// Providers report issues as an `issues` array inside their output
/// object. Malformed elements are ignored rather than failing the
/// extraction, since output values are opaque to the engine.
#[must_use]
pub fn issues_from_value(value: &Value) -> Vec<Issue> {
    value
        .get("issues")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Per-severity issue counts exposed to expressions as `metadata`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IssueCounts {
    pub info: usize,
    pub warning: usize,
    pub error: usize,
    pub critical: usize,
    pub total: usize,
}

impl IssueCounts {
    /// Count issues by severity, excluding suppressed ones.
    #[must_use]
    pub fn tally(issues: &[Issue]) -> Self {
        let mut counts = Self::default();
        for issue in issues.iter().filter(|issue| !issue.suppressed) {
            match issue.severity {
                Severity::Info => counts.info += 1,
                Severity::Warning => counts.warning += 1,
                Severity::Error => counts.error += 1,
                Severity::Critical => counts.critical += 1,
            }
            counts.total += 1;
        }
        counts
    }

    /// The count for a single severity.
    #[must_use]
    pub fn for_severity(&self, severity: Severity) -> usize {
        match severity {
            Severity::Info => self.info,
            Severity::Warning => self.warning,
            Severity::Error => self.error,
            Severity::Critical => self.critical,
        }
    }
}

/// Pull request (or issue) context threaded into providers and
/// expressions.
///
/// All fields are optional so that runs outside a PR context (e.g.
/// manual invocations) work with an empty default.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PrInfo {
    /// PR number, if the run is attached to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<u64>,

    /// PR title.
    #[serde(default)]
    pub title: String,

    /// PR body / description.
    #[serde(default)]
    pub body: String,

    /// Author login.
    #[serde(default)]
    pub author: String,

    /// Author association with the repository (`OWNER`, `MEMBER`,
    /// `COLLABORATOR`, `CONTRIBUTOR`, ...). Drives the permission
    /// helpers in expressions.
    #[serde(default)]
    pub author_association: String,

    /// Repository permission level of the author (`read`, `triage`,
    /// `write`, `maintain`, `admin`), when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_permission: Option<String>,

    /// Head branch name.
    #[serde(default)]
    pub head_branch: String,

    /// Base branch name.
    #[serde(default)]
    pub base_branch: String,

    /// Paths of files changed in the PR, used by `hasFileMatching`.
    #[serde(default)]
    pub files: Vec<String>,
}

impl PrInfo {
    /// Whether the author owns the repository.
    #[must_use]
    pub fn is_owner(&self) -> bool {
        self.author_association.eq_ignore_ascii_case("OWNER")
    }

    /// Whether the author is an owner, member, or collaborator.
    #[must_use]
    pub fn is_member(&self) -> bool {
        ["OWNER", "MEMBER", "COLLABORATOR"]
            .iter()
            .any(|assoc| self.author_association.eq_ignore_ascii_case(assoc))
    }

    /// Whether the author's permission level is at least `level`.
    ///
    /// Unknown permission levels (on either side) compare as false.
    #[must_use]
    pub fn has_min_permission(&self, level: &str) -> bool {
        const ORDER: &[&str] = &["read", "triage", "write", "maintain", "admin"];
        let rank = |s: &str| ORDER.iter().position(|p| s.eq_ignore_ascii_case(p));
        match (self.author_permission.as_deref().and_then(rank), rank(level)) {
            (Some(have), Some(want)) => have >= want,
            _ => false,
        }
    }
}

/// A duration parsed from configuration strings like `"250ms"`, `"15m"`, `"2h"`.
///
/// Wraps [`std::time::Duration`] with config-compatible parsing and display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Duration(std::time::Duration);

impl Duration {
    /// Parse a duration from a configuration string.
    ///
    /// Supported suffixes: `ms` (milliseconds), `s` (seconds), `m` (minutes),
    /// `h` (hours), `d` (days).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] if the string cannot be parsed.
    pub fn from_config_str(s: &str) -> EngineResult<Self> {
        let (value, unit) = if let Some(rest) = s.strip_suffix("ms") {
            (rest, "ms")
        } else if let Some(rest) = s.strip_suffix('s') {
            (rest, "s")
        } else if let Some(rest) = s.strip_suffix('m') {
            (rest, "m")
        } else if let Some(rest) = s.strip_suffix('h') {
            (rest, "h")
        } else if let Some(rest) = s.strip_suffix('d') {
            (rest, "d")
        } else {
            return Err(EngineError::InvalidConfig {
                reason: format!("invalid duration string: {s}"),
            });
        };

        let n: u64 = value.parse().map_err(|_| EngineError::InvalidConfig {
            reason: format!("invalid duration number: {s}"),
        })?;

        let millis = match unit {
            "ms" => Some(n),
            "s" => n.checked_mul(1_000),
            "m" => n.checked_mul(60_000),
            "h" => n.checked_mul(3_600_000),
            "d" => n.checked_mul(86_400_000),
            _ => unreachable!(),
        };

        let millis = millis.ok_or_else(|| EngineError::InvalidConfig {
            reason: format!("duration overflow: {s}"),
        })?;

        Ok(Self(std::time::Duration::from_millis(millis)))
    }

    /// A duration of the given number of milliseconds.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(std::time::Duration::from_millis(millis))
    }

    /// Return the inner [`std::time::Duration`].
    #[must_use]
    pub fn inner(self) -> std::time::Duration {
        self.0
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.0.as_millis();
        if ms == 0 {
            return f.write_str("0ms");
        }

        let ms_u64 = u64::try_from(ms).unwrap_or(u64::MAX);

        if ms_u64 % 86_400_000 == 0 {
            write!(f, "{}d", ms_u64 / 86_400_000)
        } else if ms_u64 % 3_600_000 == 0 {
            write!(f, "{}h", ms_u64 / 3_600_000)
        } else if ms_u64 % 60_000 == 0 {
            write!(f, "{}m", ms_u64 / 60_000)
        } else if ms_u64 % 1_000 == 0 {
            write!(f, "{}s", ms_u64 / 1_000)
        } else {
            write!(f, "{ms_u64}ms")
        }
    }
}

impl Serialize for Duration {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_config_str(&s).map_err(serde::de::Error::custom)
    }
}
