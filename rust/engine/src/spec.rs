//! Immutable check definitions.
//!
//! A [`CheckSpec`] is the engine-facing form of one entry in the
//! configuration document's `checks` map: its provider type, dependency
//! tokens, triggers, guard and failure expressions, routing directives,
//! and retry policy. Specs are created once at run initialization and
//! never mutated.

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::types::{CheckType, Duration, Severity};

/// One `depends_on` token: either a single check id or an `A|B|…`
/// OR-group where at least one alternative must have succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DependsToken {
    /// A single required dependency.
    One(String),
    /// An OR-group of alternatives; satisfied when any one has a
    /// visible successful entry.
    AnyOf(Vec<String>),
}

impl DependsToken {
    /// Parse a token string, splitting on `|` for OR-groups.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] for empty tokens or empty
    /// alternatives (`"a||b"`).
    pub fn parse(token: &str) -> EngineResult<Self> {
        let token = token.trim();
        if token.is_empty() {
            return Err(EngineError::InvalidConfig {
                reason: "empty depends_on token".to_string(),
            });
        }
        if !token.contains('|') {
            return Ok(Self::One(token.to_string()));
        }
        let alternatives: Vec<String> = token.split('|').map(|s| s.trim().to_string()).collect();
        if alternatives.iter().any(String::is_empty) {
            return Err(EngineError::InvalidConfig {
                reason: format!("empty alternative in depends_on token `{token}`"),
            });
        }
        Ok(Self::AnyOf(alternatives))
    }

    /// All check ids this token can be satisfied by.
    #[must_use]
    pub fn alternatives(&self) -> &[String] {
        match self {
            Self::One(id) => std::slice::from_ref(id),
            Self::AnyOf(ids) => ids,
        }
    }
}

impl fmt::Display for DependsToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::One(id) => f.write_str(id),
            Self::AnyOf(ids) => f.write_str(&ids.join("|")),
        }
    }
}

impl Serialize for DependsToken {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DependsToken {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A named `fail_if` predicate with severity and halt flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailCondition {
    /// The predicate expression; truthy means the execution failed.
    #[serde(alias = "expr")]
    pub condition: String,

    /// Severity recorded when the predicate matches.
    #[serde(default)]
    pub severity: Severity,

    /// Whether a match should halt the whole run (under `fail_fast`).
    #[serde(default, alias = "halt_execution")]
    pub halt: bool,
}

impl FailCondition {
    /// A plain condition with default severity and no halt.
    #[must_use]
    pub fn new(condition: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            severity: Severity::default(),
            halt: false,
        }
    }
}

/// Routing directives attached to `on_success` / `on_fail`.
///
/// `goto`/`goto_js` target a single transitive ancestor (a backward
/// jump); `run`/`run_js` target one or more successors (a forward
/// fanout). The `_js` variants are expressions evaluated against the
/// completed entry.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RoutingDirective {
    /// Static backward jump target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goto: Option<String>,

    /// Dynamic backward jump: expression returning a check id or null.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goto_js: Option<String>,

    /// Static forward run targets.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub run: Vec<String>,

    /// Dynamic forward run: expression returning a list of targets
    /// (strings or `{target, scope}` descriptors).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_js: Option<String>,
}

impl RoutingDirective {
    /// Whether the directive carries no routing at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.goto.is_none() && self.goto_js.is_none() && self.run.is_empty() && self.run_js.is_none()
    }
}

/// How an AI check reuses a parent check's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Clone the parent conversation so this branch cannot pollute it.
    #[default]
    Clone,
    /// Append to the parent handle directly; faster, weaker isolation.
    Append,
}

/// Retry policy for provider invocations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySpec {
    /// Maximum number of attempts (including the initial attempt).
    #[serde(default = "RetrySpec::default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry.
    #[serde(default = "RetrySpec::default_base_delay")]
    pub base_delay: Duration,

    /// Multiplier applied to the delay after each retry.
    #[serde(default = "RetrySpec::default_backoff")]
    pub backoff: f64,

    /// Whether to apply random jitter to delays. Off by default so
    /// that re-runs with identical inputs are reproducible.
    #[serde(default)]
    pub jitter: bool,
}

impl RetrySpec {
    fn default_max_attempts() -> u32 {
        1
    }

    fn default_base_delay() -> Duration {
        Duration::from_millis(200)
    }

    fn default_backoff() -> f64 {
        2.0
    }
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            base_delay: Self::default_base_delay(),
            backoff: Self::default_backoff(),
            jitter: false,
        }
    }
}

/// An immutable check definition, keyed by its id within a run.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckSpec {
    /// Unique id within the run.
    pub id: String,

    /// Provider type executing this check.
    pub check_type: CheckType,

    /// Ordered dependency tokens.
    pub depends_on: Vec<DependsToken>,

    /// Event names that activate this check; empty means always
    /// eligible.
    pub triggers: Vec<String>,

    /// Optional guard expression; falsy skips the check.
    pub if_expr: Option<String>,

    /// Named failure predicates evaluated against the produced output.
    pub fail_if: IndexMap<String, FailCondition>,

    /// Routing evaluated when the execution succeeds.
    pub on_success: Option<RoutingDirective>,

    /// Routing evaluated when the execution fails.
    pub on_fail: Option<RoutingDirective>,

    /// Whether completing this check requests a wave-retry of checks
    /// previously skipped by their `if` guard, once the wave drains.
    pub on_finish: bool,

    /// Whether this check's output is an ordered item sequence that
    /// fans out its dependents one sub-execution per item.
    pub for_each: bool,

    /// Result grouping key; defaults to the check id.
    pub group: Option<String>,

    /// Tags matched against run-level include/exclude filters.
    pub tags: Vec<String>,

    /// Per-check execution timeout.
    pub timeout: Option<Duration>,

    /// Retry policy; default is a single attempt.
    pub retry: RetrySpec,

    /// Parent check whose AI session this check reuses.
    pub reuse_session: Option<String>,

    /// How the parent session is reused.
    pub session_mode: SessionMode,

    /// Opaque provider configuration, passed through verbatim.
    pub provider_config: Value,
}

impl CheckSpec {
    /// Create a minimal spec of the given type with defaults for
    /// everything else.
    #[must_use]
    pub fn new(id: impl Into<String>, check_type: CheckType) -> Self {
        Self {
            id: id.into(),
            check_type,
            depends_on: Vec::new(),
            triggers: Vec::new(),
            if_expr: None,
            fail_if: IndexMap::new(),
            on_success: None,
            on_fail: None,
            on_finish: false,
            for_each: false,
            group: None,
            tags: Vec::new(),
            timeout: None,
            retry: RetrySpec::default(),
            reuse_session: None,
            session_mode: SessionMode::default(),
            provider_config: Value::Null,
        }
    }

    /// All check ids this spec depends on, across every token.
    pub fn dependency_ids(&self) -> impl Iterator<Item = &str> {
        self.depends_on
            .iter()
            .flat_map(|token| token.alternatives())
            .map(String::as_str)
    }

    /// Whether this check is eligible for the given trigger event.
    #[must_use]
    pub fn triggered_by(&self, event: &str) -> bool {
        self.triggers.is_empty() || self.triggers.iter().any(|t| t == event)
    }

    /// The result grouping key (explicit group or the check id).
    #[must_use]
    pub fn group_key(&self) -> &str {
        self.group.as_deref().unwrap_or(&self.id)
    }

    // -- Builder-style helpers, used heavily in tests --

    /// Add dependency tokens parsed from strings.
    ///
    /// # Panics
    ///
    /// Panics on malformed tokens; intended for statically known
    /// strings (use [`DependsToken::parse`] for user input).
    #[must_use]
    pub fn with_depends_on(mut self, tokens: &[&str]) -> Self {
        self.depends_on = tokens
            .iter()
            .map(|token| {
                DependsToken::parse(token).unwrap_or_else(|_| panic!("invalid token: {token}"))
            })
            .collect();
        self
    }

    /// Set the guard expression.
    #[must_use]
    pub fn with_if(mut self, expr: impl Into<String>) -> Self {
        self.if_expr = Some(expr.into());
        self
    }

    /// Set the provider configuration.
    #[must_use]
    pub fn with_config(mut self, config: Value) -> Self {
        self.provider_config = config;
        self
    }

    /// Set the success routing directive.
    #[must_use]
    pub fn with_on_success(mut self, directive: RoutingDirective) -> Self {
        self.on_success = Some(directive);
        self
    }

    /// Set the failure routing directive.
    #[must_use]
    pub fn with_on_fail(mut self, directive: RoutingDirective) -> Self {
        self.on_fail = Some(directive);
        self
    }

    /// Mark the check as a forEach parent.
    #[must_use]
    pub fn with_for_each(mut self) -> Self {
        self.for_each = true;
        self
    }
}

impl FromStr for DependsToken {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
