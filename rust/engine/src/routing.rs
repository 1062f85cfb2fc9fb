//! Routing decisions.
//!
//! Given a freshly completed journal entry and its check spec, computes
//! the requested routing actions: a backward `goto` to a transitive
//! ancestor (preemptive: the current wave's remaining levels are
//! dropped) or forward `run` targets (non-preemptive: honored once the
//! wave drains). Directives whose expressions fail to compile or
//! evaluate become no-ops; the failure is traced, never raised.
//!
//! Dedup guards and loop counters are applied by the runner when it
//! admits requests into the event queue, inside the single-threaded
//! planning step.

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::expr::{CompiledExpr, EvalInput, RunTargetSpec};
use crate::journal::JournalEntry;
use crate::scope::Scope;
use crate::spec::{CheckSpec, RoutingDirective};
use crate::types::CheckStatus;

/// Which directive produced a forward-run request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingOrigin {
    /// A backward jump to an ancestor; preempts the current wave.
    Goto,
    /// A forward fanout to successors; processed after the wave drains.
    Run,
}

/// A request to (re-)execute a check at a future wave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRunRequest {
    /// The check to execute.
    pub target: String,
    /// The trigger event the execution will run under.
    pub event: String,
    /// Which directive produced the request.
    pub origin: RoutingOrigin,
    /// The scope of the requesting execution (dedup key component).
    pub scope: Scope,
    /// Explicit target scope from a per-item run descriptor, when the
    /// fanout is directed at a particular item index.
    pub explicit_scope: Option<Scope>,
    /// The check whose directive produced the request (loop-counter
    /// key component).
    pub initiator: String,
}

impl ForwardRunRequest {
    /// The dedup key: a request is honored at most once per
    /// `(target, event, wave, scope)`.
    #[must_use]
    pub fn guard_key(&self, wave: u32) -> (String, String, u32, String) {
        (
            self.target.clone(),
            self.event.clone(),
            wave,
            self.scope.key(),
        )
    }
}

/// Compute the routing requests for a completed entry.
///
/// Rules, in order: a successful entry consults `on_success`, a failed
/// entry `on_fail`, a skipped entry routes nowhere. `goto` targets must
/// be transitive ancestors of the check; others are rejected and
/// traced. Expression failures yield no requests.
#[must_use]
pub fn decide_routing(
    spec: &CheckSpec,
    entry: &JournalEntry,
    input: &EvalInput<'_>,
    ancestors: &IndexSet<String>,
    event: &str,
) -> Vec<ForwardRunRequest> {
    let directive = match entry.status {
        CheckStatus::Success => spec.on_success.as_ref(),
        CheckStatus::Failed => spec.on_fail.as_ref(),
        CheckStatus::Skipped => None,
    };
    let Some(directive) = directive else {
        return Vec::new();
    };

    let mut requests = Vec::new();

    if let Some(target) = goto_target(spec, directive, input) {
        if ancestors.contains(&target) {
            requests.push(ForwardRunRequest {
                target,
                event: event.to_string(),
                origin: RoutingOrigin::Goto,
                scope: entry.scope.clone(),
                explicit_scope: None,
                initiator: spec.id.clone(),
            });
        } else {
            tracing::warn!(
                target: "proctor::routing",
                check_id = %spec.id,
                goto = %target,
                "goto target is not an ancestor; directive rejected",
            );
        }
    }

    for run_target in run_targets(spec, directive, input) {
        let request = ForwardRunRequest {
            target: run_target.target,
            event: event.to_string(),
            origin: RoutingOrigin::Run,
            scope: entry.scope.clone(),
            explicit_scope: run_target.scope.map(Scope::from),
            initiator: spec.id.clone(),
        };
        // One request per unique target within this decision.
        if !requests
            .iter()
            .any(|existing: &ForwardRunRequest| {
                existing.origin == RoutingOrigin::Run
                    && existing.target == request.target
                    && existing.explicit_scope == request.explicit_scope
            })
        {
            requests.push(request);
        }
    }

    requests
}

/// Resolve the static or dynamic goto target, if any.
fn goto_target(
    spec: &CheckSpec,
    directive: &RoutingDirective,
    input: &EvalInput<'_>,
) -> Option<String> {
    if let Some(target) = &directive.goto {
        return Some(target.clone());
    }
    let source = directive.goto_js.as_deref()?;
    match CompiledExpr::compile(source) {
        Ok(compiled) => compiled.evaluate_goto(input),
        Err(error) => {
            tracing::warn!(
                target: "proctor::routing",
                check_id = %spec.id,
                %error,
                "goto_js failed to compile; directive ignored",
            );
            None
        }
    }
}

/// Resolve the static and dynamic run targets.
fn run_targets(
    spec: &CheckSpec,
    directive: &RoutingDirective,
    input: &EvalInput<'_>,
) -> Vec<RunTargetSpec> {
    let mut targets: Vec<RunTargetSpec> = directive
        .run
        .iter()
        .map(|target| RunTargetSpec::plain(target.clone()))
        .collect();

    if let Some(source) = directive.run_js.as_deref() {
        match CompiledExpr::compile(source) {
            Ok(compiled) => targets.extend(compiled.evaluate_run_targets(input)),
            Err(error) => {
                tracing::warn!(
                    target: "proctor::routing",
                    check_id = %spec.id,
                    %error,
                    "run_js failed to compile; directive ignored",
                );
            }
        }
    }

    targets
}
