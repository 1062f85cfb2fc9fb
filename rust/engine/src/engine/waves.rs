//! Wave planning.
//!
//! Runs at the boundary between waves, inside the runner's
//! single-threaded planning step. Consumes the pending routing events
//! (plus the initial plan on the first call), deduplicated and
//! loop-limited at admission time, and rebuilds the level queue for the
//! next wave: requested targets, their transitive dependencies
//! (excluding pure memory-initializer checks), and their transitive
//! dependents filtered by the requested event. With no forward events
//! pending, accumulated `on_finish` requests re-queue checks previously
//! skipped by their `if` guard, and nothing else.

use std::collections::HashSet;
use std::collections::VecDeque;

use indexmap::{IndexMap, IndexSet};

use crate::error::EngineResult;
use crate::events::{EngineState, EventPayload};
use crate::planner::{self, ExecutionPlan};
use crate::routing::{ForwardRunRequest, RoutingOrigin};
use crate::runtime::Runtime;
use crate::scope::Scope;
use crate::types::{CheckType, SkipReason};

use super::ScheduledCheck;

/// Mutable state carried through the runner's loop.
pub(crate) struct RunState {
    /// Current state-machine position.
    pub state: EngineState,
    /// Planning epoch; 0 until the first wave is enqueued.
    pub wave: u32,
    /// The trigger event executions in the current wave run under.
    pub current_event: String,
    /// Levels remaining in the current wave.
    pub level_queue: VecDeque<Vec<ScheduledCheck>>,
    /// The initial plan, consumed by the first wave.
    pub pending_initial: Option<ExecutionPlan>,
    /// Admitted routing requests awaiting the next wave.
    pub event_queue: VecDeque<ForwardRunRequest>,
    /// Dedup guards: `(target, event, wave, scope)` honored at most
    /// once per wave.
    pub forward_guards: HashSet<(String, String, u32, String)>,
    /// Backward-jump counters keyed by `(target, initiator)`.
    pub goto_counters: IndexMap<(String, String), u32>,
    /// Whether a completed check requested an `on_finish` wave-retry.
    pub on_finish_pending: bool,
    /// Whether a halting `fail_if` match triggered fail-fast.
    pub fail_fast_triggered: bool,
}

impl RunState {
    pub(crate) fn new(event: String, plan: ExecutionPlan) -> Self {
        Self {
            state: EngineState::Init,
            wave: 0,
            current_event: event,
            level_queue: VecDeque::new(),
            pending_initial: Some(plan),
            event_queue: VecDeque::new(),
            forward_guards: HashSet::new(),
            goto_counters: IndexMap::new(),
            on_finish_pending: false,
            fail_fast_triggered: false,
        }
    }

    /// Admit routing requests produced by a completed level, applying
    /// the dedup guards and goto loop limits. Returns whether a
    /// preemptive `goto` was admitted (the caller clears the remaining
    /// level queue).
    pub(crate) fn admit_requests(
        &mut self,
        runtime: &Runtime,
        requests: Vec<ForwardRunRequest>,
    ) -> bool {
        let mut preempt = false;

        for request in requests {
            if !self.forward_guards.insert(request.guard_key(self.wave)) {
                tracing::debug!(
                    target: "proctor::waves",
                    target_check = %request.target,
                    "duplicate forward-run request dropped",
                );
                continue;
            }

            if request.origin == RoutingOrigin::Goto {
                let counter = self
                    .goto_counters
                    .entry((request.target.clone(), request.initiator.clone()))
                    .or_insert(0);
                *counter += 1;
                if *counter > runtime.options.max_routing_loops {
                    // The loop-initiating check is marked, not the
                    // target: the target already ran its allowed turns.
                    runtime.skip_check(
                        &request.initiator,
                        self.wave,
                        request.scope.clone(),
                        SkipReason::RoutingLoopLimit,
                    );
                    continue;
                }
                preempt = true;
            }

            runtime.emit(
                self.wave,
                EventPayload::ForwardRunRequested {
                    target: request.target.clone(),
                    goto_event: (request.origin == RoutingOrigin::Goto)
                        .then(|| request.event.clone()),
                    origin: request.origin,
                    scope: request.scope.clone(),
                },
            );
            self.event_queue.push_back(request);
        }

        preempt
    }
}

/// Plan the next wave. Returns `true` when work was enqueued and
/// `false` when the run has reached its fixed point.
///
/// # Errors
///
/// Returns an error if a forward-run sub-graph cannot be planned
/// (cycle within the requested subset).
pub(crate) fn plan_next_wave(state: &mut RunState, runtime: &Runtime) -> EngineResult<bool> {
    if state.fail_fast_triggered {
        return Ok(false);
    }

    // First wave: the initial plan.
    if let Some(plan) = state.pending_initial.take() {
        state.wave = 1;
        for level in plan.levels {
            state
                .level_queue
                .push_back(level.into_iter().map(ScheduledCheck::plain).collect());
        }
        return Ok(true);
    }

    // Forward-run requests (goto preemption already cleared any
    // remaining levels when the request was admitted).
    let requests: Vec<ForwardRunRequest> = state.event_queue.drain(..).collect();
    if !requests.is_empty() {
        let plan = plan_forward_wave(runtime, &requests)?;
        state.wave += 1;
        state.current_event = requests[0].event.clone();
        for level in plan {
            state.level_queue.push_back(level);
        }
        return Ok(true);
    }

    // Wave-retry: re-evaluate checks whose latest entry is an
    // `if`-guard skip. Their dependency trees are not re-run.
    if state.on_finish_pending {
        state.on_finish_pending = false;
        let root = Scope::root();
        let gated: Vec<ScheduledCheck> = runtime
            .specs
            .keys()
            .filter(|id| {
                runtime
                    .journal
                    .latest_entry(id, &root)
                    .is_some_and(|entry| entry.skip_reason == Some(SkipReason::IfCondition))
            })
            .cloned()
            .map(ScheduledCheck::plain)
            .collect();
        if !gated.is_empty() {
            state.wave += 1;
            runtime.emit(
                state.wave,
                EventPayload::WaveRetry {
                    reason: "on_finish".to_string(),
                },
            );
            state.level_queue.push_back(gated);
            return Ok(true);
        }
    }

    Ok(false)
}

/// Build the levels for a forward-run wave from the admitted requests.
///
/// The sub-graph spans the union of requested targets, their transitive
/// dependencies (minus memory-initializer checks that are not
/// themselves targets, so counters survive re-runs), and their
/// transitive dependents filtered by the requested event. Catalog order
/// keeps the result deterministic.
fn plan_forward_wave(
    runtime: &Runtime,
    requests: &[ForwardRunRequest],
) -> EngineResult<Vec<Vec<ScheduledCheck>>> {
    let mut selected: IndexSet<String> = IndexSet::new();
    let mut pinned: IndexMap<String, Scope> = IndexMap::new();

    for request in requests {
        // Targets are always selected, even memory checks; the
        // exclusion below only concerns pulled-in ancestors.
        selected.insert(request.target.clone());
        if let Some(scope) = &request.explicit_scope {
            pinned.insert(request.target.clone(), scope.clone());
        }

        if let Some(ancestors) = runtime.ancestors.get(&request.target) {
            for dep in ancestors {
                let is_memory_initializer = runtime
                    .specs
                    .get(dep)
                    .is_some_and(|spec| spec.check_type == CheckType::Memory);
                if !is_memory_initializer {
                    selected.insert(dep.clone());
                }
            }
        }

        for dependent in planner::descendants(&runtime.specs, &request.target) {
            let eligible = runtime
                .specs
                .get(&dependent)
                .is_some_and(|spec| spec.triggered_by(&request.event));
            if eligible {
                selected.insert(dependent);
            }
        }
    }

    // Memory-initializer ancestors pulled in as targets stay; ordered
    // by catalog position for determinism.
    let ordered: IndexSet<String> = runtime
        .specs
        .keys()
        .filter(|id| selected.contains(*id))
        .cloned()
        .collect();

    let plan = planner::plan(&runtime.specs, &ordered)?;

    Ok(plan
        .levels
        .into_iter()
        .map(|level| {
            level
                .into_iter()
                .map(|check_id| {
                    let pinned_scope = pinned.get(&check_id).cloned();
                    ScheduledCheck {
                        check_id,
                        pinned_scope,
                    }
                })
                .collect()
        })
        .collect())
}
