//! State-machine runner.
//!
//! The top-level loop over Init → PlanReady → WavePlanning →
//! LevelDispatch → CheckRunning → … → Completed | Error. Owns
//! cancellation, the event bus, statistics collection, and
//! nested-workflow event bubbling. Planning (wave building, request
//! admission, counters) is single-threaded; only level dispatch fans
//! out.

use std::sync::Arc;

use chrono::Utc;
use indexmap::IndexMap;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::events::{EngineState, EventPayload};
use crate::journal::{EntryError, Journal, JournalEntry};
use crate::planner;
use crate::results::{self, DebugRecord, RunResult};
use crate::runtime::{ExecReport, Runtime};
use crate::scope::Scope;
use crate::spec::CheckSpec;
use crate::types::CheckStatus;

use super::waves::{self, RunState};
use super::{EngineConfig, RunOptions, dispatcher};

/// Execute a validated catalog to completion.
pub(crate) async fn run_engine(
    checks: IndexMap<String, CheckSpec>,
    config: EngineConfig,
    run: RunOptions,
) -> EngineResult<RunResult> {
    let run_id = run.run_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let specs = Arc::new(checks);
    let journal = Arc::new(Journal::new());

    let mut runtime = Runtime::new(
        Arc::clone(&specs),
        Arc::clone(&journal),
        config.providers,
        config.emitter,
        config.memory,
        config.options,
        config.pr,
        run_id,
        None,
        run.depth,
    );
    runtime.include_tags = run.include_tags;
    runtime.exclude_tags = run.exclude_tags;
    runtime.debug = run.debug;
    let runtime = Arc::new(runtime);

    let cancel = run.cancel.unwrap_or_default();
    let deadline = run
        .timeout
        .map(|timeout| std::time::Instant::now() + timeout.inner());

    let mut debug_records: Option<Vec<DebugRecord>> = run.debug.then(Vec::new);

    // -- Init: build the plan --
    let plan = match planner::plan_all(&specs) {
        Ok(plan) => plan,
        Err(EngineError::PlanningCycle { nodes }) => {
            // A cycle aborts planning, but callers still get a
            // structured report: synthesize one failed entry for a
            // cycle node so statistics surface it.
            synthesize_cycle_entry(&runtime, &nodes);
            transition(&runtime, 0, EngineState::Init, EngineState::Completed);
            return Ok(results::collect(
                &specs,
                &journal,
                &runtime.options,
                debug_records,
            ));
        }
        Err(other) => {
            transition(&runtime, 0, EngineState::Init, EngineState::Error);
            return Err(other);
        }
    };

    let mut state = RunState::new(run.event, plan);
    transition(&runtime, 0, EngineState::Init, EngineState::PlanReady);
    state.state = EngineState::PlanReady;

    // -- Main loop --
    'run: loop {
        set_state(&runtime, &mut state, EngineState::WavePlanning);

        // Drain events bubbled from nested workflow runs; they re-emit
        // on this run's bus at the planning boundary.
        for event in runtime.bubble.drain() {
            runtime.emitter.emit(event);
        }

        if let Some(reason) = shutdown_reason(&cancel, deadline) {
            shutdown(&runtime, &mut state, &cancel, reason);
            break 'run;
        }

        let has_work = match waves::plan_next_wave(&mut state, &runtime) {
            Ok(has_work) => has_work,
            Err(error) => {
                set_state(&runtime, &mut state, EngineState::Error);
                return Err(error);
            }
        };
        if !has_work {
            set_state(&runtime, &mut state, EngineState::Completed);
            break 'run;
        }

        set_state(&runtime, &mut state, EngineState::LevelDispatch);
        let wave_event = state.current_event.clone();

        while let Some(level) = state.level_queue.pop_front() {
            set_state(&runtime, &mut state, EngineState::CheckRunning);
            let reports =
                dispatcher::run_level(&runtime, level, state.wave, &wave_event, &cancel).await;
            set_state(&runtime, &mut state, EngineState::LevelDispatch);

            let preempt = process_reports(&runtime, &mut state, reports, &mut debug_records);

            if state.fail_fast_triggered {
                // Stop scheduling; in-flight work already drained at
                // the level barrier.
                state.level_queue.clear();
                set_state(&runtime, &mut state, EngineState::Completed);
                break 'run;
            }
            if preempt {
                // A goto preempts the remaining levels of this wave.
                state.level_queue.clear();
                break;
            }
            if let Some(reason) = shutdown_reason(&cancel, deadline) {
                shutdown(&runtime, &mut state, &cancel, reason);
                break 'run;
            }
        }
    }

    // Sessions never outlive the run.
    runtime.sessions.clear();

    Ok(results::collect(
        &specs,
        &journal,
        &runtime.options,
        debug_records,
    ))
}

/// Process the reports of one completed level inside the planning
/// step. Returns whether a preemptive goto was admitted.
fn process_reports(
    runtime: &Runtime,
    state: &mut RunState,
    reports: Vec<ExecReport>,
    debug_records: &mut Option<Vec<DebugRecord>>,
) -> bool {
    let mut preempt = false;

    for report in reports {
        if let (Some(records), Some(debug)) = (debug_records.as_mut(), report.debug) {
            records.push(debug);
        }
        if report.on_finish {
            state.on_finish_pending = true;
        }
        if report.halt && runtime.options.fail_fast {
            state.fail_fast_triggered = true;
        }
        preempt |= state.admit_requests(runtime, report.requests);
    }

    preempt
}

/// Append the synthesized failed entry for a planning cycle.
fn synthesize_cycle_entry(runtime: &Runtime, nodes: &[String]) {
    let check_id = nodes.first().cloned().unwrap_or_else(|| "-".to_string());
    let error = EngineError::PlanningCycle {
        nodes: nodes.to_vec(),
    };
    let now = Utc::now();
    runtime.journal.append(JournalEntry {
        sequence: 0,
        check_id: check_id.clone(),
        wave: 0,
        scope: Scope::root(),
        attempt: 1,
        status: CheckStatus::Failed,
        skip_reason: None,
        started_at: now,
        ended_at: now,
        duration_ms: 0,
        output: None,
        error: Some(EntryError::from_engine(&error)),
        session_id: None,
    });
    runtime.emit(
        0,
        EventPayload::CheckErrored {
            check_id,
            scope: Scope::root(),
            error: error.to_string(),
        },
    );
}

/// The shutdown reason, when the run should stop.
fn shutdown_reason(
    cancel: &crate::cancel::CancelToken,
    deadline: Option<std::time::Instant>,
) -> Option<String> {
    if cancel.is_cancelled() {
        return Some("cancelled".to_string());
    }
    if deadline.is_some_and(|deadline| std::time::Instant::now() >= deadline) {
        return Some("global timeout exceeded".to_string());
    }
    None
}

/// Emit the shutdown event, signal providers, and finish the run.
fn shutdown(
    runtime: &Runtime,
    state: &mut RunState,
    cancel: &crate::cancel::CancelToken,
    reason: String,
) {
    cancel.cancel();
    runtime.emit(
        state.wave,
        EventPayload::Shutdown {
            error: Some(reason),
        },
    );
    state.level_queue.clear();
    set_state(runtime, state, EngineState::Completed);
}

/// Transition the state machine, emitting the event.
fn set_state(runtime: &Runtime, state: &mut RunState, to: EngineState) {
    if state.state == to {
        return;
    }
    transition(runtime, state.wave, state.state, to);
    state.state = to;
}

fn transition(runtime: &Runtime, wave: u32, from: EngineState, to: EngineState) {
    runtime.emit(wave, EventPayload::StateTransition { from, to });
}
