//! Engine execution events.
//!
//! The engine publishes typed events through a narrow bus interface:
//! every event shares the [`EngineEvent`] envelope (id, version,
//! timestamp, run id, wave) around an [`EventPayload`]. Emission is
//! fire-and-forget: the [`EventEmitter`] trait is synchronous and must
//! not block the runner; adapters that need async delivery should
//! buffer internally.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::routing::RoutingOrigin;
use crate::scope::Scope;
use crate::types::CheckStatus;

/// Envelope schema version.
pub const EVENT_VERSION: &str = "1";

/// Top-level states of the state-machine runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Init,
    PlanReady,
    WavePlanning,
    LevelDispatch,
    CheckRunning,
    Completed,
    Error,
}

impl EngineState {
    /// Whether this state is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    /// Return the `snake_case` string matching serde serialization.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::PlanReady => "plan_ready",
            Self::WavePlanning => "wave_planning",
            Self::LevelDispatch => "level_dispatch",
            Self::CheckRunning => "check_running",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

/// The event-specific payload inside an [`EngineEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// The runner moved between states.
    StateTransition { from: EngineState, to: EngineState },
    /// A check was scheduled for execution.
    CheckScheduled { check_id: String, scope: Scope },
    /// A check finished with a journalled status.
    CheckCompleted {
        check_id: String,
        scope: Scope,
        status: CheckStatus,
    },
    /// A check failed with a provider or runtime error.
    CheckErrored {
        check_id: String,
        scope: Scope,
        error: String,
    },
    /// A routing directive requested a (re-)execution.
    ForwardRunRequested {
        target: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        goto_event: Option<String>,
        origin: RoutingOrigin,
        scope: Scope,
    },
    /// A wave-retry of `if`-skipped checks was scheduled.
    WaveRetry { reason: String },
    /// The run is shutting down.
    Shutdown {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// The common envelope published for every event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    /// Unique event id.
    pub id: Uuid,
    /// Envelope schema version.
    pub version: String,
    /// Emission timestamp.
    pub timestamp: DateTime<Utc>,
    /// The run this event belongs to.
    pub run_id: String,
    /// The nested workflow check that owns the run, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    /// The wave the event was emitted in.
    pub wave: u32,
    /// The event-specific payload.
    pub payload: EventPayload,
}

impl EngineEvent {
    /// Build an event with a fresh id and the current timestamp.
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        workflow_id: Option<String>,
        wave: u32,
        payload: EventPayload,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            version: EVENT_VERSION.to_string(),
            timestamp: Utc::now(),
            run_id: run_id.into(),
            workflow_id,
            wave,
            payload,
        }
    }
}

/// Trait for receiving engine events.
///
/// Emission is synchronous and should be non-blocking. Implementations
/// that need to do async work should buffer events for later processing.
pub trait EventEmitter: Send + Sync {
    /// Emit an engine event.
    fn emit(&self, event: EngineEvent);
}

/// A no-op event emitter that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEmitter;

impl EventEmitter for NoOpEmitter {
    fn emit(&self, _event: EngineEvent) {
        // Discard
    }
}

/// An event emitter that collects all events in-memory.
///
/// Useful for testing and post-run analysis.
pub struct CollectingEmitter {
    events: Mutex<Vec<EngineEvent>>,
}

impl CollectingEmitter {
    /// Create a new collecting emitter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    /// Return a clone of all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Return the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Check if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CollectingEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CollectingEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectingEmitter")
            .field("count", &self.len())
            .finish()
    }
}

impl EventEmitter for CollectingEmitter {
    fn emit(&self, event: EngineEvent) {
        let mut events = self
            .events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        events.push(event);
    }
}

/// An event emitter that delegates to a callback function.
///
/// The callback receives each event synchronously and should be
/// non-blocking.
pub struct ObserverEmitter {
    callback: Box<dyn Fn(&EngineEvent) + Send + Sync>,
}

impl ObserverEmitter {
    /// Create a new observer emitter with the given callback.
    pub fn new(callback: impl Fn(&EngineEvent) + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }
}

impl std::fmt::Debug for ObserverEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverEmitter").finish_non_exhaustive()
    }
}

impl EventEmitter for ObserverEmitter {
    fn emit(&self, event: EngineEvent) {
        (self.callback)(&event);
    }
}

/// An event emitter that broadcasts to multiple inner emitters.
///
/// Useful for combining collecting + observer + other emitters.
pub struct BroadcastEmitter {
    emitters: Vec<Box<dyn EventEmitter>>,
}

impl BroadcastEmitter {
    /// Create a new broadcast emitter from a list of emitters.
    #[must_use]
    pub fn new(emitters: Vec<Box<dyn EventEmitter>>) -> Self {
        Self { emitters }
    }
}

impl std::fmt::Debug for BroadcastEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastEmitter")
            .field("count", &self.emitters.len())
            .finish()
    }
}

impl EventEmitter for BroadcastEmitter {
    fn emit(&self, event: EngineEvent) {
        for emitter in &self.emitters {
            emitter.emit(event.clone());
        }
    }
}

/// Default capacity of a [`BubbleQueue`].
pub const BUBBLE_QUEUE_CAPACITY: usize = 1024;

/// A bounded queue that carries events from a nested workflow run up to
/// its parent.
///
/// The parent owns the queue and drains it at wave-planning boundaries;
/// the child pushes through a [`BubblingEmitter`]. When full, the
/// oldest event is dropped so a chatty child cannot wedge the parent.
pub struct BubbleQueue {
    inner: Mutex<VecDeque<EngineEvent>>,
    capacity: usize,
}

impl BubbleQueue {
    /// Create a queue with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(BUBBLE_QUEUE_CAPACITY)
    }

    /// Create a queue with the given capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Push an event, dropping the oldest when at capacity.
    pub fn push(&self, event: EngineEvent) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if inner.len() >= self.capacity {
            inner.pop_front();
        }
        inner.push_back(event);
    }

    /// Drain all queued events, oldest first.
    #[must_use]
    pub fn drain(&self) -> Vec<EngineEvent> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.drain(..).collect()
    }
}

impl Default for BubbleQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BubbleQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BubbleQueue")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

/// An emitter that pushes every event into a parent-owned
/// [`BubbleQueue`], stamping the owning workflow check id.
pub struct BubblingEmitter {
    queue: std::sync::Arc<BubbleQueue>,
    workflow_id: String,
}

impl BubblingEmitter {
    /// Create an emitter that bubbles into `queue`, tagging events with
    /// the owning workflow check id.
    #[must_use]
    pub fn new(queue: std::sync::Arc<BubbleQueue>, workflow_id: impl Into<String>) -> Self {
        Self {
            queue,
            workflow_id: workflow_id.into(),
        }
    }
}

impl std::fmt::Debug for BubblingEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BubblingEmitter")
            .field("workflow_id", &self.workflow_id)
            .finish_non_exhaustive()
    }
}

impl EventEmitter for BubblingEmitter {
    fn emit(&self, mut event: EngineEvent) {
        event.workflow_id.get_or_insert_with(|| self.workflow_id.clone());
        self.queue.push(event);
    }
}
