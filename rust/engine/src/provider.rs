//! Provider contract and registry.
//!
//! A provider executes one check type. The engine never looks into a
//! provider's inner state: it hands over the PR context, the opaque
//! provider configuration from the check spec, the visible dependency
//! results, and an [`ExecContext`], and receives back an output value
//! or a structured error.

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::Semaphore;

use proctor_memory::MemoryStore;

use crate::cancel::CancelToken;
use crate::config::EngineOptions;
use crate::error::EngineResult;
use crate::events::BubbleQueue;
use crate::journal::Journal;
use crate::scope::Scope;
use crate::session::SessionRegistry;
use crate::spec::SessionMode;
use crate::types::{CheckType, PrInfo};

/// Resolved session-reuse declaration for an AI check.
#[derive(Debug, Clone)]
pub struct SessionReuse {
    /// The parent check's recorded session id.
    pub parent_session_id: String,
    /// How the parent session is reused.
    pub mode: SessionMode,
}

/// Per-execution context threaded into providers.
#[derive(Clone)]
pub struct ExecContext {
    /// The check being executed.
    pub check_id: String,
    /// forEach position of this execution.
    pub scope: Scope,
    /// Planning epoch of this execution.
    pub wave: u32,
    /// 1-based retry attempt.
    pub attempt: u32,
    /// The trigger event the execution runs under.
    pub event: String,
    /// Nested workflow depth (0 at the root run).
    pub depth: u32,
    /// Cooperative cancellation signal; check at suspension points.
    pub cancel: CancelToken,
    /// Per-run AI session registry.
    pub sessions: Arc<SessionRegistry>,
    /// Process-wide memory store.
    pub memory: Arc<MemoryStore>,
    /// Shared limiter bounding concurrent AI calls across the whole
    /// run, when configured. Providers acquire around the call; the
    /// engine never holds a permit.
    pub ai_limiter: Option<Arc<Semaphore>>,
    /// Resolved session reuse, when the check declares one.
    pub session_reuse: Option<SessionReuse>,
    /// Parent-owned queue for bubbling nested workflow events.
    pub bubble: Arc<BubbleQueue>,
    /// The run's engine options; nested workflow runs inherit them.
    pub options: EngineOptions,
    /// Read access to the run's journal for visible outputs.
    pub journal: Arc<Journal>,
    /// The executed check's declared dependency ids.
    pub dependencies: Vec<String>,
}

impl ExecContext {
    /// Build the `outputs` object for expression evaluation inside a
    /// provider: the visible dependency values plus their `history`
    /// arrays (one value per successful execution observable from this
    /// scope, the forEach aggregation carrier).
    #[must_use]
    pub fn outputs_with_history(
        &self,
        dependency_results: &IndexMap<String, Value>,
    ) -> Value {
        let mut outputs: serde_json::Map<String, Value> = dependency_results
            .iter()
            .map(|(id, value)| (id.clone(), value.clone()))
            .collect();
        let mut history = serde_json::Map::new();
        for dep in &self.dependencies {
            history.insert(
                dep.clone(),
                Value::Array(self.journal.history(dep, &self.scope)),
            );
        }
        outputs.insert("history".to_string(), Value::Object(history));
        Value::Object(outputs)
    }
}

impl std::fmt::Debug for ExecContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecContext")
            .field("check_id", &self.check_id)
            .field("scope", &self.scope)
            .field("wave", &self.wave)
            .field("attempt", &self.attempt)
            .field("event", &self.event)
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

/// The result of one successful provider execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderOutput {
    /// The produced output value; opaque to the engine.
    pub value: Value,
    /// Session id recorded for AI session reuse by later checks.
    pub session_id: Option<String>,
}

impl ProviderOutput {
    /// An output with no session.
    #[must_use]
    pub fn value(value: Value) -> Self {
        Self {
            value,
            session_id: None,
        }
    }
}

/// A provider implementing one check type.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short provider name, matching the check type string.
    fn name(&self) -> &'static str;

    /// One-line human description.
    fn description(&self) -> &'static str;

    /// Whether the given provider configuration is acceptable.
    fn validate_config(&self, config: &Value) -> bool;

    /// Execute one logical check.
    ///
    /// `dependency_results` maps dependency check ids to their current
    /// visible output values (with forEach parents already narrowed to
    /// the scoped item).
    ///
    /// # Errors
    ///
    /// Transient errors ([`EngineError::is_retryable`]) are retried by
    /// the runtime up to the check's retry policy; terminal errors fail
    /// the execution.
    async fn execute(
        &self,
        pr: &PrInfo,
        config: &Value,
        dependency_results: &IndexMap<String, Value>,
        ctx: &ExecContext,
    ) -> EngineResult<ProviderOutput>;
}

/// Registry mapping check types to providers.
pub struct ProviderRegistry {
    providers: IndexMap<String, Arc<dyn Provider>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("registered", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProviderRegistry {
    /// Create an empty registry with no providers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            providers: IndexMap::new(),
        }
    }

    /// Create a registry pre-loaded with the built-in providers:
    /// `noop`, `command`, `http`, `script`, `memory`, and `ai` in
    /// simulation mode.
    ///
    /// The `workflow` provider requires runtime dependencies (the
    /// registry itself plus engine options) and is registered by the
    /// engine entry points. A real `ai` backend replaces the simulation
    /// via [`register`](Self::register).
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(CheckType::Noop.as_str(), crate::providers::NoopProvider);
        registry.register(CheckType::Command.as_str(), crate::providers::CommandProvider);
        registry.register(CheckType::Http.as_str(), crate::providers::HttpProvider::new());
        registry.register(CheckType::Script.as_str(), crate::providers::ScriptProvider);
        registry.register(CheckType::Memory.as_str(), crate::providers::MemoryProvider);
        registry.register(CheckType::Ai.as_str(), crate::providers::AiProvider::simulation());
        registry
    }

    /// Register a provider for the given type string, replacing any
    /// previous provider for the same type.
    pub fn register(&mut self, type_string: impl Into<String>, provider: impl Provider + 'static) {
        self.providers.insert(type_string.into(), Arc::new(provider));
    }

    /// Register an already-shared provider.
    pub fn register_arc(&mut self, type_string: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(type_string.into(), provider);
    }

    /// Resolve the provider for a check type.
    #[must_use]
    pub fn resolve(&self, check_type: CheckType) -> Option<Arc<dyn Provider>> {
        self.providers.get(check_type.as_str()).cloned()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
