//! The check execution engine.
//!
//! Takes an immutable check catalog and runs it to a fixed point:
//! plan → dispatch waves of levels with bounded parallelism → follow
//! routing events (backward `goto`, forward `run`, `on_finish`
//! wave-retry) → collect a structured result.

mod dispatcher;
mod runner;
mod waves;

use std::sync::Arc;

use indexmap::IndexMap;

use proctor_memory::MemoryStore;

use crate::cancel::CancelToken;
use crate::config::EngineOptions;
use crate::error::EngineResult;
use crate::events::{EventEmitter, NoOpEmitter};
use crate::provider::ProviderRegistry;
use crate::providers::WorkflowProvider;
use crate::results::RunResult;
use crate::spec::CheckSpec;
use crate::types::{CheckType, Duration, PrInfo};

pub(crate) use dispatcher::ScheduledCheck;

/// Configuration for one engine instance.
pub struct EngineConfig {
    /// Engine-level options (parallelism, fail-fast, limits).
    pub options: EngineOptions,
    /// Provider registry resolving check types.
    pub providers: Arc<ProviderRegistry>,
    /// Event bus adapter; fire-and-forget.
    pub emitter: Arc<dyn EventEmitter>,
    /// Process-wide memory store shared with nested runs.
    pub memory: Arc<MemoryStore>,
    /// PR context threaded into providers and expressions.
    pub pr: PrInfo,
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("options", &self.options)
            .field("providers", &self.providers)
            .finish_non_exhaustive()
    }
}

impl EngineConfig {
    /// Create a configuration with the default provider registry
    /// (built-ins plus a `workflow` provider inheriting `options`), a
    /// no-op emitter, a fresh memory store, and an empty PR context.
    #[must_use]
    pub fn new(options: EngineOptions) -> Self {
        let mut providers = ProviderRegistry::with_defaults();
        providers.register(CheckType::Workflow.as_str(), WorkflowProvider);
        Self {
            options,
            providers: Arc::new(providers),
            emitter: Arc::new(NoOpEmitter),
            memory: Arc::new(MemoryStore::new()),
            pr: PrInfo::default(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(EngineOptions::default())
    }
}

/// Per-run options.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// The trigger event for this run; checks whose `triggers` do not
    /// include it are skipped with a trigger mismatch.
    pub event: String,
    /// When non-empty, only checks carrying at least one of these tags
    /// run.
    pub include_tags: Vec<String>,
    /// Checks carrying any of these tags are skipped.
    pub exclude_tags: Vec<String>,
    /// Capture per-execution debug records into the result.
    pub debug: bool,
    /// Global wall-clock budget; expiry cancels cooperatively.
    pub timeout: Option<Duration>,
    /// External cancellation signal; a fresh token is created when
    /// absent.
    pub cancel: Option<CancelToken>,
    /// Nested workflow depth; 0 for root runs.
    pub depth: u32,
    /// Run identifier; generated when absent.
    pub run_id: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            event: "manual".to_string(),
            include_tags: Vec::new(),
            exclude_tags: Vec::new(),
            debug: false,
            timeout: None,
            cancel: None,
            depth: 0,
            run_id: None,
        }
    }
}

/// Run a check catalog to completion.
///
/// Returns a structured [`RunResult`] whenever the run reaches a
/// terminal state, including planning cycles, which synthesize a
/// failed entry so statistics surface them rather than erroring out.
///
/// # Errors
///
/// Returns an error for invalid catalogs (dangling dependencies) or an
/// unrecoverable runner failure.
pub async fn run(
    checks: IndexMap<String, CheckSpec>,
    config: EngineConfig,
    run: RunOptions,
) -> EngineResult<RunResult> {
    crate::config::validate_catalog(&checks)?;
    runner::run_engine(checks, config, run).await
}

/// Run a loaded configuration document.
///
/// Convenience wrapper that installs the document's options into the
/// engine configuration before running.
///
/// # Errors
///
/// Same as [`run`].
pub async fn run_document(
    document: crate::config::LoadedConfig,
    mut config: EngineConfig,
    run_options: RunOptions,
) -> EngineResult<RunResult> {
    config.options = document.options;
    run(document.checks, config, run_options).await
}
