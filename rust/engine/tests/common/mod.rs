//! Shared helpers for engine integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::{Value, json};

use proctor_engine::engine::{EngineConfig, RunOptions};
use proctor_engine::error::{EngineError, EngineResult};
use proctor_engine::events::CollectingEmitter;
use proctor_engine::provider::{ExecContext, Provider, ProviderOutput};
use proctor_engine::spec::CheckSpec;
use proctor_engine::types::{CheckType, PrInfo};

/// Build a catalog from a list of specs.
pub fn catalog(specs: Vec<CheckSpec>) -> IndexMap<String, CheckSpec> {
    specs.into_iter().map(|spec| (spec.id.clone(), spec)).collect()
}

/// A command check echoing the given text.
pub fn echo_check(id: &str, text: &str) -> CheckSpec {
    CheckSpec::new(id, CheckType::Command).with_config(json!({ "exec": format!("echo {text}") }))
}

/// A command check that exits non-zero.
pub fn failing_check(id: &str) -> CheckSpec {
    CheckSpec::new(id, CheckType::Command).with_config(json!({ "exec": "exit 7" }))
}

/// An engine config wired to a collecting emitter, returned alongside.
pub fn collecting_config() -> (EngineConfig, Arc<CollectingEmitter>) {
    let emitter = Arc::new(CollectingEmitter::new());
    let mut config = EngineConfig::default();
    config.emitter = emitter.clone();
    (config, emitter)
}

/// Default run options for tests (manual event).
pub fn run_options() -> RunOptions {
    RunOptions::default()
}

/// A provider that replays a scripted sequence of results across
/// successive executions; the last element repeats once exhausted.
pub struct SequenceProvider {
    results: Mutex<Vec<Result<Value, EngineError>>>,
    calls: Mutex<usize>,
}

impl SequenceProvider {
    pub fn new(results: Vec<Result<Value, EngineError>>) -> Self {
        Self {
            results: Mutex::new(results),
            calls: Mutex::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().expect("calls lock")
    }
}

#[async_trait]
impl Provider for SequenceProvider {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn description(&self) -> &'static str {
        "test provider replaying scripted results"
    }

    fn validate_config(&self, _config: &Value) -> bool {
        true
    }

    async fn execute(
        &self,
        _pr: &PrInfo,
        _config: &Value,
        _deps: &IndexMap<String, Value>,
        _ctx: &ExecContext,
    ) -> EngineResult<ProviderOutput> {
        let mut calls = self.calls.lock().expect("calls lock");
        let results = self.results.lock().expect("results lock");
        let index = (*calls).min(results.len().saturating_sub(1));
        *calls += 1;
        results[index].clone().map(ProviderOutput::value)
    }
}
