//! Noop provider.

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;

use crate::error::EngineResult;
use crate::provider::{ExecContext, Provider, ProviderOutput};
use crate::types::PrInfo;

/// Provider for `noop` checks: produces a null output.
///
/// Useful as a grouping or synchronization point in the dependency
/// graph: dependents wait on it and routing can target it, but nothing
/// executes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProvider;

#[async_trait]
impl Provider for NoopProvider {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn description(&self) -> &'static str {
        "No-op synchronization point"
    }

    fn validate_config(&self, _config: &Value) -> bool {
        true
    }

    async fn execute(
        &self,
        _pr: &PrInfo,
        _config: &Value,
        _dependency_results: &IndexMap<String, Value>,
        _ctx: &ExecContext,
    ) -> EngineResult<ProviderOutput> {
        Ok(ProviderOutput::value(Value::Null))
    }
}
