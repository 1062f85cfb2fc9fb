//! Workflow provider.
//!
//! Runs a nested check catalog through a child engine at depth + 1.
//! Child events bubble to the parent through the parent-owned
//! [`BubbleQueue`](crate::events::BubbleQueue), drained at the parent's
//! next wave-planning boundary. The child shares the process-wide
//! memory store but gets its own session registry.
//!
//! The check's output is the child run's result document; `fail_if`
//! expressions on the check can inspect
//! `output.statistics.failed_executions` to decide whether child
//! failures fail the parent check.

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;

use crate::engine::{EngineConfig, RunOptions};
use crate::error::{EngineError, EngineResult};
use crate::events::BubblingEmitter;
use crate::provider::{ExecContext, Provider, ProviderOutput};
use crate::types::PrInfo;

/// Provider for `workflow` checks.
///
/// Child runs inherit the parent run's engine options through the
/// execution context.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkflowProvider;

#[async_trait]
impl Provider for WorkflowProvider {
    fn name(&self) -> &'static str {
        "workflow"
    }

    fn description(&self) -> &'static str {
        "Nested check catalog executed by a child engine"
    }

    fn validate_config(&self, config: &Value) -> bool {
        config.get("checks").is_some_and(Value::is_object)
    }

    async fn execute(
        &self,
        pr: &PrInfo,
        config: &Value,
        _dependency_results: &IndexMap<String, Value>,
        ctx: &ExecContext,
    ) -> EngineResult<ProviderOutput> {
        let checks_value = config
            .get("checks")
            .ok_or_else(|| EngineError::ProviderConfig {
                check_id: ctx.check_id.clone(),
                reason: "workflow check requires a `checks` map".to_string(),
            })?;
        let checks = crate::config::checks_from_value(checks_value)?;

        let event = config
            .get("event")
            .and_then(Value::as_str)
            .unwrap_or(&ctx.event)
            .to_string();

        let mut child_config = EngineConfig::new(ctx.options.clone());
        child_config.emitter = Arc::new(BubblingEmitter::new(
            Arc::clone(&ctx.bubble),
            ctx.check_id.clone(),
        ));
        child_config.memory = Arc::clone(&ctx.memory);
        child_config.pr = pr.clone();

        let run_options = RunOptions {
            event,
            depth: ctx.depth + 1,
            cancel: Some(ctx.cancel.clone()),
            ..RunOptions::default()
        };

        let result = crate::engine::run(checks, child_config, run_options)
            .await
            .map_err(|e| EngineError::ProviderFailed {
                check_id: ctx.check_id.clone(),
                reason: format!("nested workflow failed: {e}"),
            })?;

        let value = serde_json::to_value(&result)?;
        Ok(ProviderOutput::value(value))
    }
}
