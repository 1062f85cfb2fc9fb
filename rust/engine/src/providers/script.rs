//! Script provider.
//!
//! Evaluates an in-process expression program against the visible
//! dependency outputs, the PR context, and the read side of the memory
//! store. The same language as guards and routing expressions, so
//! script checks stay deterministic and I/O-free.

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::error::{EngineError, EngineResult};
use crate::expr::{CompiledExpr, EvalInput};
use crate::provider::{ExecContext, Provider, ProviderOutput};
use crate::types::{IssueCounts, PrInfo};

/// Provider for `script` checks.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptProvider;

#[async_trait]
impl Provider for ScriptProvider {
    fn name(&self) -> &'static str {
        "script"
    }

    fn description(&self) -> &'static str {
        "In-process expression evaluation over dependency outputs"
    }

    fn validate_config(&self, config: &Value) -> bool {
        config
            .get("expr")
            .and_then(Value::as_str)
            .is_some_and(|expr| !expr.trim().is_empty())
    }

    async fn execute(
        &self,
        pr: &PrInfo,
        config: &Value,
        dependency_results: &IndexMap<String, Value>,
        ctx: &ExecContext,
    ) -> EngineResult<ProviderOutput> {
        let source = config
            .get("expr")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::ProviderConfig {
                check_id: ctx.check_id.clone(),
                reason: "script check requires an `expr`".to_string(),
            })?;

        // Script errors are check failures, not safe-defaulted: the
        // expression IS the check's work product.
        let compiled = CompiledExpr::compile(source).map_err(|e| EngineError::ProviderFailed {
            check_id: ctx.check_id.clone(),
            reason: e.to_string(),
        })?;

        let input = EvalInput::new(
            Value::Null,
            ctx.outputs_with_history(dependency_results),
            IssueCounts::default(),
            Value::Object(Map::new()),
            pr,
            Some(ctx.memory.as_ref()),
        );

        let value = compiled
            .evaluate(&input)
            .map_err(|e| EngineError::ProviderFailed {
                check_id: ctx.check_id.clone(),
                reason: format!("script evaluation failed: {e}"),
            })?;

        Ok(ProviderOutput::value(value))
    }
}
