//! Memory provider.
//!
//! Performs one operation against the process-wide memory store. The
//! stored/retrieved value becomes the check's output, so memory checks
//! compose with routing expressions (e.g. a counter driving a `goto`
//! loop).
//!
//! Values may be given literally (`value`) or as an expression over
//! dependency outputs (`value_js`).

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::error::{EngineError, EngineResult};
use crate::expr::{CompiledExpr, EvalInput};
use crate::provider::{ExecContext, Provider, ProviderOutput};
use crate::types::{IssueCounts, PrInfo};

/// Operations the memory provider understands.
const KNOWN_OPS: &[&str] = &[
    "get", "has", "list", "getAll", "set", "append", "increment", "delete", "clear",
];

/// Provider for `memory` checks.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryProvider;

#[async_trait]
impl Provider for MemoryProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn description(&self) -> &'static str {
        "Namespaced key/value store operations"
    }

    fn validate_config(&self, config: &Value) -> bool {
        config
            .get("op")
            .and_then(Value::as_str)
            .is_some_and(|op| KNOWN_OPS.contains(&op))
    }

    async fn execute(
        &self,
        pr: &PrInfo,
        config: &Value,
        dependency_results: &IndexMap<String, Value>,
        ctx: &ExecContext,
    ) -> EngineResult<ProviderOutput> {
        let op = config
            .get("op")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::ProviderConfig {
                check_id: ctx.check_id.clone(),
                reason: "memory check requires an `op`".to_string(),
            })?;

        let namespace = config.get("namespace").and_then(Value::as_str);
        let key = config.get("key").and_then(Value::as_str);
        let store = &ctx.memory;

        let require_key = || {
            key.ok_or_else(|| EngineError::ProviderConfig {
                check_id: ctx.check_id.clone(),
                reason: format!("memory op `{op}` requires a `key`"),
            })
        };

        let store_error = |e: proctor_memory::MemoryError| EngineError::ProviderFailed {
            check_id: ctx.check_id.clone(),
            reason: e.to_string(),
        };

        let value = match op {
            "get" => store.get(require_key()?, namespace).unwrap_or(Value::Null),
            "has" => Value::Bool(store.has(require_key()?, namespace)),
            "list" => Value::Array(
                store
                    .list(namespace)
                    .into_iter()
                    .map(Value::String)
                    .collect(),
            ),
            "getAll" => Value::Object(store.get_all(namespace).into_iter().collect()),
            "set" => {
                let key = require_key()?;
                let value = resolve_value(config, dependency_results, pr, ctx)?;
                store.set(key, value.clone(), namespace);
                value
            }
            "append" => {
                let key = require_key()?;
                let value = resolve_value(config, dependency_results, pr, ctx)?;
                store.append(key, value, namespace).map_err(store_error)?;
                store.get(key, namespace).unwrap_or(Value::Null)
            }
            "increment" => {
                let key = require_key()?;
                let delta = config.get("delta").and_then(Value::as_i64);
                let next = store.increment(key, delta, namespace).map_err(store_error)?;
                Value::Number(next.into())
            }
            "delete" => Value::Bool(store.delete(require_key()?, namespace)),
            "clear" => {
                store.clear(namespace);
                Value::Null
            }
            other => {
                return Err(EngineError::ProviderConfig {
                    check_id: ctx.check_id.clone(),
                    reason: format!("unknown memory op: {other}"),
                });
            }
        };

        Ok(ProviderOutput::value(value))
    }
}

/// Resolve the value operand: literal `value`, or `value_js` evaluated
/// over the dependency outputs.
fn resolve_value(
    config: &Value,
    dependency_results: &IndexMap<String, Value>,
    pr: &PrInfo,
    ctx: &ExecContext,
) -> EngineResult<Value> {
    if let Some(value) = config.get("value") {
        return Ok(value.clone());
    }

    let Some(source) = config.get("value_js").and_then(Value::as_str) else {
        return Err(EngineError::ProviderConfig {
            check_id: ctx.check_id.clone(),
            reason: "memory op requires `value` or `value_js`".to_string(),
        });
    };

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

    compiled.evaluate(&input).map_err(|e| EngineError::ProviderFailed {
        check_id: ctx.check_id.clone(),
        reason: format!("value_js evaluation failed: {e}"),
    })
}
