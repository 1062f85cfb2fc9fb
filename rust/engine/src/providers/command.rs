//! Command provider.
//!
//! Runs a shell command and captures its stdout as the output value.
//! Stdout that parses as JSON becomes a structured value (which is how
//! forEach parents produce item sequences from plain `echo`); anything
//! else is kept as a string. Dependency outputs are exposed to the
//! command through the `PROCTOR_OUTPUTS` environment variable.

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use tokio::process::Command;

use crate::error::{EngineError, EngineResult};
use crate::provider::{ExecContext, Provider, ProviderOutput};
use crate::types::PrInfo;

/// How many trailing bytes of stderr to keep in error messages.
const STDERR_TAIL: usize = 2048;

/// Provider for `command` checks.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandProvider;

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= STDERR_TAIL {
        return text.to_string();
    }
    // Keep the tail; truncation at a char boundary.
    let start = text
        .char_indices()
        .map(|(i, _)| i)
        .find(|&i| text.len() - i <= STDERR_TAIL)
        .unwrap_or(0);
    format!("…{}", &text[start..])
}

#[async_trait]
impl Provider for CommandProvider {
    fn name(&self) -> &'static str {
        "command"
    }

    fn description(&self) -> &'static str {
        "Shell command execution with JSON-aware stdout capture"
    }

    fn validate_config(&self, config: &Value) -> bool {
        config
            .get("exec")
            .and_then(Value::as_str)
            .is_some_and(|exec| !exec.trim().is_empty())
    }

    async fn execute(
        &self,
        _pr: &PrInfo,
        config: &Value,
        dependency_results: &IndexMap<String, Value>,
        ctx: &ExecContext,
    ) -> EngineResult<ProviderOutput> {
        let exec = config
            .get("exec")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::ProviderConfig {
                check_id: ctx.check_id.clone(),
                reason: "command check requires an `exec` string".to_string(),
            })?;

        let outputs_json =
            serde_json::to_string(dependency_results).unwrap_or_else(|_| "{}".to_string());

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(exec)
            .env("PROCTOR_OUTPUTS", outputs_json)
            .env("PROCTOR_EVENT", &ctx.event)
            .env("PROCTOR_CHECK", &ctx.check_id)
            .kill_on_drop(true)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let child = command.spawn()?;

        // Cooperative cancellation: dropping the child future kills the
        // process via kill_on_drop.
        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            () = ctx.cancel.cancelled() => {
                return Err(EngineError::Shutdown {
                    reason: format!("command for check `{}` cancelled", ctx.check_id),
                });
            }
        };

        if !output.status.success() {
            return Err(EngineError::ProviderFailed {
                check_id: ctx.check_id.clone(),
                reason: format!(
                    "command exited with {}: {}",
                    output.status,
                    stderr_tail(&output.stderr)
                ),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        let value = serde_json::from_str(stdout)
            .unwrap_or_else(|_| Value::String(stdout.to_string()));

        Ok(ProviderOutput::value(value))
    }
}
