//! AI provider.
//!
//! Executes LLM-backed review checks through a pluggable
//! [`AgentBackend`], with a built-in simulation mode for testing and
//! dry runs. Handles session reuse (clone or append against the parent
//! check's session) and the shared AI concurrency limiter.

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::provider::{ExecContext, Provider, ProviderOutput};
use crate::session::{SessionHandle, SessionRegistry};
use crate::spec::SessionMode;
use crate::types::PrInfo;

/// The reply returned by an agent backend.
pub struct AgentReply {
    /// The agent's response text; parsed as JSON when possible.
    pub text: String,
    /// The conversational handle after this exchange, for reuse by
    /// dependent checks.
    pub session: Option<Arc<dyn SessionHandle>>,
}

/// Trait for agent backends that power the AI provider.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Run one agent call.
    ///
    /// `session` is the resolved parent conversation when the check
    /// declares session reuse; `None` starts a fresh conversation.
    /// Backends must observe `ctx.cancel` at suspension points.
    ///
    /// # Errors
    ///
    /// Transient transport failures should map to retryable
    /// [`EngineError`] variants so the runtime's retry policy applies.
    async fn run(
        &self,
        prompt: &str,
        session: Option<Arc<dyn SessionHandle>>,
        ctx: &ExecContext,
    ) -> EngineResult<AgentReply>;
}

/// Provider for `ai` checks.
///
/// When no backend is configured, operates in simulation mode and
/// returns a placeholder response; useful for tests and for exercising
/// routing without network access.
pub struct AiProvider {
    backend: Option<Arc<dyn AgentBackend>>,
}

impl std::fmt::Debug for AiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiProvider")
            .field("simulation", &self.backend.is_none())
            .finish()
    }
}

impl AiProvider {
    /// Create a provider in simulation mode (no agent backend).
    #[must_use]
    pub fn simulation() -> Self {
        Self { backend: None }
    }

    /// Create a provider with the given agent backend.
    #[must_use]
    pub fn with_backend(backend: Arc<dyn AgentBackend>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    /// Resolve the session handle to continue from, per the check's
    /// reuse declaration, and the session id to record on the output.
    fn resolve_session(
        ctx: &ExecContext,
    ) -> EngineResult<(Option<Arc<dyn SessionHandle>>, String)> {
        match &ctx.session_reuse {
            None => Ok((None, Uuid::new_v4().to_string())),
            Some(reuse) => match reuse.mode {
                SessionMode::Clone => {
                    let own_id = Uuid::new_v4().to_string();
                    let handle =
                        SessionRegistry::clone_into(&ctx.sessions, &reuse.parent_session_id, &own_id)?;
                    Ok((Some(handle), own_id))
                }
                SessionMode::Append => {
                    let handle = ctx.sessions.append(&reuse.parent_session_id, &ctx.check_id)?;
                    // Shared history: the recorded id stays the parent's
                    // so further appends join the same conversation.
                    Ok((Some(handle), reuse.parent_session_id.clone()))
                }
            },
        }
    }
}

/// Compose the prompt from the check's configured prompt plus a
/// serialized section of visible dependency outputs.
fn compose_prompt(prompt: &str, dependency_results: &IndexMap<String, Value>) -> String {
    if dependency_results.is_empty() {
        return prompt.to_string();
    }
    let deps = serde_json::to_string_pretty(&dependency_results)
        .unwrap_or_else(|_| "{}".to_string());
    format!("{prompt}\n\nDependency outputs:\n{deps}")
}

#[async_trait]
impl Provider for AiProvider {
    fn name(&self) -> &'static str {
        "ai"
    }

    fn description(&self) -> &'static str {
        "LLM-backed review via a pluggable agent backend"
    }

    fn validate_config(&self, config: &Value) -> bool {
        config
            .get("prompt")
            .and_then(Value::as_str)
            .is_some_and(|prompt| !prompt.trim().is_empty())
    }

    async fn execute(
        &self,
        _pr: &PrInfo,
        config: &Value,
        dependency_results: &IndexMap<String, Value>,
        ctx: &ExecContext,
    ) -> EngineResult<ProviderOutput> {
        let prompt = config
            .get("prompt")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::ProviderConfig {
                check_id: ctx.check_id.clone(),
                reason: "ai check requires a `prompt`".to_string(),
            })?;

        let (session, session_id) = Self::resolve_session(ctx)?;
        let prompt = compose_prompt(prompt, dependency_results);

        // Bound concurrent AI calls across the whole run. The permit is
        // held only for the duration of the backend call.
        let _permit = match &ctx.ai_limiter {
            Some(limiter) => Some(limiter.clone().acquire_owned().await.map_err(|_| {
                EngineError::Shutdown {
                    reason: "ai concurrency limiter closed".to_string(),
                }
            })?),
            None => None,
        };

        if ctx.cancel.is_cancelled() {
            return Err(EngineError::Shutdown {
                reason: "cancelled before agent call".to_string(),
            });
        }

        let Some(backend) = &self.backend else {
            // Simulation mode
            let text = format!("[Simulated] ai response for check '{}'", ctx.check_id);
            return Ok(ProviderOutput {
                value: serde_json::json!({ "content": text, "issues": [] }),
                session_id: None,
            });
        };

        let reply = backend.run(&prompt, session, ctx).await?;

        let session_id = match reply.session {
            Some(handle) => {
                ctx.sessions.register(&session_id, handle);
                Some(session_id)
            }
            None => None,
        };

        let value = serde_json::from_str(&reply.text)
            .unwrap_or_else(|_| serde_json::json!({ "content": reply.text }));

        Ok(ProviderOutput { value, session_id })
    }
}
