//! Check runtime.
//!
//! Executes one logical check at a given scope and wave: tag and
//! trigger filters, the `if` guard, dependency verification against the
//! journal, provider invocation with retry/timeout/cancellation,
//! `fail_if` evaluation, the journal append, and finally the routing
//! decision. Every attempt produces its own immutable journal entry;
//! the runtime never mutates inputs.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use futures::FutureExt;
use indexmap::{IndexMap, IndexSet};
use serde_json::{Map, Value};
use tokio::sync::Semaphore;

use proctor_memory::MemoryStore;

use crate::cancel::CancelToken;
use crate::config::EngineOptions;
use crate::error::{EngineError, EngineResult};
use crate::events::{BubbleQueue, EngineEvent, EventEmitter, EventPayload};
use crate::expr::{CompiledExpr, EvalInput};
use crate::journal::{EntryError, Journal, JournalEntry};
use crate::provider::{ExecContext, ProviderOutput, ProviderRegistry, SessionReuse};
use crate::results::DebugRecord;
use crate::retry::delay_for_attempt;
use crate::routing::{ForwardRunRequest, decide_routing};
use crate::scope::Scope;
use crate::session::SessionRegistry;
use crate::spec::CheckSpec;
use crate::types::{CheckStatus, CheckType, IssueCounts, PrInfo, SkipReason, issues_from_value};

/// The outcome of executing one check at one scope.
#[derive(Debug)]
pub struct ExecReport {
    /// The final journal entry (already appended).
    pub entry: JournalEntry,
    /// Routing requests produced by the entry.
    pub requests: Vec<ForwardRunRequest>,
    /// Whether a matched `fail_if` predicate carried the halt flag.
    pub halt: bool,
    /// Whether the check's spec requests a wave-retry on completion.
    pub on_finish: bool,
    /// Debug capture, when the run requested it.
    pub debug: Option<DebugRecord>,
}

/// Immutable per-run state shared by every check execution.
pub struct Runtime {
    pub specs: Arc<IndexMap<String, CheckSpec>>,
    pub journal: Arc<Journal>,
    pub providers: Arc<ProviderRegistry>,
    pub sessions: Arc<SessionRegistry>,
    pub memory: Arc<MemoryStore>,
    pub emitter: Arc<dyn EventEmitter>,
    pub options: EngineOptions,
    pub pr: PrInfo,
    pub run_id: String,
    pub workflow_id: Option<String>,
    pub depth: u32,
    pub ai_limiter: Option<Arc<Semaphore>>,
    pub bubble: Arc<BubbleQueue>,
    /// Transitive dependency closure per check, for goto validation.
    pub ancestors: IndexMap<String, IndexSet<String>>,
    /// Whitelisted environment snapshot exposed as `env.<NAME>`.
    pub env: Map<String, Value>,
    /// Run-level tag filters.
    pub include_tags: Vec<String>,
    pub exclude_tags: Vec<String>,
    /// Whether to capture debug records.
    pub debug: bool,
    /// Compile-once cache for guard/predicate expressions; a `None`
    /// slot records a compile failure so it is reported only once.
    exprs: RwLock<IndexMap<String, Option<CompiledExpr>>>,
}

impl Runtime {
    /// Snapshot the whitelisted environment variables.
    #[must_use]
    pub fn env_snapshot(allowlist: &[String]) -> Map<String, Value> {
        allowlist
            .iter()
            .filter_map(|name| {
                std::env::var(name)
                    .ok()
                    .map(|value| (name.clone(), Value::String(value)))
            })
            .collect()
    }

    /// Create the runtime for one run.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        specs: Arc<IndexMap<String, CheckSpec>>,
        journal: Arc<Journal>,
        providers: Arc<ProviderRegistry>,
        emitter: Arc<dyn EventEmitter>,
        memory: Arc<MemoryStore>,
        options: EngineOptions,
        pr: PrInfo,
        run_id: String,
        workflow_id: Option<String>,
        depth: u32,
    ) -> Self {
        let ancestors = crate::planner::ancestors(&specs);
        let env = Self::env_snapshot(&options.env_allowlist);
        let ai_limiter = options
            .max_ai_concurrency
            .map(|permits| Arc::new(Semaphore::new(permits)));
        Self {
            specs,
            journal,
            providers,
            sessions: Arc::new(SessionRegistry::new()),
            memory,
            emitter,
            options,
            pr,
            run_id,
            workflow_id,
            depth,
            ai_limiter,
            bubble: Arc::new(BubbleQueue::new()),
            ancestors,
            env,
            include_tags: Vec::new(),
            exclude_tags: Vec::new(),
            debug: false,
            exprs: RwLock::new(IndexMap::new()),
        }
    }

    /// Emit an event under the run's envelope.
    pub fn emit(&self, wave: u32, payload: EventPayload) {
        self.emitter.emit(EngineEvent::new(
            self.run_id.clone(),
            self.workflow_id.clone(),
            wave,
            payload,
        ));
    }

    /// Compile an expression through the per-run cache.
    fn compiled(&self, source: &str) -> Option<CompiledExpr> {
        {
            let cache = self
                .exprs
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(slot) = cache.get(source) {
                return slot.clone();
            }
        }
        let slot = match CompiledExpr::compile(source) {
            Ok(compiled) => Some(compiled),
            Err(error) => {
                tracing::warn!(target: "proctor::runtime", %error, "expression failed to compile");
                None
            }
        };
        let mut cache = self
            .exprs
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        cache.insert(source.to_string(), slot.clone());
        slot
    }

    /// Build the expression evaluation world for a check at a scope.
    fn eval_input(
        &self,
        spec: &CheckSpec,
        scope: &Scope,
        output: Value,
        metadata: IssueCounts,
    ) -> EvalInput<'_> {
        let dependency_values = self.dependency_results(spec, scope);
        let mut outputs: Map<String, Value> = dependency_values.into_iter().collect();

        let mut history = Map::new();
        for dep in spec.dependency_ids() {
            history.insert(
                dep.to_string(),
                Value::Array(self.journal.history(dep, scope)),
            );
        }
        outputs.insert("history".to_string(), Value::Object(history));

        EvalInput::new(
            output,
            Value::Object(outputs),
            metadata,
            Value::Object(self.env.clone()),
            &self.pr,
            Some(self.memory.as_ref()),
        )
    }

    /// Gather the visible current values for every dependency, with
    /// forEach parents narrowed to the item pinned by `scope`.
    #[must_use]
    pub fn dependency_results(&self, spec: &CheckSpec, scope: &Scope) -> IndexMap<String, Value> {
        let mut results = IndexMap::new();
        for dep in spec.dependency_ids() {
            if results.contains_key(dep) {
                continue;
            }
            let value = match scope.item_index_for(dep) {
                Some(index) => self.journal.current_value(dep, scope).and_then(|value| {
                    match value {
                        Value::Array(items) => items.get(index).cloned(),
                        // A non-array forEach output is a single-item
                        // sequence.
                        other if index == 0 => Some(other),
                        _ => None,
                    }
                }),
                None => self.journal.current_value(dep, scope),
            };
            if let Some(value) = value {
                results.insert(dep.to_string(), value);
            }
        }
        results
    }

    /// Execute one check at one scope; always appends at least one
    /// journal entry and returns the final one.
    pub async fn execute_check(
        &self,
        check_id: &str,
        scope: Scope,
        wave: u32,
        event: &str,
        cancel: CancelToken,
    ) -> ExecReport {
        let Some(spec) = self.specs.get(check_id) else {
            // Routing admitted an unknown target; journal it as failed
            // so statistics surface the problem.
            let entry = self.append_failed(
                check_id,
                wave,
                scope,
                1,
                &EngineError::UnknownCheck {
                    check_id: check_id.to_string(),
                },
                None,
            );
            return self.report(entry);
        };

        // 1. Tag filters.
        if !self.tags_allow(spec) {
            return self.skip(spec, wave, scope, SkipReason::TagFilter);
        }

        // 2. Trigger filter.
        if !spec.triggered_by(event) {
            return self.skip(spec, wave, scope, SkipReason::TriggerMismatch);
        }

        // 3. Guard. An evaluation error defaults to false, so a broken
        // guard skips rather than runs.
        if let Some(source) = &spec.if_expr {
            let passed = self.compiled(source).is_some_and(|compiled| {
                let input = self.eval_input(spec, &scope, Value::Null, IssueCounts::default());
                compiled.evaluate_bool(&input)
            });
            if !passed {
                return self.skip(spec, wave, scope, SkipReason::IfCondition);
            }
        }

        // 4. Dependency verification: each token needs at least one
        // alternative with an observable successful entry.
        for token in &spec.depends_on {
            let satisfied = token
                .alternatives()
                .iter()
                .any(|dep| self.journal.has_success(dep, &scope));
            if !satisfied {
                return self.skip(spec, wave, scope, SkipReason::DependencyFailed);
            }
        }

        // 5. Nested workflow depth gate.
        if spec.check_type == CheckType::Workflow
            && self.depth + 1 > self.options.max_workflow_depth
        {
            return self.skip(spec, wave, scope, SkipReason::DepthLimit);
        }

        // 6. Session reuse resolution; failure is a check-level error
        // eligible for on_fail routing.
        let session_reuse = match self.resolve_session_reuse(spec, &scope) {
            Ok(reuse) => reuse,
            Err(error) => {
                let entry = self.append_failed(check_id, wave, scope, 1, &error, None);
                return self.finish(spec, entry, false, event, None);
            }
        };

        // 7. Provider resolution and config validation.
        let Some(provider) = self.providers.resolve(spec.check_type) else {
            let error = EngineError::ProviderFailed {
                check_id: check_id.to_string(),
                reason: format!("no provider registered for type '{}'", spec.check_type),
            };
            let entry = self.append_failed(check_id, wave, scope, 1, &error, None);
            return self.finish(spec, entry, false, event, None);
        };
        if !provider.validate_config(&spec.provider_config) {
            let error = EngineError::ProviderConfig {
                check_id: check_id.to_string(),
                reason: format!("configuration rejected by the {} provider", provider.name()),
            };
            let entry = self.append_failed(check_id, wave, scope, 1, &error, None);
            return self.finish(spec, entry, false, event, None);
        }

        let dependency_results = self.dependency_results(spec, &scope);

        // 8. Provider invocation with retry.
        let mut attempt = 0u32;
        loop {
            attempt += 1;

            if cancel.is_cancelled() {
                let error = EngineError::Shutdown {
                    reason: "cancelled before execution".to_string(),
                };
                let entry = self.append_failed(check_id, wave, scope, attempt, &error, None);
                return self.finish(spec, entry, false, event, Some(provider.name()));
            }

            let ctx = ExecContext {
                check_id: check_id.to_string(),
                scope: scope.clone(),
                wave,
                attempt,
                event: event.to_string(),
                depth: self.depth,
                cancel: cancel.clone(),
                sessions: Arc::clone(&self.sessions),
                memory: Arc::clone(&self.memory),
                ai_limiter: self.ai_limiter.clone(),
                session_reuse: session_reuse.clone(),
                bubble: Arc::clone(&self.bubble),
                options: self.options.clone(),
                journal: Arc::clone(&self.journal),
                dependencies: {
                    let mut seen = IndexSet::new();
                    spec.dependency_ids()
                        .filter(|dep| seen.insert(dep.to_string()))
                        .map(String::from)
                        .collect()
                },
            };

            let started_at = Utc::now();
            let started = std::time::Instant::now();

            let invocation =
                provider.execute(&self.pr, &spec.provider_config, &dependency_results, &ctx);
            let invocation = async {
                match spec.timeout {
                    Some(timeout) => tokio::time::timeout(timeout.inner(), invocation)
                        .await
                        .unwrap_or_else(|_| {
                            Err(EngineError::NetworkTimeout {
                                message: format!("check timed out after {timeout}"),
                            })
                        }),
                    None => invocation.await,
                }
            };

            // Catch panics so one provider cannot take down the run.
            let result = AssertUnwindSafe(invocation).catch_unwind().await;
            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            let error = match result {
                Ok(Ok(output)) => {
                    let entry = self.append_provider_result(
                        spec, wave, &scope, attempt, started_at, duration_ms, output,
                    );
                    let halt = entry
                        .error
                        .as_ref()
                        .is_some_and(|error| error.detail.as_deref() == Some("halt"));
                    return self.finish(spec, entry, halt, event, Some(provider.name()));
                }
                Ok(Err(error)) => error,
                Err(_panic) => EngineError::ProviderFailed {
                    check_id: check_id.to_string(),
                    reason: "provider panicked during execution".to_string(),
                },
            };

            let retryable = error.is_retryable() && attempt < spec.retry.max_attempts;
            let mut entry = JournalEntry {
                sequence: 0,
                check_id: check_id.to_string(),
                wave,
                scope: scope.clone(),
                attempt,
                status: CheckStatus::Failed,
                skip_reason: None,
                started_at,
                ended_at: Utc::now(),
                duration_ms,
                output: None,
                error: Some(EntryError::from_engine(&error)),
                session_id: None,
            };
            let sequence = self.journal.append(entry.clone());
            entry.sequence = sequence;
            self.emit(
                wave,
                EventPayload::CheckErrored {
                    check_id: check_id.to_string(),
                    scope: scope.clone(),
                    error: error.to_string(),
                },
            );

            if retryable {
                tokio::time::sleep(delay_for_attempt(attempt, &spec.retry)).await;
                continue;
            }

            return self.finish(spec, entry, false, event, Some(provider.name()));
        }
    }

    /// Whether run-level tag filters admit the check.
    fn tags_allow(&self, spec: &CheckSpec) -> bool {
        if spec
            .tags
            .iter()
            .any(|tag| self.exclude_tags.contains(tag))
        {
            return false;
        }
        if self.include_tags.is_empty() {
            return true;
        }
        spec.tags.iter().any(|tag| self.include_tags.contains(tag))
    }

    /// Resolve the declared session reuse to the parent's recorded
    /// session id.
    fn resolve_session_reuse(
        &self,
        spec: &CheckSpec,
        scope: &Scope,
    ) -> EngineResult<Option<SessionReuse>> {
        let Some(parent) = &spec.reuse_session else {
            return Ok(None);
        };
        let parent_session_id = self
            .journal
            .latest_session_id(parent, scope)
            .ok_or_else(|| EngineError::SessionReuse {
                check_id: spec.id.clone(),
                reason: format!("check `{parent}` recorded no session"),
            })?;
        Ok(Some(SessionReuse {
            parent_session_id,
            mode: spec.session_mode,
        }))
    }

    /// Evaluate `fail_if` predicates and append the final entry for a
    /// provider result.
    fn append_provider_result(
        &self,
        spec: &CheckSpec,
        wave: u32,
        scope: &Scope,
        attempt: u32,
        started_at: chrono::DateTime<Utc>,
        duration_ms: u64,
        output: ProviderOutput,
    ) -> JournalEntry {
        let issues = issues_from_value(&output.value);
        let metadata = IssueCounts::tally(&issues);

        let mut matched: Vec<&str> = Vec::new();
        let mut halt = false;
        for (name, condition) in &spec.fail_if {
            let triggered = self.compiled(&condition.condition).is_some_and(|compiled| {
                let input = self.eval_input(spec, scope, output.value.clone(), metadata);
                compiled.evaluate_bool(&input)
            });
            if triggered {
                matched.push(name);
                halt |= condition.halt;
            }
        }

        let mut entry = JournalEntry {
            sequence: 0,
            check_id: spec.id.clone(),
            wave,
            scope: scope.clone(),
            attempt,
            status: CheckStatus::Success,
            skip_reason: None,
            started_at,
            ended_at: Utc::now(),
            duration_ms,
            output: Some(output.value),
            error: None,
            session_id: output.session_id,
        };

        if !matched.is_empty() {
            let error = EngineError::PredicateMatched {
                check_id: spec.id.clone(),
                predicate: matched.join(", "),
            };
            entry.status = CheckStatus::Failed;
            entry.error = Some(EntryError {
                code: error.code().to_string(),
                message: error.to_string(),
                // The halt flag rides in the detail field so the
                // report stage can read it back without re-evaluating.
                detail: halt.then(|| "halt".to_string()),
            });
        }

        let sequence = self.journal.append(entry.clone());
        entry.sequence = sequence;
        entry
    }

    /// Append a failed entry for a pre-provider error.
    fn append_failed(
        &self,
        check_id: &str,
        wave: u32,
        scope: Scope,
        attempt: u32,
        error: &EngineError,
        output: Option<Value>,
    ) -> JournalEntry {
        let now = Utc::now();
        let mut entry = JournalEntry {
            sequence: 0,
            check_id: check_id.to_string(),
            wave,
            scope,
            attempt,
            status: CheckStatus::Failed,
            skip_reason: None,
            started_at: now,
            ended_at: now,
            duration_ms: 0,
            output,
            error: Some(EntryError::from_engine(error)),
            session_id: None,
        };
        let sequence = self.journal.append(entry.clone());
        entry.sequence = sequence;
        self.emit(
            wave,
            EventPayload::CheckErrored {
                check_id: check_id.to_string(),
                scope: entry.scope.clone(),
                error: error.to_string(),
            },
        );
        entry
    }

    /// Append a skipped entry and build its report.
    fn skip(&self, spec: &CheckSpec, wave: u32, scope: Scope, reason: SkipReason) -> ExecReport {
        self.skip_check(&spec.id, wave, scope, reason)
    }

    /// Append a skipped entry for a check by id.
    ///
    /// Also used by the dispatcher (empty forEach fanout) and the
    /// runner (routing loop limits), which skip checks without running
    /// them.
    pub(crate) fn skip_check(
        &self,
        check_id: &str,
        wave: u32,
        scope: Scope,
        reason: SkipReason,
    ) -> ExecReport {
        let mut entry = JournalEntry::skipped(check_id, wave, scope, reason);
        let sequence = self.journal.append(entry.clone());
        entry.sequence = sequence;
        self.emit(
            wave,
            EventPayload::CheckCompleted {
                check_id: check_id.to_string(),
                scope: entry.scope.clone(),
                status: CheckStatus::Skipped,
            },
        );
        ExecReport {
            entry,
            requests: Vec::new(),
            halt: false,
            on_finish: false,
            debug: None,
        }
    }

    /// Emit completion, decide routing, and build the report for a
    /// final (non-skipped) entry.
    fn finish(
        &self,
        spec: &CheckSpec,
        entry: JournalEntry,
        halt: bool,
        event: &str,
        provider: Option<&str>,
    ) -> ExecReport {
        self.emit(
            entry.wave,
            EventPayload::CheckCompleted {
                check_id: entry.check_id.clone(),
                scope: entry.scope.clone(),
                status: entry.status,
            },
        );

        let output = entry.output.clone().unwrap_or(Value::Null);
        let metadata = IssueCounts::tally(&issues_from_value(&output));
        let input = self.eval_input(spec, &entry.scope, output, metadata);
        let ancestors = self
            .ancestors
            .get(&spec.id)
            .cloned()
            .unwrap_or_default();
        let requests = decide_routing(spec, &entry, &input, &ancestors, event);

        let debug = self.debug.then(|| DebugRecord {
            check_id: entry.check_id.clone(),
            scope: entry.scope.clone(),
            wave: entry.wave,
            attempt: entry.attempt,
            provider: provider.unwrap_or("-").to_string(),
            duration_ms: entry.duration_ms,
            error: entry.error.as_ref().map(|error| error.message.clone()),
        });

        let on_finish = spec.on_finish && entry.status.is_success();

        ExecReport {
            entry,
            requests,
            halt,
            on_finish,
            debug,
        }
    }

    /// Build a report for an entry with no spec (unknown target).
    fn report(&self, entry: JournalEntry) -> ExecReport {
        self.emit(
            entry.wave,
            EventPayload::CheckCompleted {
                check_id: entry.check_id.clone(),
                scope: entry.scope.clone(),
                status: entry.status,
            },
        );
        ExecReport {
            entry,
            requests: Vec::new(),
            halt: false,
            on_finish: false,
            debug: None,
        }
    }
}
