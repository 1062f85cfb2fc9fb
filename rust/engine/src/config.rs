//! Configuration document loading.
//!
//! Parses the YAML configuration document into engine options plus the
//! check catalog. Parsing is two-pass: the raw YAML is first inspected
//! for unknown top-level keys (warnings by default, errors under
//! `strict`), then deserialized into typed documents and converted to
//! immutable [`CheckSpec`]s.

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::expr::CompiledExpr;
use crate::spec::{
    CheckSpec, DependsToken, FailCondition, RetrySpec, RoutingDirective, SessionMode,
};
use crate::types::{CheckType, Duration};

/// Engine-level options recognized at the top of the document.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    /// Maximum checks running concurrently within a level.
    pub max_parallelism: usize,
    /// Optional bound on AI calls in flight across the whole run.
    pub max_ai_concurrency: Option<usize>,
    /// Whether a halting `fail_if` match stops the run.
    pub fail_fast: bool,
    /// Maximum backward `goto` jumps per (target, initiator) pair.
    pub max_routing_loops: u32,
    /// Maximum nested workflow depth.
    pub max_workflow_depth: u32,
    /// Whether suppressed issues are filtered from results.
    pub suppression_enabled: bool,
    /// Environment variables exposed to expressions as `env.<NAME>`.
    pub env_allowlist: Vec<String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_parallelism: 4,
            max_ai_concurrency: None,
            fail_fast: false,
            max_routing_loops: 10,
            max_workflow_depth: 5,
            suppression_enabled: true,
            env_allowlist: Vec::new(),
        }
    }
}

/// The loaded configuration: options, check catalog, and any warnings
/// produced while parsing.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Schema version string from the document.
    pub version: String,
    /// Engine options with defaults applied.
    pub options: EngineOptions,
    /// The immutable check catalog, in document order.
    pub checks: IndexMap<String, CheckSpec>,
    /// Non-fatal findings (unknown keys, non-compiling expressions).
    pub warnings: Vec<String>,
}

/// Top-level keys the loader recognizes; anything else warns (or fails
/// under `strict`).
const KNOWN_TOP_LEVEL_KEYS: &[&str] = &[
    "version",
    "checks",
    "max_parallelism",
    "max_ai_concurrency",
    "fail_fast",
    "routing",
    "limits",
    "output",
    "env_allowlist",
];

#[derive(Debug, Deserialize, Default)]
struct RoutingSection {
    #[serde(default)]
    max_loops: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct LimitsSection {
    #[serde(default)]
    max_workflow_depth: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct OutputSection {
    #[serde(default, alias = "suppressionEnabled")]
    suppression_enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ConfigDoc {
    version: String,
    #[serde(default)]
    checks: IndexMap<String, CheckDoc>,
    #[serde(default)]
    max_parallelism: Option<usize>,
    #[serde(default)]
    max_ai_concurrency: Option<usize>,
    #[serde(default)]
    fail_fast: Option<bool>,
    #[serde(default)]
    routing: RoutingSection,
    #[serde(default)]
    limits: LimitsSection,
    #[serde(default)]
    output: OutputSection,
    #[serde(default)]
    env_allowlist: Vec<String>,
}

/// `fail_if` accepts either a bare expression string or a map of named
/// predicates, each itself either a string or a full condition object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FailIfDoc {
    Expr(String),
    Named(IndexMap<String, FailConditionDoc>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FailConditionDoc {
    Expr(String),
    Full(FailCondition),
}

impl FailConditionDoc {
    fn into_condition(self) -> FailCondition {
        match self {
            Self::Expr(expr) => FailCondition::new(expr),
            Self::Full(condition) => condition,
        }
    }
}

/// One entry in the document's `checks` map.
#[derive(Debug, Deserialize)]
struct CheckDoc {
    #[serde(rename = "type")]
    check_type: CheckType,
    #[serde(default)]
    depends_on: Vec<DependsToken>,
    #[serde(default, alias = "on")]
    triggers: Vec<String>,
    #[serde(default, rename = "if")]
    if_expr: Option<String>,
    #[serde(default)]
    fail_if: Option<FailIfDoc>,
    #[serde(default)]
    on_success: Option<RoutingDirective>,
    #[serde(default)]
    on_fail: Option<RoutingDirective>,
    #[serde(default)]
    on_finish: bool,
    #[serde(default, alias = "forEach")]
    for_each: bool,
    #[serde(default)]
    group: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    timeout: Option<Duration>,
    #[serde(default)]
    retry: RetrySpec,
    #[serde(default)]
    reuse_session: Option<String>,
    #[serde(default)]
    session_mode: SessionMode,
    /// Everything else on the check is the provider's configuration,
    /// passed through verbatim.
    #[serde(flatten)]
    provider_config: IndexMap<String, Value>,
}

impl CheckDoc {
    fn into_spec(self, id: String) -> CheckSpec {
        let fail_if = match self.fail_if {
            None => IndexMap::new(),
            Some(FailIfDoc::Expr(expr)) => {
                let mut named = IndexMap::new();
                named.insert("fail_if".to_string(), FailCondition::new(expr));
                named
            }
            Some(FailIfDoc::Named(named)) => named
                .into_iter()
                .map(|(name, doc)| (name, doc.into_condition()))
                .collect(),
        };

        let provider_config = if self.provider_config.is_empty() {
            Value::Null
        } else {
            Value::Object(self.provider_config.into_iter().collect())
        };

        CheckSpec {
            id,
            check_type: self.check_type,
            depends_on: self.depends_on,
            triggers: self.triggers,
            if_expr: self.if_expr,
            fail_if,
            on_success: self.on_success,
            on_fail: self.on_fail,
            on_finish: self.on_finish,
            for_each: self.for_each,
            group: self.group,
            tags: self.tags,
            timeout: self.timeout,
            retry: self.retry,
            reuse_session: self.reuse_session,
            session_mode: self.session_mode,
            provider_config,
        }
    }
}

/// Parse a YAML configuration document.
///
/// Unknown top-level keys produce warnings; under `strict` they fail
/// validation instead. Catalog-level validation (dangling dependencies,
/// self-dependencies, invalid session reuse) always fails.
///
/// # Errors
///
/// Returns [`EngineError::Yaml`] for malformed YAML and
/// [`EngineError::InvalidConfig`] for validation failures.
pub fn load_str(source: &str, strict: bool) -> EngineResult<LoadedConfig> {
    let raw: serde_yaml::Value = serde_yaml::from_str(source)?;
    let mut warnings = unknown_key_warnings(&raw)?;

    if strict && !warnings.is_empty() {
        return Err(EngineError::InvalidConfig {
            reason: warnings.join("; "),
        });
    }

    // Route through serde_json so the flattened provider config lands
    // as plain JSON values.
    let json = serde_json::to_value(&raw).map_err(|e| EngineError::InvalidConfig {
        reason: format!("configuration is not JSON-representable: {e}"),
    })?;
    let doc: ConfigDoc = serde_json::from_value(json).map_err(|e| EngineError::InvalidConfig {
        reason: e.to_string(),
    })?;

    let defaults = EngineOptions::default();
    let options = EngineOptions {
        max_parallelism: doc.max_parallelism.unwrap_or(defaults.max_parallelism),
        max_ai_concurrency: doc.max_ai_concurrency,
        fail_fast: doc.fail_fast.unwrap_or(defaults.fail_fast),
        max_routing_loops: doc.routing.max_loops.unwrap_or(defaults.max_routing_loops),
        max_workflow_depth: doc
            .limits
            .max_workflow_depth
            .unwrap_or(defaults.max_workflow_depth),
        suppression_enabled: doc
            .output
            .suppression_enabled
            .unwrap_or(defaults.suppression_enabled),
        env_allowlist: doc.env_allowlist,
    };

    if options.max_parallelism == 0 {
        return Err(EngineError::InvalidConfig {
            reason: "max_parallelism must be a positive integer".to_string(),
        });
    }
    if options.max_ai_concurrency == Some(0) {
        return Err(EngineError::InvalidConfig {
            reason: "max_ai_concurrency must be a positive integer".to_string(),
        });
    }

    let checks: IndexMap<String, CheckSpec> = doc
        .checks
        .into_iter()
        .map(|(id, check)| {
            let spec = check.into_spec(id.clone());
            (id, spec)
        })
        .collect();

    validate_catalog(&checks)?;
    warnings.extend(expression_warnings(&checks));

    if strict && !warnings.is_empty() {
        return Err(EngineError::InvalidConfig {
            reason: warnings.join("; "),
        });
    }

    for warning in &warnings {
        tracing::warn!(target: "proctor::config", "{warning}");
    }

    Ok(LoadedConfig {
        version: doc.version,
        options,
        checks,
        warnings,
    })
}

/// Deserialize a `checks` map from an in-memory JSON value.
///
/// Used by the `workflow` provider, whose nested check catalog arrives
/// inside its provider configuration.
///
/// # Errors
///
/// Returns [`EngineError::InvalidConfig`] on malformed check entries or
/// catalog validation failures.
pub fn checks_from_value(value: &Value) -> EngineResult<IndexMap<String, CheckSpec>> {
    let docs: IndexMap<String, CheckDoc> =
        serde_json::from_value(value.clone()).map_err(|e| EngineError::InvalidConfig {
            reason: format!("invalid nested checks: {e}"),
        })?;
    let checks: IndexMap<String, CheckSpec> = docs
        .into_iter()
        .map(|(id, check)| {
            let spec = check.into_spec(id.clone());
            (id, spec)
        })
        .collect();
    validate_catalog(&checks)?;
    Ok(checks)
}

fn unknown_key_warnings(raw: &serde_yaml::Value) -> EngineResult<Vec<String>> {
    let serde_yaml::Value::Mapping(mapping) = raw else {
        return Err(EngineError::InvalidConfig {
            reason: "configuration document must be a mapping".to_string(),
        });
    };

    let mut warnings = Vec::new();
    for key in mapping.keys() {
        match key.as_str() {
            Some(key) if KNOWN_TOP_LEVEL_KEYS.contains(&key) => {}
            Some(key) => warnings.push(format!("unknown top-level key: {key}")),
            None => warnings.push("non-string top-level key".to_string()),
        }
    }
    Ok(warnings)
}

/// Catalog-level validation, independent of strictness.
pub(crate) fn validate_catalog(checks: &IndexMap<String, CheckSpec>) -> EngineResult<()> {
    for (id, spec) in checks {
        if id.is_empty() {
            return Err(EngineError::InvalidConfig {
                reason: "empty check id".to_string(),
            });
        }
        for dep in spec.dependency_ids() {
            if dep == id {
                return Err(EngineError::InvalidConfig {
                    reason: format!("check `{id}` depends on itself"),
                });
            }
            if !checks.contains_key(dep) {
                return Err(EngineError::InvalidConfig {
                    reason: format!("check `{id}` depends on unknown check `{dep}`"),
                });
            }
        }
        if let Some(parent) = &spec.reuse_session {
            let Some(parent_spec) = checks.get(parent) else {
                return Err(EngineError::InvalidConfig {
                    reason: format!("check `{id}` reuses session of unknown check `{parent}`"),
                });
            };
            if parent_spec.check_type != CheckType::Ai {
                return Err(EngineError::InvalidConfig {
                    reason: format!(
                        "check `{id}` reuses session of non-ai check `{parent}`"
                    ),
                });
            }
        }
        for (name, condition) in &spec.fail_if {
            if condition.condition.trim().is_empty() {
                return Err(EngineError::InvalidConfig {
                    reason: format!("check `{id}` fail_if `{name}` has an empty condition"),
                });
            }
        }
    }
    Ok(())
}

/// Compile every expression once at load time and collect warnings for
/// ones that fail; at runtime they fall back to safe defaults anyway.
fn expression_warnings(checks: &IndexMap<String, CheckSpec>) -> Vec<String> {
    let mut warnings = Vec::new();
    let mut check_expr = |check_id: &str, role: &str, source: &str| {
        if let Err(error) = CompiledExpr::compile(source) {
            warnings.push(format!("check `{check_id}` {role}: {error}"));
        }
    };

    for (id, spec) in checks {
        if let Some(expr) = &spec.if_expr {
            check_expr(id, "if", expr);
        }
        for (name, condition) in &spec.fail_if {
            check_expr(id, &format!("fail_if `{name}`"), &condition.condition);
        }
        for directive in [&spec.on_success, &spec.on_fail].into_iter().flatten() {
            if let Some(expr) = &directive.goto_js {
                check_expr(id, "goto_js", expr);
            }
            if let Some(expr) = &directive.run_js {
                check_expr(id, "run_js", expr);
            }
        }
    }
    warnings
}
