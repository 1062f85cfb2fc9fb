//! Guard and routing expression language.
//!
//! A compile-once, evaluate-many mini-language used by `if` guards,
//! `fail_if` predicates, and `goto_js` / `run_js` routing directives.
//! Expressions are deterministic, perform no I/O, and expose only a
//! fixed vocabulary of values (`output`, `outputs`, `outputs.history`,
//! `metadata`, `env`, `memory`, `pr`) and helper functions.
//!
//! Failure semantics are role-specific safe defaults: a predicate that
//! fails to compile or evaluate is `false`, a `goto_js` is no jump, a
//! `run_js` is no targets. Failures are traced, never raised into the
//! engine loop.

mod eval;
mod parser;

pub use eval::{EvalError, EvalInput, display_string, truthy};
pub use parser::{BinaryOp, Expr, UnaryOp, parse_expression};

use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::scope::ScopeSegment;

/// Maximum accepted expression source length, in bytes.
pub const MAX_EXPRESSION_LEN: usize = 4096;

/// A compiled expression, ready for repeated evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledExpr {
    source: String,
    ast: Expr,
}

impl CompiledExpr {
    /// Compile an expression source string.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidExpression`] for oversized input,
    /// syntax errors, or excessive nesting.
    pub fn compile(source: &str) -> EngineResult<Self> {
        if source.len() > MAX_EXPRESSION_LEN {
            let preview: String = source.chars().take(64).collect();
            return Err(EngineError::InvalidExpression {
                expression: format!("{preview}…"),
                reason: format!("expression longer than {MAX_EXPRESSION_LEN} bytes"),
            });
        }
        let ast = parse_expression(source)?;
        Ok(Self {
            source: source.to_string(),
            ast,
        })
    }

    /// The original source string.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate to a raw value.
    ///
    /// # Errors
    ///
    /// Returns [`EvalError`] on type errors or unknown functions;
    /// callers normally go through the role-specific wrappers below.
    pub fn evaluate(&self, input: &EvalInput<'_>) -> Result<Value, EvalError> {
        eval::evaluate(&self.ast, input)
    }

    /// Evaluate as a predicate: coerced to boolean, `false` on error.
    #[must_use]
    pub fn evaluate_bool(&self, input: &EvalInput<'_>) -> bool {
        match self.evaluate(input) {
            Ok(value) => truthy(&value),
            Err(error) => {
                tracing::warn!(
                    target: "proctor::expr",
                    expression = %self.source,
                    %error,
                    "predicate evaluation failed; defaulting to false",
                );
                false
            }
        }
    }

    /// Evaluate as a `goto_js` directive: a check id, or `None` for a
    /// nullish result or any error.
    #[must_use]
    pub fn evaluate_goto(&self, input: &EvalInput<'_>) -> Option<String> {
        match self.evaluate(input) {
            Ok(Value::Null) => None,
            Ok(Value::String(target)) if !target.is_empty() => Some(target),
            Ok(Value::String(_)) => None,
            Ok(other) => {
                tracing::warn!(
                    target: "proctor::expr",
                    expression = %self.source,
                    result = %other,
                    "goto expression returned a non-string; ignoring",
                );
                None
            }
            Err(error) => {
                tracing::warn!(
                    target: "proctor::expr",
                    expression = %self.source,
                    %error,
                    "goto expression failed; ignoring",
                );
                None
            }
        }
    }

    /// Evaluate as a `run_js` directive: a list of target descriptors,
    /// empty on error.
    #[must_use]
    pub fn evaluate_run_targets(&self, input: &EvalInput<'_>) -> Vec<RunTargetSpec> {
        match self.evaluate(input) {
            Ok(value) => match run_targets_from_value(&value) {
                Ok(targets) => targets,
                Err(reason) => {
                    tracing::warn!(
                        target: "proctor::expr",
                        expression = %self.source,
                        reason,
                        "run expression returned malformed targets; ignoring",
                    );
                    Vec::new()
                }
            },
            Err(error) => {
                tracing::warn!(
                    target: "proctor::expr",
                    expression = %self.source,
                    %error,
                    "run expression failed; ignoring",
                );
                Vec::new()
            }
        }
    }
}

/// One forward-run target produced by a `run` / `run_js` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunTargetSpec {
    /// The check to run.
    pub target: String,
    /// Optional explicit scope directing the fanout at particular item
    /// indexes; `None` runs at the requester's scope.
    pub scope: Option<Vec<ScopeSegment>>,
}

impl RunTargetSpec {
    /// A target at the requester's scope.
    #[must_use]
    pub fn plain(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            scope: None,
        }
    }
}

/// Coerce a `run_js` result into target descriptors.
///
/// Accepted shapes: a single string, `null` (no targets), or an array
/// of strings and/or `{target, scope?}` objects where `scope` is a
/// list of `{check, index}` pairs.
fn run_targets_from_value(value: &Value) -> Result<Vec<RunTargetSpec>, &'static str> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::String(target) => Ok(vec![RunTargetSpec::plain(target.clone())]),
        Value::Array(items) => items.iter().map(run_target_from_item).collect(),
        _ => Err("expected a string, null, or an array of targets"),
    }
}

fn run_target_from_item(item: &Value) -> Result<RunTargetSpec, &'static str> {
    match item {
        Value::String(target) => Ok(RunTargetSpec::plain(target.clone())),
        Value::Object(map) => {
            let target = map
                .get("target")
                .or_else(|| map.get("check"))
                .and_then(Value::as_str)
                .ok_or("target object missing `target`")?;
            let scope = match map.get("scope") {
                None | Some(Value::Null) => None,
                Some(Value::Array(segments)) => Some(
                    segments
                        .iter()
                        .map(scope_segment_from_value)
                        .collect::<Result<Vec<_>, _>>()?,
                ),
                Some(_) => return Err("scope must be an array"),
            };
            Ok(RunTargetSpec {
                target: target.to_string(),
                scope,
            })
        }
        _ => Err("target must be a string or object"),
    }
}

fn scope_segment_from_value(value: &Value) -> Result<ScopeSegment, &'static str> {
    let Value::Object(map) = value else {
        return Err("scope segment must be an object");
    };
    let check_id = map
        .get("check")
        .and_then(Value::as_str)
        .ok_or("scope segment missing `check`")?;
    let index = map
        .get("index")
        .and_then(Value::as_u64)
        .ok_or("scope segment missing `index`")?;
    Ok(ScopeSegment {
        check_id: check_id.to_string(),
        index: usize::try_from(index).map_err(|_| "scope index out of range")?,
    })
}
