//! Expression evaluation.
//!
//! Evaluates a parsed [`Expr`] against a read-only root object plus the
//! fixed helper surface (`contains`, `startsWith`, `endsWith`,
//! `length`, `hasIssue`, `countIssues`, `hasFileMatching`, `log`,
//! permission helpers, and the read side of `memory`). Evaluation is
//! deterministic and side-effect free except for `log`, which writes a
//! debug trace.
//!
//! Missing identifiers, members, and indexes resolve to `null` rather
//! than erroring, so conditions over absent outputs degrade gracefully.

use serde_json::{Map, Value};

use proctor_memory::MemoryStore;

use crate::types::{IssueCounts, PrInfo, Severity};

use super::parser::{BinaryOp, Expr, UnaryOp};

/// Maximum recursion depth during evaluation; mirrors
/// [`Expr::MAX_DEPTH`] with headroom for call arguments.
const MAX_EVAL_DEPTH: usize = 128;

/// An evaluation failure. Callers translate this into the safe default
/// for the expression's role; it never propagates into the engine loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalError {
    pub message: String,
}

impl EvalError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// The read-only world an expression evaluates against.
pub struct EvalInput<'a> {
    /// Root object holding `output`, `outputs` (with nested `history`),
    /// `metadata`, `env`, and `pr`.
    pub root: Value,
    /// Issue counts backing `hasIssue` / `countIssues`.
    pub metadata: IssueCounts,
    /// PR context backing the permission helpers and `hasFileMatching`.
    pub pr: &'a PrInfo,
    /// Memory store backing `memory.get` / `has` / `list` / `getAll`;
    /// absent in contexts where memory access is not allowed.
    pub memory: Option<&'a MemoryStore>,
}

impl<'a> EvalInput<'a> {
    /// Build the root object from its parts.
    #[must_use]
    pub fn new(
        output: Value,
        outputs: Value,
        metadata: IssueCounts,
        env: Value,
        pr: &'a PrInfo,
        memory: Option<&'a MemoryStore>,
    ) -> Self {
        let mut root = Map::new();
        root.insert("output".to_string(), output);
        root.insert("outputs".to_string(), outputs);
        root.insert(
            "metadata".to_string(),
            serde_json::to_value(metadata).unwrap_or(Value::Null),
        );
        root.insert("env".to_string(), env);
        root.insert(
            "pr".to_string(),
            serde_json::to_value(pr).unwrap_or(Value::Null),
        );
        Self {
            root: Value::Object(root),
            metadata,
            pr,
            memory,
        }
    }
}

/// Evaluate an expression to a value.
///
/// # Errors
///
/// Returns [`EvalError`] for type errors, unknown functions, non-finite
/// arithmetic results, or excessive recursion depth.
pub fn evaluate(expr: &Expr, input: &EvalInput<'_>) -> Result<Value, EvalError> {
    eval_at(expr, input, 0)
}

fn eval_at(expr: &Expr, input: &EvalInput<'_>, depth: usize) -> Result<Value, EvalError> {
    if depth > MAX_EVAL_DEPTH {
        return Err(EvalError::new("expression evaluation too deep"));
    }

    match expr {
        Expr::Null => Ok(Value::Null),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Number(n) => number(*n),
        Expr::Str(s) => Ok(Value::String(s.clone())),

        Expr::Ident(name) => {
            if name == "memory" {
                return Err(EvalError::new(
                    "memory is only accessible through its methods",
                ));
            }
            Ok(input.root.get(name).cloned().unwrap_or(Value::Null))
        }

        Expr::Member(receiver, name) => {
            if matches!(receiver.as_ref(), Expr::Ident(id) if id == "memory") {
                return Err(EvalError::new(
                    "memory is only accessible through its methods",
                ));
            }
            let value = eval_at(receiver, input, depth + 1)?;
            Ok(member(&value, name))
        }

        Expr::Index(receiver, index) => {
            let value = eval_at(receiver, input, depth + 1)?;
            let index = eval_at(index, input, depth + 1)?;
            Ok(indexed(&value, &index))
        }

        Expr::Call(callee, args) => call(callee, args, input, depth),

        Expr::Unary(op, inner) => {
            let value = eval_at(inner, input, depth + 1)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
                UnaryOp::Neg => {
                    let n = as_number(&value)
                        .ok_or_else(|| EvalError::new("cannot negate a non-number"))?;
                    number(-n)
                }
            }
        }

        Expr::Binary(op, lhs, rhs) => binary(*op, lhs, rhs, input, depth),

        Expr::Ternary(cond, then, otherwise) => {
            let cond = eval_at(cond, input, depth + 1)?;
            if truthy(&cond) {
                eval_at(then, input, depth + 1)
            } else {
                eval_at(otherwise, input, depth + 1)
            }
        }

        Expr::Array(items) => {
            let values: Result<Vec<Value>, EvalError> = items
                .iter()
                .map(|item| eval_at(item, input, depth + 1))
                .collect();
            Ok(Value::Array(values?))
        }
    }
}

// ---------------------------------------------------------------------------
// Operators
// ---------------------------------------------------------------------------

fn binary(
    op: BinaryOp,
    lhs: &Expr,
    rhs: &Expr,
    input: &EvalInput<'_>,
    depth: usize,
) -> Result<Value, EvalError> {
    // Short-circuit logical operators before evaluating the right side.
    match op {
        BinaryOp::And => {
            let left = eval_at(lhs, input, depth + 1)?;
            if !truthy(&left) {
                return Ok(Value::Bool(false));
            }
            let right = eval_at(rhs, input, depth + 1)?;
            return Ok(Value::Bool(truthy(&right)));
        }
        BinaryOp::Or => {
            let left = eval_at(lhs, input, depth + 1)?;
            if truthy(&left) {
                return Ok(Value::Bool(true));
            }
            let right = eval_at(rhs, input, depth + 1)?;
            return Ok(Value::Bool(truthy(&right)));
        }
        _ => {}
    }

    let left = eval_at(lhs, input, depth + 1)?;
    let right = eval_at(rhs, input, depth + 1)?;

    match op {
        BinaryOp::Eq => Ok(Value::Bool(loose_eq(&left, &right))),
        BinaryOp::Ne => Ok(Value::Bool(!loose_eq(&left, &right))),

        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare(&left, &right)?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                BinaryOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            }))
        }

        BinaryOp::Add => {
            if left.is_string() || right.is_string() {
                let mut s = display_string(&left);
                s.push_str(&display_string(&right));
                return Ok(Value::String(s));
            }
            arith(&left, &right, |a, b| a + b)
        }
        BinaryOp::Sub => arith(&left, &right, |a, b| a - b),
        BinaryOp::Mul => arith(&left, &right, |a, b| a * b),
        BinaryOp::Div => arith(&left, &right, |a, b| a / b),
        BinaryOp::Mod => arith(&left, &right, |a, b| a % b),

        BinaryOp::And | BinaryOp::Or => unreachable!(),
    }
}

fn arith(left: &Value, right: &Value, f: impl Fn(f64, f64) -> f64) -> Result<Value, EvalError> {
    let (Some(a), Some(b)) = (as_number(left), as_number(right)) else {
        return Err(EvalError::new("arithmetic on non-numbers"));
    };
    number(f(a, b))
}

fn compare(left: &Value, right: &Value) -> Result<std::cmp::Ordering, EvalError> {
    if let (Some(a), Some(b)) = (as_number(left), as_number(right)) {
        return a
            .partial_cmp(&b)
            .ok_or_else(|| EvalError::new("cannot compare NaN"));
    }
    if let (Value::String(a), Value::String(b)) = (left, right) {
        return Ok(a.cmp(b));
    }
    Err(EvalError::new("cannot compare values of these types"))
}

/// Equality with numeric coercion: numbers compare by value, everything
/// else by structural equality.
fn loose_eq(left: &Value, right: &Value) -> bool {
    if let (Some(a), Some(b)) = (as_number(left), as_number(right)) {
        #[allow(clippy::float_cmp)]
        return a == b;
    }
    left == right
}

// ---------------------------------------------------------------------------
// Member / index access
// ---------------------------------------------------------------------------

fn member(value: &Value, name: &str) -> Value {
    match value {
        Value::Object(map) => map.get(name).cloned().unwrap_or(Value::Null),
        Value::Array(items) if name == "length" => Value::Number(items.len().into()),
        Value::String(s) if name == "length" => Value::Number(s.chars().count().into()),
        _ => Value::Null,
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn indexed(value: &Value, index: &Value) -> Value {
    match (value, index) {
        (Value::Array(items), _) => as_number(index)
            .and_then(|n| {
                if n.fract() == 0.0 && n >= 0.0 {
                    items.get(n as usize).cloned()
                } else {
                    None
                }
            })
            .unwrap_or(Value::Null),
        (Value::Object(map), Value::String(key)) => map.get(key).cloned().unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

// ---------------------------------------------------------------------------
// Calls
// ---------------------------------------------------------------------------

fn call(
    callee: &Expr,
    args: &[Expr],
    input: &EvalInput<'_>,
    depth: usize,
) -> Result<Value, EvalError> {
    match callee {
        Expr::Ident(name) => {
            let values: Result<Vec<Value>, EvalError> = args
                .iter()
                .map(|arg| eval_at(arg, input, depth + 1))
                .collect();
            global_function(name, &values?, input)
        }
        Expr::Member(receiver, method) => {
            if matches!(receiver.as_ref(), Expr::Ident(id) if id == "memory") {
                let values: Result<Vec<Value>, EvalError> = args
                    .iter()
                    .map(|arg| eval_at(arg, input, depth + 1))
                    .collect();
                return memory_function(method, &values?, input);
            }
            Err(EvalError::new(format!("unknown method: {method}")))
        }
        _ => Err(EvalError::new("expression is not callable")),
    }
}

fn global_function(name: &str, args: &[Value], input: &EvalInput<'_>) -> Result<Value, EvalError> {
    match name {
        "contains" => {
            let [haystack, needle] = args else {
                return Err(EvalError::new("contains expects 2 arguments"));
            };
            let result = match haystack {
                Value::String(s) => s.contains(&display_string(needle)),
                Value::Array(items) => items.iter().any(|item| loose_eq(item, needle)),
                _ => false,
            };
            Ok(Value::Bool(result))
        }

        "startsWith" | "endsWith" => {
            let [subject, pattern] = args else {
                return Err(EvalError::new(format!("{name} expects 2 arguments")));
            };
            let subject = display_string(subject);
            let pattern = display_string(pattern);
            let result = if name == "startsWith" {
                subject.starts_with(&pattern)
            } else {
                subject.ends_with(&pattern)
            };
            Ok(Value::Bool(result))
        }

        "length" => {
            let [value] = args else {
                return Err(EvalError::new("length expects 1 argument"));
            };
            let len = match value {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                _ => 0,
            };
            Ok(Value::Number(len.into()))
        }

        "hasIssue" => Ok(Value::Bool(issue_count(args, input)? > 0)),
        "countIssues" => Ok(Value::Number(issue_count(args, input)?.into())),

        "hasFileMatching" => {
            let [pattern] = args else {
                return Err(EvalError::new("hasFileMatching expects 1 argument"));
            };
            let pattern = glob::Pattern::new(&display_string(pattern))
                .map_err(|e| EvalError::new(format!("invalid glob pattern: {e}")))?;
            Ok(Value::Bool(
                input.pr.files.iter().any(|file| pattern.matches(file)),
            ))
        }

        "log" => {
            let rendered: Vec<String> = args.iter().map(display_string).collect();
            tracing::debug!(target: "proctor::expr", "{}", rendered.join(" "));
            Ok(Value::Null)
        }

        "isOwner" => Ok(Value::Bool(input.pr.is_owner())),
        "isMember" => Ok(Value::Bool(input.pr.is_member())),
        "hasMinPermission" => {
            let [level] = args else {
                return Err(EvalError::new("hasMinPermission expects 1 argument"));
            };
            Ok(Value::Bool(
                input.pr.has_min_permission(&display_string(level)),
            ))
        }

        other => Err(EvalError::new(format!("unknown function: {other}"))),
    }
}

/// Shared implementation of `hasIssue` / `countIssues`: no argument
/// counts all severities, one argument counts a single severity.
fn issue_count(args: &[Value], input: &EvalInput<'_>) -> Result<usize, EvalError> {
    match args {
        [] => Ok(input.metadata.total),
        [severity] => {
            let severity: Severity = display_string(severity)
                .parse()
                .map_err(|_| EvalError::new("unknown severity"))?;
            Ok(input.metadata.for_severity(severity))
        }
        _ => Err(EvalError::new("expected at most 1 argument")),
    }
}

fn memory_function(
    method: &str,
    args: &[Value],
    input: &EvalInput<'_>,
) -> Result<Value, EvalError> {
    let Some(store) = input.memory else {
        return Err(EvalError::new("memory is not available in this context"));
    };

    let arg_str = |index: usize| -> Option<String> {
        args.get(index).map(display_string)
    };

    match method {
        "get" => {
            let key = arg_str(0).ok_or_else(|| EvalError::new("memory.get expects a key"))?;
            Ok(store.get(&key, arg_str(1).as_deref()).unwrap_or(Value::Null))
        }
        "has" => {
            let key = arg_str(0).ok_or_else(|| EvalError::new("memory.has expects a key"))?;
            Ok(Value::Bool(store.has(&key, arg_str(1).as_deref())))
        }
        "list" => {
            let keys = store.list(arg_str(0).as_deref());
            Ok(Value::Array(keys.into_iter().map(Value::String).collect()))
        }
        "getAll" => {
            let all = store.get_all(arg_str(0).as_deref());
            Ok(Value::Object(all.into_iter().collect()))
        }
        // Mutating operations are reserved for the memory provider.
        other => Err(EvalError::new(format!(
            "memory.{other} is not available to expressions"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Coercions
// ---------------------------------------------------------------------------

/// Truthiness: `null`, `false`, `0`, `NaN`, and `""` are falsy;
/// everything else (including empty arrays and objects) is truthy.
#[must_use]
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0 && !n.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// String coercion used by concatenation, helper arguments, and `log`.
#[must_use]
pub fn display_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    value.as_f64()
}

/// Wrap a float as a JSON number, rejecting non-finite results so that
/// division by zero cannot smuggle `Infinity`/`NaN` into the journal.
fn number(n: f64) -> Result<Value, EvalError> {
    // Serialize integral results as integers for cleaner journal output.
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        #[allow(clippy::cast_possible_truncation)]
        return Ok(Value::Number((n as i64).into()));
    }
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .ok_or_else(|| EvalError::new("non-finite arithmetic result"))
}
