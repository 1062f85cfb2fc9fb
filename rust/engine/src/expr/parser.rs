//! Expression parser.
//!
//! Parses the guard/routing expression language into an [`Expr`] AST:
//!
//! ```text
//! Expr        ::= Ternary
//! Ternary     ::= Or ( '?' Expr ':' Expr )?
//! Or          ::= And ( '||' And )*
//! And         ::= Equality ( '&&' Equality )*
//! Equality    ::= Comparison ( ('==' | '!=') Comparison )*
//! Comparison  ::= Additive ( ('<=' | '>=' | '<' | '>') Additive )*
//! Additive    ::= Multiplicative ( ('+' | '-') Multiplicative )*
//! Multiplicative ::= Unary ( ('*' | '/' | '%') Unary )*
//! Unary       ::= ('!' | '-') Unary | Postfix
//! Postfix     ::= Primary ( '.' Ident | '[' Expr ']' | '(' Args ')' )*
//! Primary     ::= Number | String | 'true' | 'false' | 'null'
//!               | Ident | '(' Expr ')' | '[' Args ']'
//! ```
//!
//! Strings accept single or double quotes with `\n \t \\ \' \"` escapes.

use winnow::{
    ModalResult, Parser,
    ascii::multispace0,
    combinator::{alt, opt, peek},
    token::{any, take_while},
};

use crate::error::{EngineError, EngineResult};

/// A unary operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// Logical negation (`!`).
    Not,
    /// Arithmetic negation (`-`).
    Neg,
}

/// A binary operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    /// A bare identifier resolved against the evaluation root.
    Ident(String),
    /// Member access: `receiver.name`.
    Member(Box<Expr>, String),
    /// Index access: `receiver[index]`.
    Index(Box<Expr>, Box<Expr>),
    /// A call: `callee(args)`; callee is an identifier (global
    /// function) or a member (e.g. `memory.get`).
    Call(Box<Expr>, Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// `cond ? then : else`.
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    /// An array literal.
    Array(Vec<Expr>),
}

impl Expr {
    /// Maximum nesting depth of the AST; deeper expressions are
    /// rejected at compile time to bound evaluation.
    pub const MAX_DEPTH: usize = 64;

    fn depth(&self) -> usize {
        1 + match self {
            Self::Null | Self::Bool(_) | Self::Number(_) | Self::Str(_) | Self::Ident(_) => 0,
            Self::Member(receiver, _) => receiver.depth(),
            Self::Index(receiver, index) => receiver.depth().max(index.depth()),
            Self::Call(callee, args) => callee
                .depth()
                .max(args.iter().map(Self::depth).max().unwrap_or(0)),
            Self::Unary(_, inner) => inner.depth(),
            Self::Binary(_, lhs, rhs) => lhs.depth().max(rhs.depth()),
            Self::Ternary(cond, then, otherwise) => cond
                .depth()
                .max(then.depth())
                .max(otherwise.depth()),
            Self::Array(items) => items.iter().map(Self::depth).max().unwrap_or(0),
        }
    }
}

/// Parse an expression string into an AST.
///
/// # Errors
///
/// Returns [`EngineError::InvalidExpression`] for syntax errors,
/// trailing input, or expressions nested deeper than
/// [`Expr::MAX_DEPTH`].
pub fn parse_expression(source: &str) -> EngineResult<Expr> {
    let invalid = |reason: String| EngineError::InvalidExpression {
        expression: source.to_string(),
        reason,
    };

    if source.trim().is_empty() {
        return Err(invalid("empty expression".to_string()));
    }

    let mut remaining = source;
    let expr = (ws, expression, ws)
        .map(|((), expr, ())| expr)
        .parse_next(&mut remaining)
        .map_err(|e| invalid(format!("parse error: {e}")))?;

    if !remaining.trim().is_empty() {
        return Err(invalid(format!("unexpected trailing input: {remaining}")));
    }

    if expr.depth() > Expr::MAX_DEPTH {
        return Err(invalid(format!(
            "expression nested deeper than {}",
            Expr::MAX_DEPTH
        )));
    }

    Ok(expr)
}

// ---------------------------------------------------------------------------
// Winnow parsers
// ---------------------------------------------------------------------------

fn backtrack() -> winnow::error::ErrMode<winnow::error::ContextError> {
    winnow::error::ErrMode::Backtrack(winnow::error::ContextError::new())
}

/// Parse whitespace (spaces, tabs, newlines).
fn ws(input: &mut &str) -> ModalResult<()> {
    multispace0.void().parse_next(input)
}

fn expression(input: &mut &str) -> ModalResult<Expr> {
    ternary(input)
}

fn ternary(input: &mut &str) -> ModalResult<Expr> {
    let cond = or_expr.parse_next(input)?;
    let question: Option<char> = opt(preceded_ws('?')).parse_next(input)?;
    if question.is_none() {
        return Ok(cond);
    }
    ws.parse_next(input)?;
    let then = expression.parse_next(input)?;
    ws.parse_next(input)?;
    ':'.parse_next(input)?;
    ws.parse_next(input)?;
    let otherwise = expression.parse_next(input)?;
    Ok(Expr::Ternary(
        Box::new(cond),
        Box::new(then),
        Box::new(otherwise),
    ))
}

/// Wrap a single-char operator with leading whitespace consumption.
fn preceded_ws(op: char) -> impl FnMut(&mut &str) -> ModalResult<char> {
    move |input: &mut &str| {
        let mut op = op;
        let checkpoint = *input;
        ws.parse_next(input)?;
        match op.parse_next(input) {
            Ok(c) => Ok(c),
            Err(e) => {
                *input = checkpoint;
                Err(e)
            }
        }
    }
}

/// Try to parse one of the given operator strings (longest first),
/// consuming leading whitespace only on success.
fn binary_op(ops: &'static [(&'static str, BinaryOp)]) -> impl FnMut(&mut &str) -> ModalResult<BinaryOp> {
    move |input: &mut &str| {
        let checkpoint = *input;
        ws.parse_next(input)?;
        for (text, op) in ops {
            if let Some(rest) = input.strip_prefix(text) {
                *input = rest;
                return Ok(*op);
            }
        }
        *input = checkpoint;
        Err(backtrack())
    }
}

fn or_expr(input: &mut &str) -> ModalResult<Expr> {
    let mut lhs = and_expr.parse_next(input)?;
    while let Some(op) = opt(binary_op(&[("||", BinaryOp::Or)])).parse_next(input)? {
        ws.parse_next(input)?;
        let rhs = and_expr.parse_next(input)?;
        lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
    }
    Ok(lhs)
}

fn and_expr(input: &mut &str) -> ModalResult<Expr> {
    let mut lhs = equality.parse_next(input)?;
    while let Some(op) = opt(binary_op(&[("&&", BinaryOp::And)])).parse_next(input)? {
        ws.parse_next(input)?;
        let rhs = equality.parse_next(input)?;
        lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
    }
    Ok(lhs)
}

fn equality(input: &mut &str) -> ModalResult<Expr> {
    let mut lhs = comparison.parse_next(input)?;
    while let Some(op) =
        opt(binary_op(&[("==", BinaryOp::Eq), ("!=", BinaryOp::Ne)])).parse_next(input)?
    {
        ws.parse_next(input)?;
        let rhs = comparison.parse_next(input)?;
        lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
    }
    Ok(lhs)
}

fn comparison(input: &mut &str) -> ModalResult<Expr> {
    let mut lhs = additive.parse_next(input)?;
    while let Some(op) = opt(binary_op(&[
        ("<=", BinaryOp::Le),
        (">=", BinaryOp::Ge),
        ("<", BinaryOp::Lt),
        (">", BinaryOp::Gt),
    ]))
    .parse_next(input)?
    {
        ws.parse_next(input)?;
        let rhs = additive.parse_next(input)?;
        lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
    }
    Ok(lhs)
}

fn additive(input: &mut &str) -> ModalResult<Expr> {
    let mut lhs = multiplicative.parse_next(input)?;
    while let Some(op) =
        opt(binary_op(&[("+", BinaryOp::Add), ("-", BinaryOp::Sub)])).parse_next(input)?
    {
        ws.parse_next(input)?;
        let rhs = multiplicative.parse_next(input)?;
        lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
    }
    Ok(lhs)
}

fn multiplicative(input: &mut &str) -> ModalResult<Expr> {
    let mut lhs = unary.parse_next(input)?;
    while let Some(op) = opt(binary_op(&[
        ("*", BinaryOp::Mul),
        ("/", BinaryOp::Div),
        ("%", BinaryOp::Mod),
    ]))
    .parse_next(input)?
    {
        ws.parse_next(input)?;
        let rhs = unary.parse_next(input)?;
        lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
    }
    Ok(lhs)
}

fn unary(input: &mut &str) -> ModalResult<Expr> {
    let checkpoint = *input;
    ws.parse_next(input)?;
    if let Some(rest) = input.strip_prefix('!') {
        // `!=` at this position would be a malformed equality, not a
        // negation; leave it for the caller to fail on.
        if !rest.starts_with('=') {
            *input = rest;
            ws.parse_next(input)?;
            let inner = unary.parse_next(input)?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)));
        }
    }
    if let Some(rest) = input.strip_prefix('-') {
        *input = rest;
        ws.parse_next(input)?;
        let inner = unary.parse_next(input)?;
        return Ok(Expr::Unary(UnaryOp::Neg, Box::new(inner)));
    }
    *input = checkpoint;
    postfix(input)
}

fn postfix(input: &mut &str) -> ModalResult<Expr> {
    ws.parse_next(input)?;
    let mut expr = primary.parse_next(input)?;
    loop {
        let checkpoint = *input;
        ws.parse_next(input)?;
        if let Some(rest) = input.strip_prefix('.') {
            // Reject `1 .foo`-style access on a trailing dot with no
            // identifier by backtracking below.
            *input = rest;
            match identifier.parse_next(input) {
                Ok(name) => {
                    expr = Expr::Member(Box::new(expr), name.to_string());
                    continue;
                }
                Err(_) => {
                    *input = checkpoint;
                    break;
                }
            }
        }
        if let Some(rest) = input.strip_prefix('[') {
            *input = rest;
            ws.parse_next(input)?;
            let index = expression.parse_next(input)?;
            ws.parse_next(input)?;
            ']'.parse_next(input)?;
            expr = Expr::Index(Box::new(expr), Box::new(index));
            continue;
        }
        if let Some(rest) = input.strip_prefix('(') {
            *input = rest;
            let args = argument_list.parse_next(input)?;
            ws.parse_next(input)?;
            ')'.parse_next(input)?;
            expr = Expr::Call(Box::new(expr), args);
            continue;
        }
        *input = checkpoint;
        break;
    }
    Ok(expr)
}

/// Parse a comma-separated argument list (no delimiters).
fn argument_list(input: &mut &str) -> ModalResult<Vec<Expr>> {
    let mut args = Vec::new();
    ws.parse_next(input)?;
    if input.starts_with(')') || input.starts_with(']') {
        return Ok(args);
    }
    loop {
        let arg = expression.parse_next(input)?;
        args.push(arg);
        let comma: Option<char> = opt(preceded_ws(',')).parse_next(input)?;
        if comma.is_none() {
            return Ok(args);
        }
        ws.parse_next(input)?;
    }
}

fn primary(input: &mut &str) -> ModalResult<Expr> {
    alt((
        string_literal,
        number_literal,
        keyword_or_ident,
        parenthesized,
        array_literal,
    ))
    .parse_next(input)
}

fn parenthesized(input: &mut &str) -> ModalResult<Expr> {
    '('.parse_next(input)?;
    ws.parse_next(input)?;
    let expr = expression.parse_next(input)?;
    ws.parse_next(input)?;
    ')'.parse_next(input)?;
    Ok(expr)
}

fn array_literal(input: &mut &str) -> ModalResult<Expr> {
    '['.parse_next(input)?;
    let items = argument_list.parse_next(input)?;
    ws.parse_next(input)?;
    ']'.parse_next(input)?;
    Ok(Expr::Array(items))
}

/// Parse a bare identifier: `[A-Za-z_][A-Za-z0-9_]*`.
fn identifier<'s>(input: &mut &'s str) -> ModalResult<&'s str> {
    (
        take_while(1, |c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(0.., |c: char| c.is_ascii_alphanumeric() || c == '_'),
    )
        .take()
        .parse_next(input)
}

/// Parse `true`/`false`/`null` keywords or a bare identifier.
fn keyword_or_ident(input: &mut &str) -> ModalResult<Expr> {
    let name = identifier.parse_next(input)?;
    Ok(match name {
        "true" => Expr::Bool(true),
        "false" => Expr::Bool(false),
        "null" => Expr::Null,
        other => Expr::Ident(other.to_string()),
    })
}

/// Parse a number: `[0-9]+ ('.' [0-9]+)?`.
fn number_literal(input: &mut &str) -> ModalResult<Expr> {
    let checkpoint = *input;
    let digits: &str = take_while(1.., |c: char| c.is_ascii_digit()).parse_next(input)?;
    let fraction: Option<(char, &str)> = opt((
        '.',
        take_while(1.., |c: char| c.is_ascii_digit()),
    ))
    .parse_next(input)?;

    let mut text = digits.to_string();
    if let Some((_, frac)) = fraction {
        text.push('.');
        text.push_str(frac);
    }
    let n: f64 = text.parse().map_err(|_| {
        *input = checkpoint;
        backtrack()
    })?;
    Ok(Expr::Number(n))
}

/// Parse a string literal with either quote style, handling escapes.
fn string_literal(input: &mut &str) -> ModalResult<Expr> {
    let quote = peek(any).parse_next(input)?;
    if quote != '\'' && quote != '"' {
        return Err(backtrack());
    }
    let _ = any.parse_next(input)?;

    let mut result = String::new();
    loop {
        let chunk: &str =
            take_while(0.., |c: char| c != quote && c != '\\').parse_next(input)?;
        result.push_str(chunk);

        let next = peek(any).parse_next(input)?;
        if next == quote {
            let _ = any.parse_next(input)?;
            return Ok(Expr::Str(result));
        }
        // Must be a backslash escape.
        let _ = any.parse_next(input)?;
        let escaped = any.parse_next(input)?;
        match escaped {
            'n' => result.push('\n'),
            't' => result.push('\t'),
            '\\' => result.push('\\'),
            '\'' => result.push('\''),
            '"' => result.push('"'),
            _ => {
                return Err(winnow::error::ErrMode::Cut(
                    winnow::error::ContextError::new(),
                ));
            }
        }
    }
}
