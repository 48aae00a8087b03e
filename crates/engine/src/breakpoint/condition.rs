// BPDB - Blueprint Graph Debugger
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Breakpoint condition language.
//!
//! Conditions are small boolean expressions over the values visible from the
//! frame about to execute:
//!
//! - pin names of the frame's node (`Condition`, `Value`)
//! - member variables of the context's object (`var.Health`)
//! - literals: integers, floats, `true`, `false`, `"strings"`, `None`
//! - comparison `== != < <= > >=`, logic `&& || !`, parentheses
//!
//! Conditions are parsed once when the breakpoint is set and evaluated on
//! every hit through a [`ConditionScope`].

use std::{cmp::Ordering, fmt, ops::Range};

use bpdb_common::types::Value;
use chumsky::prelude::*;
use logos::Logos;
use thiserror::Error;

/// Errors from parsing or evaluating a condition.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConditionError {
    /// The text is not a valid expression.
    #[error("syntax error at offset {offset}: {message}")]
    Syntax {
        /// Byte offset of the problem
        offset: usize,
        /// What went wrong
        message: String,
    },

    /// A name does not resolve to a pin or variable.
    #[error("unknown name `{0}`")]
    UnknownName(String),

    /// A name resolves but holds no value yet.
    #[error("`{0}` is not set")]
    Unset(String),

    /// An operator was applied to operands it does not support.
    #[error("cannot apply `{op}` to {lhs} and {rhs}")]
    TypeMismatch {
        /// Operator
        op: &'static str,
        /// Left operand type
        lhs: String,
        /// Right operand type
        rhs: String,
    },

    /// The expression (or a logical operand) is not a boolean.
    #[error("expected a boolean, got {0}")]
    NotBoolean(String),

    /// Reading a name failed in the host.
    #[error("failed to read `{name}`: {reason}")]
    Read {
        /// Name being read
        name: String,
        /// Host error text
        reason: String,
    },
}

/// Resolves names during condition evaluation.
pub trait ConditionScope {
    /// Value of a pin of the node about to execute.
    fn pin(&self, name: &str) -> Result<Value, ConditionError>;

    /// Value of a member variable of the context's object.
    fn variable(&self, name: &str) -> Result<Value, ConditionError>;
}

/// A name referenced by a condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ident {
    /// Pin of the current node
    Pin(String),
    /// Object variable (`var.<name>`)
    Variable(String),
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pin(name) => write!(f, "{name}"),
            Self::Variable(name) => write!(f, "var.{name}"),
        }
    }
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `&&`
    And,
    /// `||`
    Or,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::And => "&&",
            Self::Or => "||",
        }
    }

    fn accepts(self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering == Ordering::Equal,
            Self::Ne => ordering != Ordering::Equal,
            Self::Lt => ordering == Ordering::Less,
            Self::Le => ordering != Ordering::Greater,
            Self::Gt => ordering == Ordering::Greater,
            Self::Ge => ordering != Ordering::Less,
            Self::And | Self::Or => false,
        }
    }
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Constant
    Literal(Value),
    /// Name lookup
    Ident(Ident),
    /// Logical negation
    Not(Box<Expr>),
    /// Binary operation
    Binary {
        /// Operator
        op: BinaryOp,
        /// Left operand
        lhs: Box<Expr>,
        /// Right operand
        rhs: Box<Expr>,
    },
}

/// A parsed breakpoint condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    /// Parse a condition.
    pub fn parse(source: &str) -> Result<Self, ConditionError> {
        let (tokens, spans) = lex(source)?;
        let expr = expr_parser()
            .then_ignore(end())
            .parse(tokens.as_slice())
            .into_result()
            .map_err(|errors| match errors.into_iter().next() {
                // Error spans index tokens; report the byte offset of the token.
                Some(err) => ConditionError::Syntax {
                    offset: spans.get(err.span().start).map_or(source.len(), |s| s.start),
                    message: err.to_string(),
                },
                None => ConditionError::Syntax { offset: 0, message: "invalid condition".into() },
            })?;
        Ok(Self { source: source.to_string(), expr })
    }

    /// Source text as given.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Parsed tree.
    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Evaluate against a scope. Anything but a boolean result is an error.
    pub fn evaluate(&self, scope: &dyn ConditionScope) -> Result<bool, ConditionError> {
        match eval(&self.expr, scope)? {
            Value::Bool(b) => Ok(b),
            other => Err(ConditionError::NotBoolean(other.type_name().to_string())),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

fn eval(expr: &Expr, scope: &dyn ConditionScope) -> Result<Value, ConditionError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Ident(ident) => {
            let value = match ident {
                Ident::Pin(name) => scope.pin(name)?,
                Ident::Variable(name) => scope.variable(name)?,
            };
            if value.is_unset() {
                return Err(ConditionError::Unset(ident.to_string()));
            }
            Ok(value)
        }
        Expr::Not(inner) => Ok(Value::Bool(!eval_bool(inner, scope)?)),
        Expr::Binary { op: BinaryOp::And, lhs, rhs } => {
            Ok(Value::Bool(eval_bool(lhs, scope)? && eval_bool(rhs, scope)?))
        }
        Expr::Binary { op: BinaryOp::Or, lhs, rhs } => {
            Ok(Value::Bool(eval_bool(lhs, scope)? || eval_bool(rhs, scope)?))
        }
        Expr::Binary { op, lhs, rhs } => {
            let lhs = eval(lhs, scope)?;
            let rhs = eval(rhs, scope)?;
            compare(*op, &lhs, &rhs).map(Value::Bool)
        }
    }
}

fn eval_bool(expr: &Expr, scope: &dyn ConditionScope) -> Result<bool, ConditionError> {
    let value = eval(expr, scope)?;
    value.as_bool().ok_or_else(|| ConditionError::NotBoolean(value.type_name().to_string()))
}

fn compare(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<bool, ConditionError> {
    let mismatch = || ConditionError::TypeMismatch {
        op: op.symbol(),
        lhs: lhs.type_name().to_string(),
        rhs: rhs.type_name().to_string(),
    };
    let equality_only = matches!(op, BinaryOp::Eq | BinaryOp::Ne);

    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Ok(op.accepts(a.cmp(b))),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            let (a, b) = (lhs.as_f64().unwrap_or(f64::NAN), rhs.as_f64().unwrap_or(f64::NAN));
            // NaN compares unequal to everything.
            Ok(match a.partial_cmp(&b) {
                Some(ordering) => op.accepts(ordering),
                None => op == BinaryOp::Ne,
            })
        }
        (Value::String(_) | Value::Name(_), Value::String(_) | Value::Name(_)) => {
            let (a, b) = (lhs.as_str().unwrap_or_default(), rhs.as_str().unwrap_or_default());
            Ok(op.accepts(a.cmp(b)))
        }
        (Value::Bool(a), Value::Bool(b)) if equality_only => Ok(op.accepts(a.cmp(b))),
        (Value::Object(a), Value::Object(b)) if equality_only => {
            Ok((a == b) == (op == BinaryOp::Eq))
        }
        _ => Err(mismatch()),
    }
}

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n\f]+")]
enum Token {
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("None")]
    NoneValue,
    #[token("==")]
    EqEq,
    #[token("!=")]
    BangEq,
    #[token("<=")]
    LtEq,
    #[token(">=")]
    GtEq,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("&&")]
    And,
    #[token("||")]
    Or,
    #[token("!")]
    Bang,
    #[token("-")]
    Minus,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,

    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),
    #[regex(r"[0-9]+\.[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    Float(f64),
    #[regex(r#""([^"\\]|\\.)*""#, unescape)]
    Str(String),
    /// Pin name or dotted path; validated by the parser.
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z0-9_]*)*", |lex| lex.slice().to_string())]
    Name(String),
}

fn unescape(lex: &mut logos::Lexer<Token>) -> String {
    let slice = lex.slice();
    let mut text = String::with_capacity(slice.len());
    let mut chars = slice[1..slice.len() - 1].chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            text.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => text.push('\n'),
            Some('t') => text.push('\t'),
            Some(other) => text.push(other),
            None => {}
        }
    }
    text
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::True => write!(f, "true"),
            Self::False => write!(f, "false"),
            Self::NoneValue => write!(f, "None"),
            Self::EqEq => write!(f, "=="),
            Self::BangEq => write!(f, "!="),
            Self::LtEq => write!(f, "<="),
            Self::GtEq => write!(f, ">="),
            Self::Lt => write!(f, "<"),
            Self::Gt => write!(f, ">"),
            Self::And => write!(f, "&&"),
            Self::Or => write!(f, "||"),
            Self::Bang => write!(f, "!"),
            Self::Minus => write!(f, "-"),
            Self::LParen => write!(f, "("),
            Self::RParen => write!(f, ")"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Name(name) => write!(f, "{name}"),
        }
    }
}

/// Tokens with their byte ranges in the source.
fn lex(source: &str) -> Result<(Vec<Token>, Vec<Range<usize>>), ConditionError> {
    let mut tokens = Vec::new();
    let mut spans = Vec::new();
    for (token, span) in Token::lexer(source).spanned() {
        match token {
            Ok(token) => {
                tokens.push(token);
                spans.push(span);
            }
            Err(()) => {
                return Err(ConditionError::Syntax {
                    offset: span.start,
                    message: format!("unexpected `{}`", &source[span]),
                })
            }
        }
    }
    Ok((tokens, spans))
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }
}

/// `||` binds loosest, then `&&`, then a single comparison, then prefix `!`.
fn expr_parser<'src>(
) -> impl Parser<'src, &'src [Token], Expr, extra::Err<Rich<'src, Token>>> + Clone {
    recursive(|expr| {
        let literal = select! {
            Token::True => Value::Bool(true),
            Token::False => Value::Bool(false),
            Token::NoneValue => Value::Object(None),
            Token::Int(i) => Value::Int(i),
            Token::Float(x) => Value::Float(x),
            Token::Str(s) => Value::String(s),
        };
        let negative = just(Token::Minus).ignore_then(select! {
            Token::Int(i) => Value::Int(-i),
            Token::Float(x) => Value::Float(-x),
        });
        let ident = select! { Token::Name(name) => name }.try_map(|name: String, span| {
            parse_ident(&name).ok_or_else(|| Rich::custom(span, format!("invalid name `{name}`")))
        });
        let parens = expr.delimited_by(just(Token::LParen), just(Token::RParen));

        let atom = choice((
            literal.or(negative).map(Expr::Literal),
            ident.map(Expr::Ident),
            parens,
        ));

        let unary = just(Token::Bang)
            .repeated()
            .foldr(atom, |_, inner| Expr::Not(Box::new(inner)));

        let cmp_op = choice((
            just(Token::EqEq).to(BinaryOp::Eq),
            just(Token::BangEq).to(BinaryOp::Ne),
            just(Token::LtEq).to(BinaryOp::Le),
            just(Token::GtEq).to(BinaryOp::Ge),
            just(Token::Lt).to(BinaryOp::Lt),
            just(Token::Gt).to(BinaryOp::Gt),
        ));
        let comparison = unary
            .clone()
            .then(cmp_op.then(unary).or_not())
            .map(|(lhs, rest)| match rest {
                Some((op, rhs)) => binary(op, lhs, rhs),
                None => lhs,
            });

        let and = comparison.clone().foldl(
            just(Token::And).ignore_then(comparison).repeated(),
            |lhs, rhs| binary(BinaryOp::And, lhs, rhs),
        );
        and.clone()
            .foldl(just(Token::Or).ignore_then(and).repeated(), |lhs, rhs| {
                binary(BinaryOp::Or, lhs, rhs)
            })
            .boxed()
    })
}

fn parse_ident(name: &str) -> Option<Ident> {
    match name.split_once('.') {
        None => Some(Ident::Pin(name.to_string())),
        Some(("var", rest)) if !rest.is_empty() && !rest.contains('.') => {
            Some(Ident::Variable(rest.to_string()))
        }
        Some(_) => None,
    }
}
