//! Condition Expressions
//!
//! Boolean expressions used for step skip-conditions and risk rules:
//!
//! ```text
//! $input.load > 1000 AND $step2.status IN [ok, degraded]
//! NOT ($context.actor == 'batch') OR $step1.margin <= 0.15
//! ```
//!
//! A condition is parsed once into an [`Expr`] tree and evaluated many
//! times. `OR` binds loosest, then `AND`, then `NOT`; both combinators
//! short-circuit. Ordering operators need numbers on both sides; equality
//! falls back to exact matching. Any unresolved reference or type mismatch
//! makes the whole condition false and is logged, never raised.

use std::fmt;

use log::warn;
use serde_json::{Number, Value};
use thiserror::Error;

use super::reference::{ResolveError, VariableRef};
use crate::execution::context::ExecutionContext;

/// Errors raised while parsing a condition.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConditionError {
    #[error("condition is empty")]
    Empty,

    #[error("unexpected character '{ch}' at position {pos}")]
    UnexpectedChar { ch: char, pos: usize },

    #[error("unterminated string starting at position {0}")]
    UnterminatedString(usize),

    #[error("invalid number '{0}'")]
    InvalidNumber(String),

    #[error("unexpected {found} at position {pos}, expected {expected}")]
    Unexpected {
        found: String,
        expected: String,
        pos: usize,
    },

    #[error("unexpected end of condition, expected {0}")]
    UnexpectedEnd(String),

    #[error("parentheses nested deeper than {max} at position {pos}")]
    TooDeep { max: usize, pos: usize },

    #[error(transparent)]
    Reference(#[from] ResolveError),
}

/// Why an evaluation was treated as false.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConditionAnomaly {
    #[error(transparent)]
    Unresolved(#[from] ResolveError),

    #[error("cannot compare {left} {op} {right}: both sides must be numbers")]
    NotNumeric { left: Value, op: CmpOp, right: Value },
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Gt => ">",
            CmpOp::Le => "<=",
            CmpOp::Ge => ">=",
        };
        f.write_str(s)
    }
}

/// A comparison operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(Value),
    Variable(VariableRef),
}

/// Parsed condition tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Compare {
        left: Operand,
        op: CmpOp,
        right: Operand,
    },
    In {
        value: Operand,
        list: Vec<Operand>,
        negated: bool,
    },
    /// A bare operand, tested for truthiness.
    Truthy(Operand),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Every variable reference in the tree, left to right.
    pub fn references(&self) -> Vec<&VariableRef> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a VariableRef>) {
        fn push<'a>(operand: &'a Operand, out: &mut Vec<&'a VariableRef>) {
            if let Operand::Variable(v) = operand {
                out.push(v);
            }
        }
        match self {
            Expr::Compare { left, right, .. } => {
                push(left, out);
                push(right, out);
            }
            Expr::In { value, list, .. } => {
                push(value, out);
                for item in list {
                    push(item, out);
                }
            }
            Expr::Truthy(operand) => push(operand, out),
            Expr::Not(inner) => inner.collect_references(out),
            Expr::And(a, b) | Expr::Or(a, b) => {
                a.collect_references(out);
                b.collect_references(out);
            }
        }
    }

    /// Evaluates the tree, surfacing the first anomaly encountered.
    pub fn eval(&self, ctx: &ExecutionContext) -> Result<bool, ConditionAnomaly> {
        match self {
            Expr::Compare { left, op, right } => {
                let l = operand_value(left, ctx)?;
                let r = operand_value(right, ctx)?;
                compare(&l, *op, &r)
            }
            Expr::In {
                value,
                list,
                negated,
            } => {
                let needle = operand_value(value, ctx)?;
                let mut found = false;
                for item in list {
                    if values_equal(&needle, &operand_value(item, ctx)?) {
                        found = true;
                        break;
                    }
                }
                Ok(found != *negated)
            }
            Expr::Truthy(operand) => Ok(truthy(&operand_value(operand, ctx)?)),
            Expr::Not(inner) => Ok(!inner.eval(ctx)?),
            Expr::And(a, b) => Ok(a.eval(ctx)? && b.eval(ctx)?),
            Expr::Or(a, b) => Ok(a.eval(ctx)? || b.eval(ctx)?),
        }
    }
}

/// A parsed condition together with its source text.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    /// Parses a condition string.
    pub fn parse(source: &str) -> Result<Self, ConditionError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(ConditionError::Empty);
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.parse_or()?;
        if let Some(tok) = parser.peek() {
            return Err(ConditionError::Unexpected {
                found: tok.kind.describe(),
                expected: "end of condition".to_string(),
                pos: tok.pos,
            });
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    /// The original condition text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The parsed tree.
    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Evaluates the condition, reporting anomalies instead of hiding them.
    pub fn try_evaluate(&self, ctx: &ExecutionContext) -> Result<bool, ConditionAnomaly> {
        self.expr.eval(ctx)
    }

    /// Evaluates the condition; anomalies are logged and count as false.
    pub fn evaluate(&self, ctx: &ExecutionContext) -> bool {
        match self.expr.eval(ctx) {
            Ok(result) => result,
            Err(anomaly) => {
                warn!("Condition '{}' treated as false: {}", self.source, anomaly);
                false
            }
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn operand_value(operand: &Operand, ctx: &ExecutionContext) -> Result<Value, ConditionAnomaly> {
    match operand {
        Operand::Literal(v) => Ok(v.clone()),
        Operand::Variable(var) => Ok(var.resolve(ctx)?.clone()),
    }
}

fn compare(left: &Value, op: CmpOp, right: &Value) -> Result<bool, ConditionAnomaly> {
    match op {
        CmpOp::Eq => Ok(values_equal(left, right)),
        CmpOp::Ne => Ok(!values_equal(left, right)),
        _ => {
            let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) else {
                return Err(ConditionAnomaly::NotNumeric {
                    left: left.clone(),
                    op,
                    right: right.clone(),
                });
            };
            Ok(match op {
                CmpOp::Lt => l < r,
                CmpOp::Gt => l > r,
                CmpOp::Le => l <= r,
                CmpOp::Ge => l >= r,
                CmpOp::Eq | CmpOp::Ne => unreachable!("handled above"),
            })
        }
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => l.as_f64() == r.as_f64(),
        _ => left == right,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Cmp(CmpOp),
    And,
    Or,
    Not,
    In,
    Literal(Value),
    Reference(String),
}

impl TokenKind {
    fn describe(&self) -> String {
        match self {
            TokenKind::LParen => "'('".to_string(),
            TokenKind::RParen => "')'".to_string(),
            TokenKind::LBracket => "'['".to_string(),
            TokenKind::RBracket => "']'".to_string(),
            TokenKind::Comma => "','".to_string(),
            TokenKind::Cmp(op) => format!("'{}'", op),
            TokenKind::And => "AND".to_string(),
            TokenKind::Or => "OR".to_string(),
            TokenKind::Not => "NOT".to_string(),
            TokenKind::In => "IN".to_string(),
            TokenKind::Literal(v) => format!("literal {}", v),
            TokenKind::Reference(r) => format!("reference {}", r),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    pos: usize,
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-' || c == '.'
}

fn tokenize(source: &str) -> Result<Vec<Token>, ConditionError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let kind = match c {
            '(' => {
                i += 1;
                TokenKind::LParen
            }
            ')' => {
                i += 1;
                TokenKind::RParen
            }
            '[' => {
                i += 1;
                TokenKind::LBracket
            }
            ']' => {
                i += 1;
                TokenKind::RBracket
            }
            ',' => {
                i += 1;
                TokenKind::Comma
            }
            '=' | '!' | '<' | '>' => {
                let next = chars.get(i + 1).copied();
                let (op, width) = match (c, next) {
                    ('=', Some('=')) => (CmpOp::Eq, 2),
                    ('!', Some('=')) => (CmpOp::Ne, 2),
                    ('<', Some('=')) => (CmpOp::Le, 2),
                    ('>', Some('=')) => (CmpOp::Ge, 2),
                    ('<', _) => (CmpOp::Lt, 1),
                    ('>', _) => (CmpOp::Gt, 1),
                    _ => return Err(ConditionError::UnexpectedChar { ch: c, pos: i }),
                };
                i += width;
                TokenKind::Cmp(op)
            }
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(ConditionError::UnterminatedString(start)),
                        Some('\\') if i + 1 < chars.len() => {
                            text.push(chars[i + 1]);
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        }
                    }
                }
                TokenKind::Literal(Value::String(text))
            }
            '$' => {
                i += 1;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                TokenKind::Reference(raw)
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).map_or(false, |n| n.is_ascii_digit())) =>
            {
                i += 1;
                while i < chars.len() {
                    let ch = chars[i];
                    let exponent_sign =
                        (ch == '+' || ch == '-') && matches!(chars[i - 1], 'e' | 'E');
                    if ch.is_ascii_digit() || ch == '.' || ch == 'e' || ch == 'E' || exponent_sign {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                TokenKind::Literal(parse_number(&text)?)
            }
            c if is_word_char(c) => {
                while i < chars.len() && is_word_char(chars[i]) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.to_ascii_uppercase().as_str() {
                    "AND" => TokenKind::And,
                    "OR" => TokenKind::Or,
                    "NOT" => TokenKind::Not,
                    "IN" => TokenKind::In,
                    "TRUE" => TokenKind::Literal(Value::Bool(true)),
                    "FALSE" => TokenKind::Literal(Value::Bool(false)),
                    "NULL" => TokenKind::Literal(Value::Null),
                    _ => TokenKind::Literal(Value::String(word)),
                }
            }
            other => return Err(ConditionError::UnexpectedChar { ch: other, pos: i }),
        };

        tokens.push(Token { kind, pos: start });
    }

    Ok(tokens)
}

fn parse_number(text: &str) -> Result<Value, ConditionError> {
    if let Ok(i) = text.parse::<i64>() {
        return Ok(Value::Number(Number::from(i)));
    }
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| ConditionError::InvalidNumber(text.to_string()))
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Deepest parenthesised group accepted.
const MAX_NESTING: usize = 32;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<&TokenKind> {
        self.peek().map(|t| &t.kind)
    }

    fn peek_kind_at(&self, offset: usize) -> Option<&TokenKind> {
        self.tokens.get(self.pos + offset).map(|t| &t.kind)
    }

    fn next(&mut self, expected: &str) -> Result<Token, ConditionError> {
        let tok = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| ConditionError::UnexpectedEnd(expected.to_string()))?;
        self.pos += 1;
        Ok(tok)
    }

    fn parse_or(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_and()?;
        while self.peek_kind() == Some(&TokenKind::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_not()?;
        while self.peek_kind() == Some(&TokenKind::And) {
            self.pos += 1;
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    /// Runs of NOT collapse pairwise: an even count is no negation.
    fn parse_not(&mut self) -> Result<Expr, ConditionError> {
        let mut negations = 0usize;
        while self.peek_kind() == Some(&TokenKind::Not) {
            self.pos += 1;
            negations += 1;
        }
        let inner = self.parse_primary()?;
        if negations % 2 == 1 {
            return Ok(Expr::Not(Box::new(inner)));
        }
        Ok(inner)
    }

    fn parse_primary(&mut self) -> Result<Expr, ConditionError> {
        if let Some(open) = self.peek().filter(|t| t.kind == TokenKind::LParen) {
            let pos = open.pos;
            if self.depth == MAX_NESTING {
                return Err(ConditionError::TooDeep {
                    max: MAX_NESTING,
                    pos,
                });
            }
            self.pos += 1;
            self.depth += 1;
            let inner = self.parse_or()?;
            self.depth -= 1;
            let close = self.next("')'")?;
            if close.kind != TokenKind::RParen {
                return Err(ConditionError::Unexpected {
                    found: close.kind.describe(),
                    expected: "')'".to_string(),
                    pos: close.pos,
                });
            }
            return Ok(inner);
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ConditionError> {
        let left = self.parse_operand()?;

        match self.peek_kind() {
            Some(TokenKind::Cmp(op)) => {
                let op = *op;
                self.pos += 1;
                let right = self.parse_operand()?;
                Ok(Expr::Compare { left, op, right })
            }
            Some(TokenKind::In) => {
                self.pos += 1;
                let list = self.parse_list()?;
                Ok(Expr::In {
                    value: left,
                    list,
                    negated: false,
                })
            }
            Some(TokenKind::Not) if self.peek_kind_at(1) == Some(&TokenKind::In) => {
                self.pos += 2;
                let list = self.parse_list()?;
                Ok(Expr::In {
                    value: left,
                    list,
                    negated: true,
                })
            }
            _ => Ok(Expr::Truthy(left)),
        }
    }

    fn parse_operand(&mut self) -> Result<Operand, ConditionError> {
        let tok = self.next("a value or reference")?;
        match tok.kind {
            TokenKind::Literal(v) => Ok(Operand::Literal(v)),
            TokenKind::Reference(raw) => Ok(Operand::Variable(VariableRef::parse(&raw)?)),
            other => Err(ConditionError::Unexpected {
                found: other.describe(),
                expected: "a value or reference".to_string(),
                pos: tok.pos,
            }),
        }
    }

    fn parse_list(&mut self) -> Result<Vec<Operand>, ConditionError> {
        let open = self.next("'[' or '('")?;
        let close_kind = match open.kind {
            TokenKind::LBracket => TokenKind::RBracket,
            TokenKind::LParen => TokenKind::RParen,
            other => {
                return Err(ConditionError::Unexpected {
                    found: other.describe(),
                    expected: "'[' or '('".to_string(),
                    pos: open.pos,
                })
            }
        };

        let mut items = Vec::new();
        if self.peek_kind() == Some(&close_kind) {
            self.pos += 1;
            return Ok(items);
        }

        loop {
            items.push(self.parse_operand()?);
            let tok = self.next("',' or end of list")?;
            if tok.kind == TokenKind::Comma {
                continue;
            }
            if tok.kind == close_kind {
                return Ok(items);
            }
            return Err(ConditionError::Unexpected {
                found: tok.kind.describe(),
                expected: "',' or end of list".to_string(),
                pos: tok.pos,
            });
        }
    }
}
