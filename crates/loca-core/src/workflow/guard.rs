//! Guard and loop-condition expressions.
//!
//! ```text
//! expr     := or
//! or       := and ( "||" and )*
//! and      := unary ( "&&" unary )*
//! unary    := "!" unary | compare
//! compare  := operand ( ( "==" | "!=" | "contains" ) operand )?
//! operand  := reference | string | "true" | "false" | "(" expr ")"
//! reference:= step "." ( "status" | "result" | "error" )
//! ```
//!
//! `step` is a step name or id. A missing result or error reads as the
//! empty string. Expressions nest at most [`MAX_NESTING`] levels, counting
//! negations, parentheses and chained `&&`/`||` operators.

use std::fmt;
use std::iter::Peekable;
use std::str::CharIndices;

use loca_db::models::WorkflowStep;

/// Deepest expression tree a guard may build.
pub const MAX_NESTING: usize = 64;

/// Why a guard could not be parsed or evaluated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuardError {
    #[error("syntax error at offset {pos}: {message}")]
    Syntax { pos: usize, message: String },

    #[error("expression nested deeper than {MAX_NESTING} levels at offset {pos}")]
    TooDeep { pos: usize },

    #[error("unknown step {0:?}")]
    UnknownStep(String),

    #[error("unknown field {0:?} (expected status, result or error)")]
    UnknownField(String),

    #[error("expected a boolean, found {0}")]
    NotBoolean(String),

    #[error("operator {op} expects {expected}, found {found}")]
    TypeMismatch {
        op: &'static str,
        expected: &'static str,
        found: String,
    },
}

/// Field of a step a reference reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Status,
    Result,
    Error,
}

impl Field {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "status" => Some(Self::Status),
            "result" => Some(Self::Result),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
    Contains(Box<Expr>, Box<Expr>),
    Ref { step: String, field: Field },
    Str(String),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    Str(String),
    Bool(bool),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "string {s:?}"),
            Self::Bool(b) => write!(f, "boolean {b}"),
        }
    }
}

/// A parsed guard, ready to evaluate.
#[derive(Debug, Clone, PartialEq)]
pub struct Guard {
    expr: Expr,
}

impl Guard {
    /// Parse an expression.
    pub fn parse(source: &str) -> Result<Self, GuardError> {
        let tokens = lex(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            end: source.len(),
            depth: 0,
        };
        let expr = parser.expr()?;
        if let Some(tok) = parser.peek() {
            return Err(GuardError::Syntax {
                pos: tok.pos,
                message: format!("unexpected {}", tok.kind),
            });
        }
        Ok(Self { expr })
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Names or ids of every step the expression reads.
    pub fn referenced_steps(&self) -> Vec<&str> {
        let mut out = Vec::new();
        collect_refs(&self.expr, &mut out);
        out
    }

    /// Evaluate against the current step states.
    pub fn evaluate(&self, steps: &[WorkflowStep]) -> Result<bool, GuardError> {
        match eval(&self.expr, steps)? {
            Value::Bool(b) => Ok(b),
            other => Err(GuardError::NotBoolean(other.to_string())),
        }
    }
}

/// Parse and evaluate in one go.
pub fn evaluate(source: &str, steps: &[WorkflowStep]) -> Result<bool, GuardError> {
    Guard::parse(source)?.evaluate(steps)
}

fn collect_refs<'a>(expr: &'a Expr, out: &mut Vec<&'a str>) {
    match expr {
        Expr::Or(a, b) | Expr::And(a, b) | Expr::Eq(a, b) | Expr::Ne(a, b) | Expr::Contains(a, b) => {
            collect_refs(a, out);
            collect_refs(b, out);
        }
        Expr::Not(a) => collect_refs(a, out),
        Expr::Ref { step, .. } => out.push(step),
        Expr::Str(_) | Expr::Bool(_) => {}
    }
}

fn find_step<'a>(steps: &'a [WorkflowStep], key: &str) -> Option<&'a WorkflowStep> {
    steps
        .iter()
        .find(|s| s.name == key)
        .or_else(|| steps.iter().find(|s| s.id.to_string() == key))
}

fn eval(expr: &Expr, steps: &[WorkflowStep]) -> Result<Value, GuardError> {
    match expr {
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Str(s) => Ok(Value::Str(s.clone())),
        Expr::Ref { step, field } => {
            let found = find_step(steps, step).ok_or_else(|| GuardError::UnknownStep(step.clone()))?;
            let value = match field {
                Field::Status => found.status.to_string(),
                Field::Result => found.result.clone().unwrap_or_default(),
                Field::Error => found.error.clone().unwrap_or_default(),
            };
            Ok(Value::Str(value))
        }
        Expr::Not(inner) => Ok(Value::Bool(!as_bool("!", eval(inner, steps)?)?)),
        Expr::And(a, b) => {
            if !as_bool("&&", eval(a, steps)?)? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(as_bool("&&", eval(b, steps)?)?))
        }
        Expr::Or(a, b) => {
            if as_bool("||", eval(a, steps)?)? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(as_bool("||", eval(b, steps)?)?))
        }
        Expr::Eq(a, b) => Ok(Value::Bool(eval(a, steps)? == eval(b, steps)?)),
        Expr::Ne(a, b) => Ok(Value::Bool(eval(a, steps)? != eval(b, steps)?)),
        Expr::Contains(a, b) => {
            let haystack = as_str("contains", eval(a, steps)?)?;
            let needle = as_str("contains", eval(b, steps)?)?;
            Ok(Value::Bool(haystack.contains(&needle)))
        }
    }
}

fn as_bool(op: &'static str, value: Value) -> Result<bool, GuardError> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(GuardError::TypeMismatch {
            op,
            expected: "booleans",
            found: other.to_string(),
        }),
    }
}

fn as_str(op: &'static str, value: Value) -> Result<String, GuardError> {
    match value {
        Value::Str(s) => Ok(s),
        other => Err(GuardError::TypeMismatch {
            op,
            expected: "strings",
            found: other.to_string(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(String),
    Str(String),
    Dot,
    AndAnd,
    OrOr,
    Bang,
    EqEq,
    NotEq,
    LParen,
    RParen,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ident(s) => write!(f, "identifier {s:?}"),
            Self::Str(s) => write!(f, "string {s:?}"),
            Self::Dot => f.write_str("'.'"),
            Self::AndAnd => f.write_str("'&&'"),
            Self::OrOr => f.write_str("'||'"),
            Self::Bang => f.write_str("'!'"),
            Self::EqEq => f.write_str("'=='"),
            Self::NotEq => f.write_str("'!='"),
            Self::LParen => f.write_str("'('"),
            Self::RParen => f.write_str("')'"),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    pos: usize,
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}

/// Consume a two-character operator made of `ch` twice.
fn pair(
    chars: &mut Peekable<CharIndices<'_>>,
    pos: usize,
    ch: char,
    kind: TokenKind,
) -> Result<TokenKind, GuardError> {
    chars.next();
    match chars.peek() {
        Some(&(_, n)) if n == ch => {
            chars.next();
            Ok(kind)
        }
        _ => Err(GuardError::Syntax {
            pos,
            message: format!("expected '{ch}{ch}'"),
        }),
    }
}

fn lex(source: &str) -> Result<Vec<Token>, GuardError> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        let kind = match c {
            c if c.is_whitespace() => {
                chars.next();
                continue;
            }
            '.' => {
                chars.next();
                TokenKind::Dot
            }
            '(' => {
                chars.next();
                TokenKind::LParen
            }
            ')' => {
                chars.next();
                TokenKind::RParen
            }
            '&' => pair(&mut chars, pos, '&', TokenKind::AndAnd)?,
            '|' => pair(&mut chars, pos, '|', TokenKind::OrOr)?,
            '=' => pair(&mut chars, pos, '=', TokenKind::EqEq)?,
            '!' => {
                chars.next();
                if matches!(chars.peek(), Some(&(_, '='))) {
                    chars.next();
                    TokenKind::NotEq
                } else {
                    TokenKind::Bang
                }
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                let mut closed = false;
                while let Some((_, ch)) = chars.next() {
                    match ch {
                        ch if ch == quote => {
                            closed = true;
                            break;
                        }
                        '\\' => match chars.next() {
                            Some((_, escaped)) => s.push(escaped),
                            None => break,
                        },
                        ch => s.push(ch),
                    }
                }
                if !closed {
                    return Err(GuardError::Syntax {
                        pos,
                        message: "unterminated string".into(),
                    });
                }
                TokenKind::Str(s)
            }
            c if is_ident_char(c) => {
                let mut s = String::new();
                while let Some(&(_, ch)) = chars.peek() {
                    if !is_ident_char(ch) {
                        break;
                    }
                    s.push(ch);
                    chars.next();
                }
                TokenKind::Ident(s)
            }
            other => {
                return Err(GuardError::Syntax {
                    pos,
                    message: format!("unexpected character {other:?}"),
                });
            }
        };
        tokens.push(Token { kind, pos });
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<&TokenKind> {
        self.peek().map(|t| &t.kind)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn error_here(&self, message: impl Into<String>) -> GuardError {
        GuardError::Syntax {
            pos: self.peek().map_or(self.end, |t| t.pos),
            message: message.into(),
        }
    }

    /// Enter one more level of nesting at `pos`.
    fn descend(&mut self, pos: usize) -> Result<(), GuardError> {
        if self.depth >= MAX_NESTING {
            return Err(GuardError::TooDeep { pos });
        }
        self.depth += 1;
        Ok(())
    }

    fn expr(&mut self) -> Result<Expr, GuardError> {
        self.or()
    }

    fn or(&mut self) -> Result<Expr, GuardError> {
        let entry = self.depth;
        let mut lhs = self.and()?;
        while let Some(tok) = self.peek().filter(|t| t.kind == TokenKind::OrOr) {
            let pos = tok.pos;
            self.next();
            self.descend(pos)?;
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        self.depth = entry;
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, GuardError> {
        let entry = self.depth;
        let mut lhs = self.unary()?;
        while let Some(tok) = self.peek().filter(|t| t.kind == TokenKind::AndAnd) {
            let pos = tok.pos;
            self.next();
            self.descend(pos)?;
            let rhs = self.unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        self.depth = entry;
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, GuardError> {
        if let Some(tok) = self.peek().filter(|t| t.kind == TokenKind::Bang) {
            let pos = tok.pos;
            self.next();
            self.descend(pos)?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Expr, GuardError> {
        let lhs = self.operand()?;
        let build: fn(Box<Expr>, Box<Expr>) -> Expr = match self.peek_kind() {
            Some(TokenKind::EqEq) => Expr::Eq,
            Some(TokenKind::NotEq) => Expr::Ne,
            Some(TokenKind::Ident(word)) if word == "contains" => Expr::Contains,
            _ => return Ok(lhs),
        };
        self.next();
        let rhs = self.operand()?;
        Ok(build(Box::new(lhs), Box::new(rhs)))
    }

    fn operand(&mut self) -> Result<Expr, GuardError> {
        let Some(tok) = self.next() else {
            return Err(self.error_here("unexpected end of expression"));
        };
        match tok.kind {
            TokenKind::Str(s) => Ok(Expr::Str(s)),
            TokenKind::LParen => {
                self.descend(tok.pos)?;
                let inner = self.expr()?;
                self.depth -= 1;
                match self.next() {
                    Some(Token {
                        kind: TokenKind::RParen,
                        ..
                    }) => Ok(inner),
                    _ => Err(GuardError::Syntax {
                        pos: tok.pos,
                        message: "unclosed '('".into(),
                    }),
                }
            }
            TokenKind::Ident(word) => {
                if self.peek_kind() == Some(&TokenKind::Dot) {
                    self.next();
                    let field = match self.next() {
                        Some(Token {
                            kind: TokenKind::Ident(field),
                            ..
                        }) => field,
                        _ => return Err(self.error_here("expected a field name after '.'")),
                    };
                    let field =
                        Field::parse(&field).ok_or_else(|| GuardError::UnknownField(field.clone()))?;
                    return Ok(Expr::Ref { step: word, field });
                }
                match word.as_str() {
                    "true" => Ok(Expr::Bool(true)),
                    "false" => Ok(Expr::Bool(false)),
                    _ => Err(GuardError::Syntax {
                        pos: tok.pos,
                        message: format!("expected a step reference, string or boolean, found {word:?}"),
                    }),
                }
            }
            other => Err(GuardError::Syntax {
                pos: tok.pos,
                message: format!("unexpected {other}"),
            }),
        }
    }
}
