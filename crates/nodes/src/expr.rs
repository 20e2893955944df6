//! A small, whitelisted expression language for condition nodes.
//!
//! Expressions are lexed, parsed into an [`Expr`] tree and evaluated by an
//! explicit interpreter against a JSON context.  Nothing is ever handed to
//! a general-purpose evaluator.
//!
//! Grammar (lowest precedence first):
//!
//! ```text
//! or      := and ( ("||" | "or") and )*
//! and     := not ( ("&&" | "and") not )*
//! not     := ("!" | "not") not | compare
//! compare := sum ( ("==" | "!=" | "<" | "<=" | ">" | ">=") sum )?
//! sum     := product ( ("+" | "-") product )*
//! product := unary ( ("*" | "/" | "%") unary )*
//! unary   := "-" unary | primary
//! primary := number | string | true | false | null | path | "(" or ")"
//! path    := ident ( "." ident | "[" (string | number) "]" )*
//! ```
//!
//! `===` and `!==` are accepted as spellings of `==` and `!=`.

use serde_json::{Number, Value};
use thiserror::Error;

/// Limit on operators between the root of a tree and any leaf, so the
/// recursive evaluator and `Drop` stay shallow.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("unexpected character '{ch}' at offset {offset}")]
    UnexpectedChar { ch: char, offset: usize },

    #[error("unterminated string starting at offset {0}")]
    UnterminatedString(usize),

    #[error("invalid number '{0}'")]
    InvalidNumber(String),

    #[error("unexpected {found} at offset {offset}, expected {expected}")]
    UnexpectedToken {
        found: String,
        expected: &'static str,
        offset: usize,
    },

    #[error("cannot apply '{op}' to {lhs} and {rhs}")]
    TypeMismatch {
        op: &'static str,
        lhs: &'static str,
        rhs: &'static str,
    },

    #[error("cannot negate {0}")]
    NotANumber(&'static str),

    #[error("division by zero")]
    DivisionByZero,

    #[error("expression nested more than {MAX_DEPTH} levels deep")]
    TooDeep,
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Eof,
}

impl Tok {
    fn describe(&self) -> String {
        match self {
            Tok::Num(n) => format!("number {n}"),
            Tok::Str(s) => format!("string {s:?}"),
            Tok::Ident(s) => format!("identifier '{s}'"),
            Tok::Eof => "end of expression".to_string(),
            other => format!("{other:?}"),
        }
    }

    /// Keywords are still valid object keys after a `.`.
    fn as_key(&self) -> Option<&str> {
        match self {
            Tok::Ident(s) => Some(s),
            Tok::True => Some("true"),
            Tok::False => Some("false"),
            Tok::Null => Some("null"),
            Tok::And => Some("and"),
            Tok::Or => Some("or"),
            Tok::Not => Some("not"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    offset: usize,
}

fn lex(src: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let peek = |j: usize| chars.get(j).map(|&(_, c)| c);

    while i < chars.len() {
        let (offset, c) = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let (tok, len) = match c {
            '(' => (Tok::LParen, 1),
            ')' => (Tok::RParen, 1),
            '[' => (Tok::LBracket, 1),
            ']' => (Tok::RBracket, 1),
            '.' if !peek(i + 1).is_some_and(|n| n.is_ascii_digit()) => (Tok::Dot, 1),
            '+' => (Tok::Plus, 1),
            '-' => (Tok::Minus, 1),
            '*' => (Tok::Star, 1),
            '/' => (Tok::Slash, 1),
            '%' => (Tok::Percent, 1),
            '=' if peek(i + 1) == Some('=') => {
                let len = if peek(i + 2) == Some('=') { 3 } else { 2 };
                (Tok::Eq, len)
            }
            '!' if peek(i + 1) == Some('=') => {
                let len = if peek(i + 2) == Some('=') { 3 } else { 2 };
                (Tok::Ne, len)
            }
            '!' => (Tok::Not, 1),
            '<' if peek(i + 1) == Some('=') => (Tok::Le, 2),
            '<' => (Tok::Lt, 1),
            '>' if peek(i + 1) == Some('=') => (Tok::Ge, 2),
            '>' => (Tok::Gt, 1),
            '&' if peek(i + 1) == Some('&') => (Tok::And, 2),
            '|' if peek(i + 1) == Some('|') => (Tok::Or, 2),
            '"' | '\'' => {
                let (s, consumed) = lex_string(&chars[i..], offset)?;
                (Tok::Str(s), consumed)
            }
            c if c.is_ascii_digit() || c == '.' => {
                let end = (i..chars.len())
                    .find(|&j| !(chars[j].1.is_ascii_digit() || chars[j].1 == '.'))
                    .unwrap_or(chars.len());
                let text: String = chars[i..end].iter().map(|&(_, c)| c).collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| ExprError::InvalidNumber(text.clone()))?;
                (Tok::Num(n), end - i)
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let end = (i..chars.len())
                    .find(|&j| {
                        let c = chars[j].1;
                        !(c.is_alphanumeric() || c == '_' || c == '$')
                    })
                    .unwrap_or(chars.len());
                let word: String = chars[i..end].iter().map(|&(_, c)| c).collect();
                let tok = match word.as_str() {
                    "true" => Tok::True,
                    "false" => Tok::False,
                    "null" => Tok::Null,
                    "and" => Tok::And,
                    "or" => Tok::Or,
                    "not" => Tok::Not,
                    _ => Tok::Ident(word),
                };
                (tok, end - i)
            }
            ch => return Err(ExprError::UnexpectedChar { ch, offset }),
        };

        tokens.push(Token { tok, offset });
        i += len;
    }

    tokens.push(Token {
        tok: Tok::Eof,
        offset: src.len(),
    });
    Ok(tokens)
}

/// Lex a quoted string; `chars[0]` is the opening quote.
/// Returns the unescaped text and the number of chars consumed.
fn lex_string(chars: &[(usize, char)], offset: usize) -> Result<(String, usize), ExprError> {
    let quote = chars[0].1;
    let mut out = String::new();
    let mut i = 1;

    while i < chars.len() {
        match chars[i].1 {
            c if c == quote => return Ok((out, i + 1)),
            '\\' => {
                let escaped = chars
                    .get(i + 1)
                    .map(|&(_, c)| c)
                    .ok_or(ExprError::UnterminatedString(offset))?;
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    other => other,
                });
                i += 2;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Err(ExprError::UnterminatedString(offset))
}

// ---------------------------------------------------------------------------
// AST + parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(Vec<Segment>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        &self.tokens[self.pos].tok
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        if token.tok != Tok::Eof {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == tok {
            self.advance();
            true
        } else {
            false
        }
    }

    fn unexpected(&self, expected: &'static str) -> ExprError {
        let token = &self.tokens[self.pos];
        ExprError::UnexpectedToken {
            found: token.tok.describe(),
            expected,
            offset: token.offset,
        }
    }

    fn expect(&mut self, tok: Tok, expected: &'static str) -> Result<(), ExprError> {
        if self.eat(&tok) {
            Ok(())
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn descend(&mut self) -> Result<(), ExprError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExprError::TooDeep);
        }
        Ok(())
    }

    fn or(&mut self) -> Result<Expr, ExprError> {
        let base = self.depth;
        let mut lhs = self.and()?;
        while self.eat(&Tok::Or) {
            self.descend()?;
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        self.depth = base;
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, ExprError> {
        let base = self.depth;
        let mut lhs = self.not()?;
        while self.eat(&Tok::And) {
            self.descend()?;
            let rhs = self.not()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        self.depth = base;
        Ok(lhs)
    }

    fn not(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Tok::Not) {
            self.descend()?;
            let inner = self.not()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.sum()?;
        let op = match self.peek() {
            Tok::Eq => BinaryOp::Eq,
            Tok::Ne => BinaryOp::Ne,
            Tok::Lt => BinaryOp::Lt,
            Tok::Le => BinaryOp::Le,
            Tok::Gt => BinaryOp::Gt,
            Tok::Ge => BinaryOp::Ge,
            _ => return Ok(lhs),
        };
        self.advance();
        self.descend()?;
        let rhs = self.sum()?;
        self.depth -= 1;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn sum(&mut self) -> Result<Expr, ExprError> {
        let base = self.depth;
        let mut lhs = self.product()?;
        loop {
            let op = match self.peek() {
                Tok::Plus => BinaryOp::Add,
                Tok::Minus => BinaryOp::Sub,
                _ => {
                    self.depth = base;
                    return Ok(lhs);
                }
            };
            self.advance();
            self.descend()?;
            let rhs = self.product()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn product(&mut self) -> Result<Expr, ExprError> {
        let base = self.depth;
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Tok::Star => BinaryOp::Mul,
                Tok::Slash => BinaryOp::Div,
                Tok::Percent => BinaryOp::Rem,
                _ => {
                    self.depth = base;
                    return Ok(lhs);
                }
            };
            self.advance();
            self.descend()?;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Tok::Minus) {
            self.descend()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        let token = self.advance();
        match token.tok {
            Tok::Num(n) => Ok(Expr::Literal(number(n))),
            Tok::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Tok::True => Ok(Expr::Literal(Value::Bool(true))),
            Tok::False => Ok(Expr::Literal(Value::Bool(false))),
            Tok::Null => Ok(Expr::Literal(Value::Null)),
            Tok::Ident(name) => self.path(name),
            Tok::LParen => {
                self.descend()?;
                let inner = self.or()?;
                self.depth -= 1;
                self.expect(Tok::RParen, "')'")?;
                Ok(inner)
            }
            _ => {
                self.pos -= usize::from(token.tok != Tok::Eof);
                Err(self.unexpected("a value"))
            }
        }
    }

    fn path(&mut self, root: String) -> Result<Expr, ExprError> {
        let mut segments = vec![Segment::Key(root)];
        loop {
            if self.eat(&Tok::Dot) {
                let key = self.peek().as_key().map(str::to_owned);
                match key {
                    Some(key) => {
                        self.advance();
                        segments.push(Segment::Key(key));
                    }
                    None => return Err(self.unexpected("a field name")),
                }
            } else if self.eat(&Tok::LBracket) {
                let segment = match self.peek().clone() {
                    Tok::Str(s) => Segment::Key(s),
                    Tok::Num(n) if n >= 0.0 && n.fract() == 0.0 => Segment::Index(n as usize),
                    _ => return Err(self.unexpected("a string key or array index")),
                };
                self.advance();
                self.expect(Tok::RBracket, "']'")?;
                segments.push(segment);
            } else {
                return Ok(Expr::Path(segments));
            }
        }
    }
}

/// Parse `src` into an expression tree.
pub fn parse(src: &str) -> Result<Expr, ExprError> {
    let mut parser = Parser {
        tokens: lex(src)?,
        pos: 0,
        depth: 0,
    };
    let expr = parser.or()?;
    if *parser.peek() != Tok::Eof {
        return Err(parser.unexpected("an operator or end of expression"));
    }
    Ok(expr)
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

/// JavaScript-flavoured truthiness over JSON values.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Integral values stay integers so they compare cleanly with JSON input.
fn number(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
        Value::Number(Number::from(f as i64))
    } else {
        Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn lookup(ctx: &Value, segments: &[Segment]) -> Value {
    let (first, rest) = match segments.split_first() {
        Some(split) => split,
        None => return Value::Null,
    };

    // `input.x` addresses the context root unless the context really has an
    // `input` field.
    let mut current = match first {
        Segment::Key(k) => match ctx.get(k) {
            Some(v) => v,
            None if k == "input" => ctx,
            None => return Value::Null,
        },
        Segment::Index(_) => return Value::Null,
    };

    for segment in rest {
        let next = match (segment, current) {
            (Segment::Key(k), Value::Object(map)) => map.get(k),
            (Segment::Index(i), Value::Array(items)) => items.get(*i),
            (Segment::Key(k), Value::Array(items)) if k == "length" => {
                return Value::from(items.len());
            }
            (Segment::Key(k), Value::String(s)) if k == "length" => {
                return Value::from(s.chars().count());
            }
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn loosely_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => lhs == rhs,
    }
}

fn apply(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, ExprError> {
    let mismatch = |lhs: &Value, rhs: &Value| ExprError::TypeMismatch {
        op: op.symbol(),
        lhs: type_name(lhs),
        rhs: type_name(rhs),
    };

    match op {
        BinaryOp::Eq => Ok(Value::Bool(loosely_equal(&lhs, &rhs))),
        BinaryOp::Ne => Ok(Value::Bool(!loosely_equal(&lhs, &rhs))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (&lhs, &rhs) {
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => match (lhs.as_f64(), rhs.as_f64()) {
                    (Some(a), Some(b)) => a.partial_cmp(&b),
                    _ => return Err(mismatch(&lhs, &rhs)),
                },
            };
            let result = ordering.is_some_and(|o| match op {
                BinaryOp::Lt => o.is_lt(),
                BinaryOp::Le => o.is_le(),
                BinaryOp::Gt => o.is_gt(),
                _ => o.is_ge(),
            });
            Ok(Value::Bool(result))
        }
        BinaryOp::Add if lhs.is_string() || rhs.is_string() => {
            Ok(Value::String(display(&lhs) + &display(&rhs)))
        }
        _ => {
            let (a, b) = match (lhs.as_f64(), rhs.as_f64()) {
                (Some(a), Some(b)) => (a, b),
                _ => return Err(mismatch(&lhs, &rhs)),
            };
            let result = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div | BinaryOp::Rem if b == 0.0 => {
                    return Err(ExprError::DivisionByZero)
                }
                BinaryOp::Div => a / b,
                _ => a % b,
            };
            Ok(number(result))
        }
    }
}

impl Expr {
    /// Evaluate against `ctx`.  Missing fields evaluate to `null`.
    pub fn eval(&self, ctx: &Value) -> Result<Value, ExprError> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Path(segments) => Ok(lookup(ctx, segments)),
            Expr::Not(inner) => Ok(Value::Bool(!truthy(&inner.eval(ctx)?))),
            Expr::Neg(inner) => {
                let v = inner.eval(ctx)?;
                v.as_f64()
                    .map(|f| number(-f))
                    .ok_or(ExprError::NotANumber(type_name(&v)))
            }
            Expr::And(lhs, rhs) => {
                Ok(Value::Bool(truthy(&lhs.eval(ctx)?) && truthy(&rhs.eval(ctx)?)))
            }
            Expr::Or(lhs, rhs) => {
                Ok(Value::Bool(truthy(&lhs.eval(ctx)?) || truthy(&rhs.eval(ctx)?)))
            }
            Expr::Binary(op, lhs, rhs) => apply(*op, lhs.eval(ctx)?, rhs.eval(ctx)?),
        }
    }
}

/// Parse and evaluate `src` against `ctx`.
pub fn evaluate(src: &str, ctx: &Value) -> Result<Value, ExprError> {
    parse(src)?.eval(ctx)
}

/// Parse and evaluate `src`, reducing the result to its truthiness.
pub fn evaluate_bool(src: &str, ctx: &Value) -> Result<bool, ExprError> {
    evaluate(src, ctx).map(|v| truthy(&v))
}
