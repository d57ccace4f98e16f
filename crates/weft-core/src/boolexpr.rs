//! Boolean expressions over actor claims.
//!
//! A small recursive-descent language used to gate subscriptions on the
//! caller's claims: `||`, `&&`, unary `!`, parentheses, comparisons
//! (`== != < <= > >= =~ !~`), string literals in single, double, or
//! backtick quotes (backticks keep regexp backslashes readable), number
//! and bool literals, and identifiers with `.` nesting.
//!
//! An array claim `roles: ["a","b"]` exposes truthy `roles.a` and
//! `roles.b`. A missing identifier is falsy, never an error.

use serde_json::Value;
use thiserror::Error as ThisError;

#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum ExprError {
    #[error("unexpected character '{0}' at {1}")]
    BadChar(char, usize),
    #[error("unterminated string literal at {0}")]
    UnterminatedString(usize),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),
    #[error("unbalanced parentheses")]
    UnbalancedParen,
    #[error("invalid regular expression '{0}'")]
    BadRegex(String),
}

/// A parsed, reusable expression.
#[derive(Debug, Clone)]
pub struct Expr {
    ast: Ast,
}

impl Expr {
    /// Parse an expression. Fails on malformed input such as `"(true"`.
    pub fn parse(src: &str) -> Result<Expr, ExprError> {
        let tokens = tokenize(src)?;
        let mut p = Parser { tokens, pos: 0 };
        let ast = p.or_expr()?;
        if p.pos != p.tokens.len() {
            return Err(ExprError::UnexpectedToken(p.tokens[p.pos].describe()));
        }
        Ok(Expr { ast })
    }

    /// Evaluate against a claims object. Deterministic and side-effect
    /// free; only regex compilation of a non-literal pattern can fail.
    pub fn eval(&self, claims: &Value) -> Result<bool, ExprError> {
        eval_ast(&self.ast, claims)
    }
}

// ── AST ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Ast {
    Or(Box<Ast>, Box<Ast>),
    And(Box<Ast>, Box<Ast>),
    Not(Box<Ast>),
    Cmp(Operand, CmpOp, Operand),
    Truthy(Operand),
}

#[derive(Debug, Clone)]
enum Operand {
    Lit(Value),
    Ident(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Match,
    NotMatch,
}

// ── Tokenizer ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    OrOr,
    AndAnd,
    Bang,
    Cmp(CmpOp),
    Str(String),
    Num(f64),
    Ident(String),
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::LParen => "(".into(),
            Token::RParen => ")".into(),
            Token::OrOr => "||".into(),
            Token::AndAnd => "&&".into(),
            Token::Bang => "!".into(),
            Token::Cmp(_) => "comparison".into(),
            Token::Str(s) => format!("'{s}'"),
            Token::Num(n) => n.to_string(),
            Token::Ident(s) => s.clone(),
        }
    }
}

fn tokenize(src: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = src.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '(' => {
                out.push(Token::LParen);
                i += 1;
            }
            ')' => {
                out.push(Token::RParen);
                i += 1;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                out.push(Token::OrOr);
                i += 2;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                out.push(Token::AndAnd);
                i += 2;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                out.push(Token::Cmp(CmpOp::Eq));
                i += 2;
            }
            '=' if chars.get(i + 1) == Some(&'~') => {
                out.push(Token::Cmp(CmpOp::Match));
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                out.push(Token::Cmp(CmpOp::Ne));
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'~') => {
                out.push(Token::Cmp(CmpOp::NotMatch));
                i += 2;
            }
            '!' => {
                out.push(Token::Bang);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                out.push(Token::Cmp(CmpOp::Le));
                i += 2;
            }
            '<' => {
                out.push(Token::Cmp(CmpOp::Lt));
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                out.push(Token::Cmp(CmpOp::Ge));
                i += 2;
            }
            '>' => {
                out.push(Token::Cmp(CmpOp::Gt));
                i += 1;
            }
            '\'' | '"' | '`' => {
                let quote = c;
                let start = i;
                i += 1;
                let mut s = String::new();
                loop {
                    match chars.get(i) {
                        None => return Err(ExprError::UnterminatedString(start)),
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        // Backslash escapes the closing quote; backtick
                        // strings keep backslashes verbatim for regexps.
                        Some(&'\\') if quote != '`' && chars.get(i + 1) == Some(&quote) => {
                            s.push(quote);
                            i += 2;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                out.push(Token::Str(s));
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_digit() || chars[i] == '.' || chars[i] == '_')
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().filter(|c| **c != '_').collect();
                let n = text.parse::<f64>().map_err(|_| ExprError::BadChar(c, start))?;
                out.push(Token::Num(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric()
                        || chars[i] == '_'
                        || chars[i] == '$'
                        || chars[i] == '.')
                {
                    i += 1;
                }
                out.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(ExprError::BadChar(other, i)),
        }
    }
    Ok(out)
}

// ── Parser ───────────────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token, ExprError> {
        let t = self.tokens.get(self.pos).cloned().ok_or(ExprError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(t)
    }

    fn or_expr(&mut self) -> Result<Ast, ExprError> {
        let mut lhs = self.and_expr()?;
        while self.peek() == Some(&Token::OrOr) {
            self.pos += 1;
            let rhs = self.and_expr()?;
            lhs = Ast::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Ast, ExprError> {
        let mut lhs = self.unary()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Ast::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Ast, ExprError> {
        if self.peek() == Some(&Token::Bang) {
            self.pos += 1;
            return Ok(Ast::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Ast, ExprError> {
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.or_expr()?;
            match self.next() {
                Ok(Token::RParen) => return Ok(inner),
                _ => return Err(ExprError::UnbalancedParen),
            }
        }
        let lhs = self.operand()?;
        if let Some(Token::Cmp(op)) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.operand()?;
            return Ok(Ast::Cmp(lhs, op, rhs));
        }
        Ok(Ast::Truthy(lhs))
    }

    fn operand(&mut self) -> Result<Operand, ExprError> {
        match self.next()? {
            Token::Str(s) => Ok(Operand::Lit(Value::String(s))),
            Token::Num(n) => Ok(Operand::Lit(
                serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null),
            )),
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Operand::Lit(Value::Bool(true))),
                "false" => Ok(Operand::Lit(Value::Bool(false))),
                "null" => Ok(Operand::Lit(Value::Null)),
                _ => Ok(Operand::Ident(name)),
            },
            other => Err(ExprError::UnexpectedToken(other.describe())),
        }
    }
}

// ── Evaluation ───────────────────────────────────────────────────────────────

fn eval_ast(ast: &Ast, claims: &Value) -> Result<bool, ExprError> {
    match ast {
        Ast::Or(l, r) => Ok(eval_ast(l, claims)? || eval_ast(r, claims)?),
        Ast::And(l, r) => Ok(eval_ast(l, claims)? && eval_ast(r, claims)?),
        Ast::Not(e) => Ok(!eval_ast(e, claims)?),
        Ast::Truthy(op) => Ok(truthy(&resolve(op, claims))),
        Ast::Cmp(lhs, op, rhs) => compare(&resolve(lhs, claims), *op, &resolve(rhs, claims)),
    }
}

/// Look an operand up against the claims. Identifiers descend by `.`;
/// descending into an array tests membership of the next segment.
fn resolve(op: &Operand, claims: &Value) -> Value {
    match op {
        Operand::Lit(v) => v.clone(),
        Operand::Ident(name) => {
            let mut cur = claims.clone();
            for seg in name.split('.') {
                cur = match cur {
                    Value::Object(ref m) => m.get(seg).cloned().unwrap_or(Value::Null),
                    Value::Array(ref a) => {
                        Value::Bool(a.iter().any(|v| v.as_str() == Some(seg)))
                    }
                    _ => Value::Null,
                };
            }
            cur
        }
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(m) => !m.is_empty(),
    }
}

fn compare(l: &Value, op: CmpOp, r: &Value) -> Result<bool, ExprError> {
    match op {
        CmpOp::Eq => Ok(loose_eq(l, r)),
        CmpOp::Ne => Ok(!loose_eq(l, r)),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let ord = match (l, r) {
                (Value::Number(a), Value::Number(b)) => {
                    match (a.as_f64(), b.as_f64()) {
                        (Some(x), Some(y)) => x.partial_cmp(&y),
                        _ => None,
                    }
                }
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            };
            Ok(match (ord, op) {
                (Some(o), CmpOp::Lt) => o.is_lt(),
                (Some(o), CmpOp::Le) => o.is_le(),
                (Some(o), CmpOp::Gt) => o.is_gt(),
                (Some(o), CmpOp::Ge) => o.is_ge(),
                _ => false,
            })
        }
        CmpOp::Match | CmpOp::NotMatch => {
            let pattern = stringify(r);
            let re = regex::Regex::new(&pattern).map_err(|_| ExprError::BadRegex(pattern))?;
            let hit = re.is_match(&stringify(l));
            Ok(if op == CmpOp::Match { hit } else { !hit })
        }
    }
}

fn loose_eq(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => l == r,
    }
}

fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
