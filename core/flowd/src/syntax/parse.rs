use thiserror::Error;

use super::{BinaryOp, Expr, UnaryOp};
use crate::value::Value;

/// Error returned by [`parse`].
#[derive(Debug, Error, PartialEq, Eq)]
#[error("syntax error at offset {offset}: {message}")]
pub struct ParseError {
    pub offset: usize,
    pub message: String,
}

/// Parses an expression.
pub fn parse(src: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(src)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expr()?;
    match parser.peek() {
        Token::Eof => Ok(expr),
        t => Err(parser.error(format!("unexpected {t} after the end of the expression"))),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Punct(&'static str),
    Eof,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Int(i) => write!(f, "number {i}"),
            Token::Float(x) => write!(f, "number {x}"),
            Token::Str(s) => write!(f, "string {s:?}"),
            Token::Ident(id) => write!(f, "identifier {id}"),
            Token::Punct(p) => write!(f, "'{p}'"),
            Token::Eof => f.write_str("end of input"),
        }
    }
}

/// Two-char punctuation first, so that the longest match wins.
const PUNCTUATION: [&str; 23] = [
    "==", "!=", "<=", ">=", "&&", "||", "+", "-", "*", "/", "%", "<", ">", "!", "=", "(", ")", "[", "]", "{", "}",
    ",", ".",
];

fn tokenize(src: &str) -> Result<Vec<(usize, Token)>, ParseError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        let start = i;
        if c.is_ascii_digit() {
            while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'_') {
                i += 1;
            }
            let mut is_float = false;
            if i + 1 < bytes.len() && bytes[i] == b'.' && bytes[i + 1].is_ascii_digit() {
                is_float = true;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let text: String = src[start..i].chars().filter(|c| *c != '_').collect();
            let token = if is_float {
                text.parse().map(Token::Float).map_err(|e| ParseError {
                    offset: start,
                    message: format!("invalid number {text}: {e}"),
                })?
            } else {
                text.parse().map(Token::Int).map_err(|e| ParseError {
                    offset: start,
                    message: format!("invalid number {text}: {e}"),
                })?
            };
            tokens.push((start, token));
        } else if c.is_ascii_alphabetic() || c == b'_' {
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            tokens.push((start, Token::Ident(src[start..i].to_owned())));
        } else if c == b'"' {
            let (s, end) = string_literal(src, start)?;
            tokens.push((start, Token::Str(s)));
            i = end;
        } else if let Some(p) = PUNCTUATION.iter().find(|p| src[i..].starts_with(**p)) {
            tokens.push((start, Token::Punct(p)));
            i += p.len();
        } else {
            let ch = src[i..].chars().next().unwrap_or_default();
            return Err(ParseError {
                offset: start,
                message: format!("unexpected character {ch:?}"),
            });
        }
    }
    tokens.push((src.len(), Token::Eof));
    Ok(tokens)
}

/// Reads a string literal that begins at `start` (on the opening quote).
/// Returns the unescaped content and the offset right after the closing quote.
fn string_literal(src: &str, start: usize) -> Result<(String, usize), ParseError> {
    let mut out = String::new();
    let mut chars = src[start + 1..].char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((out, start + 1 + i + 1)),
            '\\' => {
                let escaped = match chars.next() {
                    Some((_, 'n')) => '\n',
                    Some((_, 't')) => '\t',
                    Some((_, 'r')) => '\r',
                    Some((_, '"')) => '"',
                    Some((_, '\\')) => '\\',
                    Some((j, other)) => {
                        return Err(ParseError {
                            offset: start + 1 + j,
                            message: format!("unknown escape sequence \\{other}"),
                        });
                    }
                    None => break,
                };
                out.push(escaped);
            }
            c => out.push(c),
        }
    }
    Err(ParseError {
        offset: start,
        message: String::from("unterminated string"),
    })
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].1
    }

    fn offset(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].0
    }

    fn advance(&mut self) -> Token {
        let t = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn error(&self, message: String) -> ParseError {
        ParseError {
            offset: self.offset(),
            message,
        }
    }

    fn eat(&mut self, punct: &str) -> bool {
        if matches!(self.peek(), Token::Punct(p) if *p == punct) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, punct: &str) -> Result<(), ParseError> {
        if self.eat(punct) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{punct}', found {}", self.peek())))
        }
    }

    fn expr(&mut self) -> Result<Expr, ParseError> {
        self.binary(0)
    }

    /// Precedence climbing over the binary operators.
    fn binary(&mut self, min_prec: u8) -> Result<Expr, ParseError> {
        let mut lhs = self.unary()?;
        loop {
            let Some((op, prec)) = self.binary_op() else {
                break;
            };
            if prec < min_prec {
                break;
            }
            self.pos += 1;
            let rhs = self.binary(prec + 1)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn binary_op(&self) -> Option<(BinaryOp, u8)> {
        let Token::Punct(p) = self.peek() else {
            return None;
        };
        let res = match *p {
            "||" => (BinaryOp::Or, 1),
            "&&" => (BinaryOp::And, 2),
            "==" => (BinaryOp::Eq, 3),
            "!=" => (BinaryOp::NotEq, 3),
            "<" => (BinaryOp::Lt, 4),
            "<=" => (BinaryOp::LtEq, 4),
            ">" => (BinaryOp::Gt, 4),
            ">=" => (BinaryOp::GtEq, 4),
            "+" => (BinaryOp::Add, 5),
            "-" => (BinaryOp::Sub, 5),
            "*" => (BinaryOp::Mul, 6),
            "/" => (BinaryOp::Div, 6),
            "%" => (BinaryOp::Rem, 6),
            _ => return None,
        };
        Some(res)
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        if self.eat("-") {
            // fold negative literals so that `-1` is a literal, like in the config files
            return Ok(match self.unary()? {
                Expr::Literal(Value::Int(i)) => Expr::Literal(Value::Int(-i)),
                Expr::Literal(Value::Float(x)) => Expr::Literal(Value::Float(-x)),
                e => Expr::Unary(UnaryOp::Neg, Box::new(e)),
            });
        }
        if self.eat("!") {
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(self.unary()?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(".") {
                match self.advance() {
                    Token::Ident(field) => expr = Expr::Access(Box::new(expr), field),
                    t => return Err(self.error(format!("expected a field name after '.', found {t}"))),
                }
            } else if self.eat("[") {
                let index = self.expr()?;
                self.expect("]")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        let offset = self.offset();
        match self.advance() {
            Token::Int(i) => Ok(Expr::Literal(Value::Int(i))),
            Token::Float(x) => Ok(Expr::Literal(Value::Float(x))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Ident(id) => Ok(match id.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" => Expr::Literal(Value::Null),
                _ => Expr::Ident(id),
            }),
            Token::Punct("(") => {
                let e = self.expr()?;
                self.expect(")")?;
                Ok(e)
            }
            Token::Punct("[") => {
                let mut items = Vec::new();
                while !self.eat("]") {
                    items.push(self.expr()?);
                    if !self.eat(",") {
                        self.expect("]")?;
                        break;
                    }
                }
                Ok(Expr::Array(items))
            }
            Token::Punct("{") => {
                let mut fields: Vec<(String, Expr)> = Vec::new();
                while !self.eat("}") {
                    let key_offset = self.offset();
                    let key = match self.advance() {
                        Token::Ident(k) | Token::Str(k) => k,
                        t => return Err(self.error(format!("expected an object key, found {t}"))),
                    };
                    if fields.iter().any(|(k, _)| *k == key) {
                        return Err(ParseError {
                            offset: key_offset,
                            message: format!("duplicate key {key:?} in object"),
                        });
                    }
                    self.expect("=")?;
                    fields.push((key, self.expr()?));
                    if !self.eat(",") {
                        self.expect("}")?;
                        break;
                    }
                }
                Ok(Expr::Object(fields))
            }
            t => Err(ParseError {
                offset,
                message: format!("expected an expression, found {t}"),
            }),
        }
    }
}
