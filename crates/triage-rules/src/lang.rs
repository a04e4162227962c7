//! Failure association rule predicates.
//!
//! A rule is a boolean expression over two failure fields, `test` (the test
//! ID) and `reason` (the primary error message, empty when absent):
//!
//! ```text
//! expr       := or
//! or         := and ( OR and )*
//! and        := unary ( AND unary )*
//! unary      := NOT unary | primary
//! primary    := "(" expr ")" | TRUE | FALSE
//!             | REGEXP_CONTAINS "(" field "," string ")"
//!             | field ( "=" | "!=" | "<>" ) string
//!             | field [ NOT ] LIKE string
//!             | field [ NOT ] IN "(" string ( "," string )* ")"
//! ```
//!
//! Keywords and field names are case-insensitive. Strings are double-quoted
//! with `\` escaping the next character. Parentheses and `NOT` may nest at
//! most [`MAX_NESTING_DEPTH`] deep.

use regex::Regex;
use triage_core::Failure;

use crate::RuleError;

pub const MAX_NESTING_DEPTH: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Test,
    Reason,
}

impl Field {
    fn value<'a>(&self, failure: &'a Failure) -> &'a str {
        match self {
            Field::Test => &failure.test_id,
            Field::Reason => failure.primary_error_message(),
        }
    }
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(bool),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    Equals { field: Field, value: String },
    Like { field: Field, pattern: Regex },
    In { field: Field, values: Vec<String> },
    RegexpContains { field: Field, regex: Regex },
}

impl Expr {
    fn evaluate(&self, failure: &Failure) -> bool {
        match self {
            Expr::Literal(value) => *value,
            Expr::And(terms) => terms.iter().all(|term| term.evaluate(failure)),
            Expr::Or(terms) => terms.iter().any(|term| term.evaluate(failure)),
            Expr::Not(inner) => !inner.evaluate(failure),
            Expr::Equals { field, value } => field.value(failure) == value,
            Expr::Like { field, pattern } => pattern.is_match(field.value(failure)),
            Expr::In { field, values } => {
                let actual = field.value(failure);
                values.iter().any(|value| value == actual)
            }
            Expr::RegexpContains { field, regex } => regex.is_match(field.value(failure)),
        }
    }
}

/// A compiled rule definition.
#[derive(Debug, Clone)]
pub struct Predicate {
    expr: Expr,
}

impl Predicate {
    pub fn parse(definition: &str) -> Result<Self, RuleError> {
        let tokens = tokenize(definition)?;
        let mut parser = Parser {
            tokens,
            index: 0,
            depth: 0,
        };
        let expr = parser.expression()?;
        let trailing = parser.peek();
        if trailing.kind != TokenKind::End {
            return Err(parse_error(trailing.position, "unexpected trailing input"));
        }
        Ok(Self { expr })
    }

    pub fn evaluate(&self, failure: &Failure) -> bool {
        self.expr.evaluate(failure)
    }
}

/// Escapes `\`, `%` and `_` so that `value` matches only itself in a LIKE
/// pattern.
pub fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Translates a LIKE pattern into an anchored regular expression. `%`
/// matches any run of characters, `_` exactly one, and `\` escapes the next
/// character.
pub fn like_to_regex(pattern: &str) -> Result<Regex, String> {
    let mut out = String::from("(?s)^");
    let mut chars = pattern.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            '\\' => match chars.next() {
                Some(escaped) => out.push_str(&regex::escape(escaped.encode_utf8(&mut [0; 4]))),
                None => return Err("LIKE pattern ends with an unfinished escape".to_owned()),
            },
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|err| err.to_string())
}

fn parse_error(position: usize, message: impl Into<String>) -> RuleError {
    RuleError::Parse {
        position,
        message: message.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TokenKind {
    Word(String),
    Str(String),
    LParen,
    RParen,
    Comma,
    Eq,
    NotEq,
    End,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    position: usize,
}

fn tokenize(input: &str) -> Result<Vec<Token>, RuleError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(position, ch)) = chars.peek() {
        let kind = match ch {
            c if c.is_whitespace() => {
                chars.next();
                continue;
            }
            '(' => {
                chars.next();
                TokenKind::LParen
            }
            ')' => {
                chars.next();
                TokenKind::RParen
            }
            ',' => {
                chars.next();
                TokenKind::Comma
            }
            '=' => {
                chars.next();
                TokenKind::Eq
            }
            '!' => {
                chars.next();
                match chars.next() {
                    Some((_, '=')) => TokenKind::NotEq,
                    _ => return Err(parse_error(position, "expected '=' after '!'")),
                }
            }
            '<' => {
                chars.next();
                match chars.next() {
                    Some((_, '>')) => TokenKind::NotEq,
                    _ => return Err(parse_error(position, "expected '>' after '<'")),
                }
            }
            '"' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some((_, '"')) => break,
                        Some((_, '\\')) => match chars.next() {
                            Some((_, escaped)) => value.push(escaped),
                            None => return Err(parse_error(position, "unterminated string")),
                        },
                        Some((_, other)) => value.push(other),
                        None => return Err(parse_error(position, "unterminated string")),
                    }
                }
                TokenKind::Str(value)
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut word = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                TokenKind::Word(word.to_ascii_uppercase())
            }
            other => {
                return Err(parse_error(
                    position,
                    format!("unexpected character {other:?}"),
                ));
            }
        };
        tokens.push(Token { kind, position });
    }

    tokens.push(Token {
        kind: TokenKind::End,
        position: input.len(),
    });
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    index: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        // The token list always ends with `End`, which is never consumed.
        &self.tokens[self.index.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::End {
            self.index += 1;
        }
        token
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(&self.peek().kind, TokenKind::Word(word) if word == keyword)
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<(), RuleError> {
        let token = self.advance();
        if token.kind == kind {
            Ok(())
        } else {
            Err(parse_error(token.position, format!("expected {what}")))
        }
    }

    fn expect_string(&mut self) -> Result<(String, usize), RuleError> {
        let token = self.advance();
        match token.kind {
            TokenKind::Str(value) => Ok((value, token.position)),
            _ => Err(parse_error(token.position, "expected string literal")),
        }
    }

    /// Enters one level of `(` or `NOT`. Recursion in the parser, in
    /// `Expr::evaluate` and in dropping the tree is bounded by this depth.
    fn nest(&mut self, position: usize) -> Result<(), RuleError> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(parse_error(position, "expression nested too deeply"));
        }
        self.depth += 1;
        Ok(())
    }

    fn expression(&mut self) -> Result<Expr, RuleError> {
        let mut terms = vec![self.conjunction()?];
        while self.eat_keyword("OR") {
            terms.push(self.conjunction()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Expr::Or(terms)
        })
    }

    fn conjunction(&mut self) -> Result<Expr, RuleError> {
        let mut terms = vec![self.unary()?];
        while self.eat_keyword("AND") {
            terms.push(self.unary()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Expr::And(terms)
        })
    }

    fn unary(&mut self) -> Result<Expr, RuleError> {
        let position = self.peek().position;
        if self.eat_keyword("NOT") {
            self.nest(position)?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, RuleError> {
        let token = self.advance();
        match token.kind {
            TokenKind::LParen => {
                self.nest(token.position)?;
                let inner = self.expression()?;
                self.expect(TokenKind::RParen, "')'")?;
                self.depth -= 1;
                Ok(inner)
            }
            TokenKind::Word(word) => match word.as_str() {
                "TRUE" => Ok(Expr::Literal(true)),
                "FALSE" => Ok(Expr::Literal(false)),
                "REGEXP_CONTAINS" => self.regexp_contains(),
                _ => {
                    let field = field_named(&word, token.position)?;
                    self.comparison(field)
                }
            },
            _ => Err(parse_error(token.position, "expected expression")),
        }
    }

    fn regexp_contains(&mut self) -> Result<Expr, RuleError> {
        self.expect(TokenKind::LParen, "'('")?;
        let token = self.advance();
        let field = match &token.kind {
            TokenKind::Word(word) => field_named(word, token.position)?,
            _ => return Err(parse_error(token.position, "expected field name")),
        };
        self.expect(TokenKind::Comma, "','")?;
        let (pattern, position) = self.expect_string()?;
        let regex = Regex::new(&pattern).map_err(|err| {
            parse_error(position, format!("invalid regular expression: {err}"))
        })?;
        self.expect(TokenKind::RParen, "')'")?;
        Ok(Expr::RegexpContains { field, regex })
    }

    fn comparison(&mut self, field: Field) -> Result<Expr, RuleError> {
        let token = self.peek().clone();
        match &token.kind {
            TokenKind::Eq => {
                self.advance();
                let (value, _) = self.expect_string()?;
                Ok(Expr::Equals { field, value })
            }
            TokenKind::NotEq => {
                self.advance();
                let (value, _) = self.expect_string()?;
                Ok(Expr::Not(Box::new(Expr::Equals { field, value })))
            }
            TokenKind::Word(_) => {
                let negated = self.eat_keyword("NOT");
                let expr = if self.eat_keyword("LIKE") {
                    let (pattern, position) = self.expect_string()?;
                    let pattern =
                        like_to_regex(&pattern).map_err(|message| parse_error(position, message))?;
                    Expr::Like { field, pattern }
                } else if self.eat_keyword("IN") {
                    self.expect(TokenKind::LParen, "'('")?;
                    let mut values = vec![self.expect_string()?.0];
                    while self.peek().kind == TokenKind::Comma {
                        self.advance();
                        values.push(self.expect_string()?.0);
                    }
                    self.expect(TokenKind::RParen, "')'")?;
                    Expr::In { field, values }
                } else {
                    return Err(parse_error(self.peek().position, "expected LIKE or IN"));
                };
                Ok(if negated {
                    Expr::Not(Box::new(expr))
                } else {
                    expr
                })
            }
            _ => Err(parse_error(token.position, "expected comparison operator")),
        }
    }
}

fn field_named(word: &str, position: usize) -> Result<Field, RuleError> {
    match word {
        "TEST" => Ok(Field::Test),
        "REASON" => Ok(Field::Reason),
        _ => Err(parse_error(
            position,
            format!("unknown field {:?}, expected test or reason", word.to_ascii_lowercase()),
        )),
    }
}
