//! Textual signature syntax.
//!
//! ```text
//! (i32, {x: f32, y: f32}, ptr<i8>, ...) -> void
//! ({[4 x i8]}, packed{i8, i32}, align(16) union{i64, f64}) -> ptr<{i32, pad(4)}>
//! ```

use std::str::FromStr;

use super::{FunctionType, GroupLayout, ScalarKind, TypeLayout};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Number(u64),
    Punct(char),
    Arrow,
    Ellipsis,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();
    while let Some(&(pos, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() {
            let mut value: u64 = 0;
            while let Some(&(_, d)) = chars.peek() {
                let Some(digit) = d.to_digit(10) else { break };
                value = value
                    .checked_mul(10)
                    .and_then(|v| v.checked_add(u64::from(digit)))
                    .ok_or_else(|| syntax(pos, "number is too large"))?;
                chars.next();
            }
            tokens.push(Token::Number(value));
        } else if c.is_ascii_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(&(_, d)) = chars.peek() {
                if d.is_ascii_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Ident(ident));
        } else if c == '-' {
            chars.next();
            match chars.next() {
                Some((_, '>')) => tokens.push(Token::Arrow),
                _ => return Err(syntax(pos, "expected `->`")),
            }
        } else if c == '.' {
            for _ in 0..3 {
                match chars.next() {
                    Some((_, '.')) => {}
                    _ => return Err(syntax(pos, "expected `...`")),
                }
            }
            tokens.push(Token::Ellipsis);
        } else if "(){}[]<>,:".contains(c) {
            tokens.push(Token::Punct(c));
            chars.next();
        } else {
            return Err(syntax(pos, &format!("unexpected character `{c}`")));
        }
    }
    Ok(tokens)
}

fn syntax(pos: usize, msg: &str) -> Error {
    Error::InvalidSignature(format!("syntax error at {pos}: {msg}"))
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn error(&self, msg: &str) -> Error {
        Error::InvalidSignature(format!("syntax error at token {}: {msg}", self.pos))
    }

    fn expect_punct(&mut self, expected: char) -> Result<()> {
        match self.next() {
            Some(Token::Punct(c)) if c == expected => Ok(()),
            _ => Err(self.error(&format!("expected `{expected}`"))),
        }
    }

    fn eat_punct(&mut self, expected: char) -> bool {
        if self.peek() == Some(&Token::Punct(expected)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn number(&mut self) -> Result<u64> {
        match self.next() {
            Some(Token::Number(n)) => Ok(n),
            _ => Err(self.error("expected a number")),
        }
    }

    fn finish(&self) -> Result<()> {
        if self.pos == self.tokens.len() {
            Ok(())
        } else {
            Err(self.error("unexpected trailing input"))
        }
    }

    fn signature(&mut self) -> Result<FunctionType> {
        self.expect_punct('(')?;
        let mut params = Vec::new();
        let mut first_variadic = None;
        if !self.eat_punct(')') {
            loop {
                if self.peek() == Some(&Token::Ellipsis) {
                    self.pos += 1;
                    if first_variadic.is_some() {
                        return Err(self.error("`...` may appear only once"));
                    }
                    first_variadic = Some(params.len());
                } else {
                    params.push(self.layout()?);
                }
                if self.eat_punct(')') {
                    break;
                }
                self.expect_punct(',')?;
            }
        }
        match self.next() {
            Some(Token::Arrow) => {}
            _ => return Err(self.error("expected `->`")),
        }
        let ret = if self.peek() == Some(&Token::Ident("void".into())) {
            self.pos += 1;
            None
        } else {
            Some(self.layout()?)
        };
        Ok(FunctionType {
            params,
            ret,
            first_variadic,
        })
    }

    fn layout(&mut self) -> Result<TypeLayout> {
        match self.next() {
            Some(Token::Ident(ident)) => self.named_layout(&ident),
            Some(Token::Punct('{')) => {
                let members = self.members()?;
                Ok(TypeLayout::Struct(GroupLayout::structure(members, false)))
            }
            Some(Token::Punct('[')) => {
                let count = self.number()?;
                match self.next() {
                    Some(Token::Ident(x)) if x == "x" => {}
                    _ => return Err(self.error("expected `x` in array layout")),
                }
                let element = self.layout()?;
                self.expect_punct(']')?;
                Ok(TypeLayout::array(element, count))
            }
            _ => Err(self.error("expected a layout")),
        }
    }

    fn named_layout(&mut self, ident: &str) -> Result<TypeLayout> {
        let scalar = match ident {
            "i8" | "char" => Some(ScalarKind::I8),
            "i16" | "short" => Some(ScalarKind::I16),
            "i32" | "int" => Some(ScalarKind::I32),
            "i64" | "long" => Some(ScalarKind::I64),
            "f32" | "float" => Some(ScalarKind::F32),
            "f64" | "double" => Some(ScalarKind::F64),
            _ => None,
        };
        if let Some(kind) = scalar {
            return Ok(TypeLayout::Scalar(kind));
        }
        match ident {
            "ptr" => {
                if self.eat_punct('<') {
                    let target = self.layout()?;
                    self.expect_punct('>')?;
                    Ok(TypeLayout::pointer_to(target))
                } else {
                    Ok(TypeLayout::POINTER)
                }
            }
            "pad" => {
                self.expect_punct('(')?;
                let bytes = self.number()?;
                self.expect_punct(')')?;
                Ok(TypeLayout::padding(bytes))
            }
            "packed" => {
                self.expect_punct('{')?;
                let members = self.members()?;
                Ok(TypeLayout::Struct(GroupLayout::structure(members, true)))
            }
            "union" => {
                self.expect_punct('{')?;
                let members = self.members()?;
                Ok(TypeLayout::Union(GroupLayout::union(members)))
            }
            "align" => {
                self.expect_punct('(')?;
                let align = self.number()?;
                self.expect_punct(')')?;
                let group = self.layout()?;
                if !matches!(group, TypeLayout::Struct(_) | TypeLayout::Union(_)) {
                    return Err(self.error("`align` applies to a struct or union"));
                }
                Ok(group.with_alignment(align))
            }
            other => Err(self.error(&format!("unknown layout `{other}`"))),
        }
    }

    /// Parses members after an opening `{` up to and including the closing `}`.
    fn members(&mut self) -> Result<Vec<(Option<String>, TypeLayout)>> {
        let mut members = Vec::new();
        if self.eat_punct('}') {
            return Ok(members);
        }
        loop {
            let name = match (self.peek(), self.peek_at(1)) {
                (Some(Token::Ident(name)), Some(Token::Punct(':'))) => {
                    let name = name.clone();
                    self.pos += 2;
                    Some(name)
                }
                _ => None,
            };
            members.push((name, self.layout()?));
            if self.eat_punct('}') {
                return Ok(members);
            }
            self.expect_punct(',')?;
        }
    }
}

impl FromStr for FunctionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parser = Parser {
            tokens: tokenize(s)?,
            pos: 0,
        };
        let signature = parser.signature()?;
        parser.finish()?;
        Ok(signature)
    }
}

impl FromStr for TypeLayout {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parser = Parser {
            tokens: tokenize(s)?,
            pos: 0,
        };
        let layout = parser.layout()?;
        parser.finish()?;
        Ok(layout)
    }
}
