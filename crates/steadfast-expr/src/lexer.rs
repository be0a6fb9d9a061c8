// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lexer for the CEL expression subset.
//!
//! Every token carries its byte span so that literal lifting and interpolation
//! can rewrite the source text without re-printing the whole expression.

use std::str::CharIndices;

use crate::error::{ExprError, Result};

/// Token kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    True,
    False,
    Null,

    // Keywords
    In,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    EqEq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    AndAnd,
    OrOr,
    Question,
    Colon,

    // Punctuation
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    LeftBrace,
    RightBrace,
    Comma,
    Dot,

    Eof,
}

impl Token {
    /// True for tokens that are lifted into `vars` by the literal lifter.
    pub fn is_liftable_literal(&self) -> bool {
        matches!(
            self,
            Token::Int(_) | Token::Float(_) | Token::Str(_) | Token::Null
        )
    }
}

/// A token and its byte span in the source.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub start: usize,
    pub end: usize,
}

/// Lexer over an expression string.
pub struct Lexer<'a> {
    input: &'a str,
    chars: CharIndices<'a>,
    current: Option<(usize, char)>,
    peeked: Option<(usize, char)>,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        let mut chars = input.char_indices();
        let current = chars.next();
        let peeked = chars.next();
        Self {
            input,
            chars,
            current,
            peeked,
        }
    }

    /// Tokenize the whole input. The final token is always [`Token::Eof`].
    pub fn tokenize(mut self) -> Result<Vec<Spanned>> {
        let mut tokens = Vec::new();
        loop {
            let spanned = self.next_token()?;
            let done = spanned.token == Token::Eof;
            tokens.push(spanned);
            if done {
                return Ok(tokens);
            }
        }
    }

    fn next_token(&mut self) -> Result<Spanned> {
        self.skip_whitespace();

        let Some((start, c)) = self.current else {
            return Ok(Spanned {
                token: Token::Eof,
                start: self.input.len(),
                end: self.input.len(),
            });
        };

        let token = match c {
            '(' => self.single(Token::LeftParen),
            ')' => self.single(Token::RightParen),
            '[' => self.single(Token::LeftBracket),
            ']' => self.single(Token::RightBracket),
            '{' => self.single(Token::LeftBrace),
            '}' => self.single(Token::RightBrace),
            ',' => self.single(Token::Comma),
            '+' => self.single(Token::Plus),
            '-' => self.single(Token::Minus),
            '*' => self.single(Token::Star),
            '/' => self.single(Token::Slash),
            '%' => self.single(Token::Percent),
            '?' => self.single(Token::Question),
            ':' => self.single(Token::Colon),
            '.' => {
                if self.peek_char().is_some_and(|c| c.is_ascii_digit()) {
                    self.number(start)?
                } else {
                    self.single(Token::Dot)
                }
            }
            '=' => self.pair('=', Token::EqEq, None, start)?,
            '!' => self.pair('=', Token::NotEq, Some(Token::Bang), start)?,
            '<' => self.pair('=', Token::LtEq, Some(Token::Lt), start)?,
            '>' => self.pair('=', Token::GtEq, Some(Token::Gt), start)?,
            '&' => self.pair('&', Token::AndAnd, None, start)?,
            '|' => self.pair('|', Token::OrOr, None, start)?,
            '"' | '\'' => self.string(c, start, false)?,
            c if c.is_ascii_digit() => self.number(start)?,
            c if c.is_alphabetic() || c == '_' => self.ident_or_keyword(start)?,
            other => {
                return Err(ExprError::parse(
                    start,
                    format!("unexpected character '{other}'"),
                ));
            }
        };

        Ok(Spanned {
            token,
            start,
            end: self.position(),
        })
    }

    fn position(&self) -> usize {
        self.current.map(|(i, _)| i).unwrap_or(self.input.len())
    }

    fn advance(&mut self) {
        self.current = self.peeked.take();
        self.peeked = self.chars.next();
    }

    fn current_char(&self) -> Option<char> {
        self.current.map(|(_, c)| c)
    }

    fn peek_char(&self) -> Option<char> {
        self.peeked.map(|(_, c)| c)
    }

    fn skip_whitespace(&mut self) {
        while self.current_char().is_some_and(char::is_whitespace) {
            self.advance();
        }
    }

    fn single(&mut self, token: Token) -> Token {
        self.advance();
        token
    }

    /// Two-character operator with an optional one-character fallback.
    fn pair(
        &mut self,
        second: char,
        double: Token,
        fallback: Option<Token>,
        start: usize,
    ) -> Result<Token> {
        let first = self.current_char().unwrap_or_default();
        self.advance();
        if self.current_char() == Some(second) {
            self.advance();
            return Ok(double);
        }
        fallback.ok_or_else(|| {
            ExprError::parse(start, format!("expected '{second}' after '{first}'"))
        })
    }

    fn ident_or_keyword(&mut self, start: usize) -> Result<Token> {
        // Raw string prefix: r"..." / R'...'
        if matches!(self.current_char(), Some('r' | 'R'))
            && matches!(self.peek_char(), Some('"' | '\''))
        {
            self.advance();
            let quote = self.current_char().unwrap_or('"');
            return self.string(quote, start, true);
        }

        while self
            .current_char()
            .is_some_and(|c| c.is_alphanumeric() || c == '_')
        {
            self.advance();
        }
        let text = &self.input[start..self.position()];
        Ok(match text {
            "true" => Token::True,
            "false" => Token::False,
            "null" => Token::Null,
            "in" => Token::In,
            _ => Token::Ident(text.to_string()),
        })
    }

    fn number(&mut self, start: usize) -> Result<Token> {
        if self.current_char() == Some('0') && matches!(self.peek_char(), Some('x' | 'X')) {
            self.advance();
            self.advance();
            let digits_start = self.position();
            while self.current_char().is_some_and(|c| c.is_ascii_hexdigit()) {
                self.advance();
            }
            let digits = &self.input[digits_start..self.position()];
            let value = i64::from_str_radix(digits, 16)
                .map_err(|e| ExprError::parse(start, format!("invalid hex literal: {e}")))?;
            self.skip_unsigned_suffix();
            return Ok(Token::Int(value));
        }

        let mut is_float = false;
        while self.current_char().is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
        }
        if self.current_char() == Some('.') && self.peek_char().is_some_and(|c| c.is_ascii_digit())
        {
            is_float = true;
            self.advance();
            while self.current_char().is_some_and(|c| c.is_ascii_digit()) {
                self.advance();
            }
        }
        if matches!(self.current_char(), Some('e' | 'E')) {
            is_float = true;
            self.advance();
            if matches!(self.current_char(), Some('+' | '-')) {
                self.advance();
            }
            while self.current_char().is_some_and(|c| c.is_ascii_digit()) {
                self.advance();
            }
        }

        let text = &self.input[start..self.position()];
        if is_float {
            let value: f64 = text
                .parse()
                .map_err(|e| ExprError::parse(start, format!("invalid float literal: {e}")))?;
            Ok(Token::Float(value))
        } else {
            let value: i64 = text
                .parse()
                .map_err(|e| ExprError::parse(start, format!("invalid int literal: {e}")))?;
            self.skip_unsigned_suffix();
            Ok(Token::Int(value))
        }
    }

    fn skip_unsigned_suffix(&mut self) {
        if matches!(self.current_char(), Some('u' | 'U')) {
            self.advance();
        }
    }

    fn string(&mut self, quote: char, start: usize, raw: bool) -> Result<Token> {
        self.advance(); // opening quote
        let mut value = String::new();
        loop {
            match self.current_char() {
                None => return Err(ExprError::parse(start, "unterminated string literal")),
                Some(c) if c == quote => {
                    self.advance();
                    return Ok(Token::Str(value));
                }
                Some('\\') if !raw => {
                    self.advance();
                    let escaped = self
                        .current_char()
                        .ok_or_else(|| ExprError::parse(start, "unterminated escape sequence"))?;
                    match escaped {
                        'n' => value.push('\n'),
                        't' => value.push('\t'),
                        'r' => value.push('\r'),
                        '0' => value.push('\0'),
                        '\\' => value.push('\\'),
                        '\'' => value.push('\''),
                        '"' => value.push('"'),
                        'u' => {
                            let mut hex = String::with_capacity(4);
                            for _ in 0..4 {
                                self.advance();
                                match self.current_char() {
                                    Some(h) if h.is_ascii_hexdigit() => hex.push(h),
                                    _ => {
                                        return Err(ExprError::parse(
                                            start,
                                            "invalid unicode escape",
                                        ));
                                    }
                                }
                            }
                            let code = u32::from_str_radix(&hex, 16)
                                .ok()
                                .and_then(char::from_u32)
                                .ok_or_else(|| ExprError::parse(start, "invalid unicode escape"))?;
                            value.push(code);
                        }
                        other => {
                            return Err(ExprError::parse(
                                start,
                                format!("unknown escape sequence '\\{other}'"),
                            ));
                        }
                    }
                    self.advance();
                }
                Some(c) => {
                    value.push(c);
                    self.advance();
                }
            }
        }
    }
}

/// Tokenize an expression.
pub fn tokenize(input: &str) -> Result<Vec<Spanned>> {
    Lexer::new(input).tokenize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<Token> {
        tokenize(input)
            .unwrap()
            .into_iter()
            .map(|s| s.token)
            .collect()
    }

    #[test]
    fn test_comparison() {
        assert_eq!(
            kinds("event.data.id == 'abc'"),
            vec![
                Token::Ident("event".into()),
                Token::Dot,
                Token::Ident("data".into()),
                Token::Dot,
                Token::Ident("id".into()),
                Token::EqEq,
                Token::Str("abc".into()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            kinds("1 2.5 1e3 0x1F 7u"),
            vec![
                Token::Int(1),
                Token::Float(2.5),
                Token::Float(1000.0),
                Token::Int(31),
                Token::Int(7),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            kinds("! != < <= > >= && || ? :"),
            vec![
                Token::Bang,
                Token::NotEq,
                Token::Lt,
                Token::LtEq,
                Token::Gt,
                Token::GtEq,
                Token::AndAnd,
                Token::OrOr,
                Token::Question,
                Token::Colon,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_string_escapes_and_raw() {
        assert_eq!(
            kinds(r#""a\"b\n" r'\d+'"#),
            vec![
                Token::Str("a\"b\n".into()),
                Token::Str("\\d+".into()),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_spans() {
        let tokens = tokenize("a == \"xy\"").unwrap();
        assert_eq!((tokens[2].start, tokens[2].end), (5, 9));
    }

    #[test]
    fn test_keywords() {
        assert_eq!(
            kinds("true false null in"),
            vec![Token::True, Token::False, Token::Null, Token::In, Token::Eof]
        );
    }

    #[test]
    fn test_errors() {
        assert!(tokenize("a = b").is_err());
        assert!(tokenize("'open").is_err());
        assert!(tokenize("a # b").is_err());
        assert!(tokenize("a & b").is_err());
    }
}
