// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Recursive-descent parser for the CEL expression subset.
//!
//! Precedence, lowest first:
//!
//! | Level | Operators |
//! |-------|-----------|
//! | conditional | `? :` |
//! | or | `\|\|` |
//! | and | `&&` |
//! | relation | `== != < <= > >= in` |
//! | additive | `+ -` |
//! | multiplicative | `* / %` |
//! | unary | `! -` |
//! | member | `.field`, `.method(...)`, `[index]` |

use serde_json::{Number, Value};

use crate::ast::{BinaryOp, Expr, Macro};
use crate::error::{ExprError, Result};
use crate::lexer::{Spanned, Token, tokenize};

const MAX_DEPTH: usize = 96;

/// Parse an expression string into an AST.
pub fn parse(input: &str) -> Result<Expr> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.parse_expr()?;
    match parser.current() {
        Token::Eof => Ok(expr),
        other => Err(ExprError::parse(
            parser.offset(),
            format!("unexpected trailing token {other:?}"),
        )),
    }
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn current(&self) -> &Token {
        self.tokens
            .get(self.pos)
            .map(|s| &s.token)
            .unwrap_or(&Token::Eof)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|s| s.start).unwrap_or(0)
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.current() == expected {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(ExprError::parse(
                self.offset(),
                format!("expected {expected:?}, found {:?}", self.current()),
            ))
        }
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExprError::parse(self.offset(), "expression nested too deeply"));
        }
        Ok(())
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        self.enter()?;
        let cond = self.parse_or()?;
        let result = if self.eat(&Token::Question) {
            let then = self.parse_expr()?;
            self.expect(Token::Colon)?;
            let otherwise = self.parse_expr()?;
            Expr::Ternary(Box::new(cond), Box::new(then), Box::new(otherwise))
        } else {
            cond
        };
        self.depth -= 1;
        Ok(result)
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::OrOr) {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_relation()?;
        while self.eat(&Token::AndAnd) {
            let right = self.parse_relation()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_relation(&mut self) -> Result<Expr> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.current() {
                Token::EqEq => BinaryOp::Eq,
                Token::NotEq => BinaryOp::NotEq,
                Token::Lt => BinaryOp::Lt,
                Token::LtEq => BinaryOp::LtEq,
                Token::Gt => BinaryOp::Gt,
                Token::GtEq => BinaryOp::GtEq,
                Token::In => BinaryOp::In,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_additive()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.current() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.current() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        self.enter()?;
        let result = match self.current() {
            Token::Bang => {
                self.advance();
                Expr::Not(Box::new(self.parse_unary()?))
            }
            Token::Minus => {
                self.advance();
                // Fold negative numeric literals so `x > -5` stays a literal comparison.
                match self.current().clone() {
                    Token::Int(n) => {
                        self.advance();
                        self.parse_postfix(Expr::Literal(Value::from(-n)))?
                    }
                    Token::Float(f) => {
                        self.advance();
                        self.parse_postfix(float_literal(-f)?)?
                    }
                    _ => Expr::Neg(Box::new(self.parse_unary()?)),
                }
            }
            _ => {
                let primary = self.parse_primary()?;
                self.parse_postfix(primary)?
            }
        };
        self.depth -= 1;
        Ok(result)
    }

    fn parse_postfix(&mut self, mut expr: Expr) -> Result<Expr> {
        loop {
            match self.current() {
                Token::Dot => {
                    self.advance();
                    let name = match self.advance() {
                        Token::Ident(name) => name,
                        other => {
                            return Err(ExprError::parse(
                                self.offset(),
                                format!("expected field name after '.', found {other:?}"),
                            ));
                        }
                    };
                    if self.eat(&Token::LeftParen) {
                        let args = self.parse_args(Token::RightParen)?;
                        expr = self.method_or_macro(expr, name, args)?;
                    } else {
                        expr = Expr::Member(Box::new(expr), name);
                    }
                }
                Token::LeftBracket => {
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect(Token::RightBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => return Ok(expr),
            }
        }
    }

    fn method_or_macro(&mut self, target: Expr, name: String, mut args: Vec<Expr>) -> Result<Expr> {
        let Some(kind) = Macro::from_name(&name) else {
            return Ok(Expr::Method(Box::new(target), name, args));
        };
        if args.len() != 2 {
            return Err(ExprError::Unsupported(format!(
                "macro '{name}' takes exactly two arguments"
            )));
        }
        let body = args.pop().unwrap_or(Expr::Literal(Value::Null));
        let var = match args.pop() {
            Some(Expr::Ident(var)) => var,
            _ => {
                return Err(ExprError::parse(
                    self.offset(),
                    format!("macro '{name}' requires an identifier as its first argument"),
                ));
            }
        };
        Ok(Expr::Comprehension {
            kind,
            range: Box::new(target),
            var,
            body: Box::new(body),
        })
    }

    fn parse_args(&mut self, close: Token) -> Result<Vec<Expr>> {
        let mut args = Vec::new();
        if self.eat(&close) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            if self.eat(&close) {
                return Ok(args);
            }
            self.expect(Token::Comma)?;
            // Trailing comma
            if self.eat(&close) {
                return Ok(args);
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let offset = self.offset();
        match self.advance() {
            Token::Int(n) => Ok(Expr::Literal(Value::from(n))),
            Token::Float(f) => float_literal(f),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::Ident(name) => {
                if self.eat(&Token::LeftParen) {
                    let mut args = self.parse_args(Token::RightParen)?;
                    if name == "has" {
                        if args.len() != 1 {
                            return Err(ExprError::parse(offset, "has() takes one argument"));
                        }
                        let arg = args.remove(0);
                        if !matches!(arg, Expr::Member(..)) {
                            return Err(ExprError::parse(
                                offset,
                                "has() argument must be a field selection",
                            ));
                        }
                        return Ok(Expr::Has(Box::new(arg)));
                    }
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            Token::LeftParen => {
                let inner = self.parse_expr()?;
                self.expect(Token::RightParen)?;
                Ok(inner)
            }
            Token::LeftBracket => Ok(Expr::List(self.parse_args(Token::RightBracket)?)),
            Token::LeftBrace => {
                let mut entries = Vec::new();
                if self.eat(&Token::RightBrace) {
                    return Ok(Expr::Map(entries));
                }
                loop {
                    let key = self.parse_expr()?;
                    self.expect(Token::Colon)?;
                    let value = self.parse_expr()?;
                    entries.push((key, value));
                    if self.eat(&Token::RightBrace) {
                        return Ok(Expr::Map(entries));
                    }
                    self.expect(Token::Comma)?;
                }
            }
            other => Err(ExprError::parse(
                offset,
                format!("unexpected token {other:?}"),
            )),
        }
    }
}

fn float_literal(f: f64) -> Result<Expr> {
    Number::from_f64(f)
        .map(|n| Expr::Literal(Value::Number(n)))
        .ok_or_else(|| ExprError::Unsupported(format!("non-finite float literal {f}")))
}
