// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Source-level rewrites: literal lifting and ident interpolation.
//!
//! Lifting rewrites `event.data.id == "abc"` into `event.data.id == vars.a` with
//! `vars = {"a": "abc"}`. Expressions that differ only in their literals then share
//! one compiled program in the [`Compiler`](crate::Compiler) cache.

use serde_json::{Map, Value};

use crate::error::Result;
use crate::lexer::{Spanned, Token, tokenize};
use crate::path;

/// Root identifier holding lifted literals.
pub const VAR_PREFIX: &str = "vars";

/// An expression with its literals moved into `vars`.
#[derive(Debug, Clone, PartialEq)]
pub struct Lifted {
    /// Rewritten expression text.
    pub expression: String,
    /// Lifted literal values keyed by generated name.
    pub vars: Map<String, Value>,
}

impl Lifted {
    /// Look up a lifted value from a `vars.<name>` ident.
    pub fn get(&self, ident: &str) -> Option<&Value> {
        ident
            .strip_prefix(VAR_PREFIX)
            .and_then(|rest| rest.strip_prefix('.'))
            .and_then(|name| self.vars.get(name))
    }
}

/// Lift string, numeric and null literals out of an expression.
///
/// Literals inside index subscripts (`items[0]`, `data["key"]`) stay in place so
/// that paths remain static. An expression that already references `vars.` is
/// returned untouched.
pub fn lift_literals(expression: &str) -> Result<Lifted> {
    if expression.contains("vars.") {
        return Ok(Lifted {
            expression: expression.to_string(),
            vars: Map::new(),
        });
    }

    let tokens = tokenize(expression)?;
    let mut vars = Map::new();
    let mut out = String::with_capacity(expression.len() + 16);
    let mut copied_to = 0usize;
    // One entry per open bracket: true when it is an index subscript.
    let mut brackets: Vec<bool> = Vec::new();

    let mut i = 0;
    while i < tokens.len() {
        let spanned = &tokens[i];
        match spanned.token {
            Token::LeftBracket => {
                let is_subscript = i > 0 && is_postfix_target(&tokens[i - 1].token);
                brackets.push(is_subscript);
            }
            Token::RightBracket => {
                brackets.pop();
            }
            _ => {}
        }

        let in_subscript = brackets.iter().any(|b| *b);
        if !in_subscript {
            // Negative numeric literal in unary position.
            if spanned.token == Token::Minus
                && (i == 0 || is_unary_context(&tokens[i - 1].token))
                && let Some(next) = tokens.get(i + 1)
                && let Some(value) = numeric_value(&next.token, true)
            {
                out.push_str(&expression[copied_to..spanned.start]);
                push_var(&mut out, &mut vars, value);
                copied_to = next.end;
                i += 2;
                continue;
            }

            if spanned.token.is_liftable_literal() {
                let value = literal_value(&spanned.token);
                out.push_str(&expression[copied_to..spanned.start]);
                push_var(&mut out, &mut vars, value);
                copied_to = spanned.end;
            }
        }
        i += 1;
    }
    out.push_str(&expression[copied_to..]);

    Ok(Lifted {
        expression: out,
        vars,
    })
}

/// Replace scalar-valued paths beginning with `prefix` by their literal value in `data`.
///
/// `interpolate("async.data.id == event.data.id", &["event"], &trigger)` turns the
/// right-hand side into a literal taken from the trigger event, making the
/// predicate indexable. Paths resolving to objects or arrays, or not at all, are
/// left in place.
pub fn interpolate(expression: &str, prefix: &[&str], data: &Value) -> Result<String> {
    let tokens = tokenize(expression)?;
    let mut out = String::with_capacity(expression.len());
    let mut copied_to = 0usize;

    let mut i = 0;
    while i < tokens.len() {
        let starts_path = matches!(tokens[i].token, Token::Ident(_))
            && (i == 0 || tokens[i - 1].token != Token::Dot);
        if !starts_path {
            i += 1;
            continue;
        }

        let (segments, end_index) = collect_path(&tokens, i);
        let matches_prefix = segments.len() > prefix.len()
            && segments
                .iter()
                .zip(prefix.iter())
                .all(|(seg, want)| seg == want);

        if matches_prefix {
            let rest = segments[prefix.len()..].join(".").replace(".[", "[");
            if let Some(value) = path::resolve(data, &rest)
                && let Some(literal) = render_literal(value)
            {
                out.push_str(&expression[copied_to..tokens[i].start]);
                out.push_str(&literal);
                copied_to = tokens[end_index].end;
            }
        }
        i = end_index + 1;
    }
    out.push_str(&expression[copied_to..]);
    Ok(out)
}

/// Collect `ident(.ident | [int])*` starting at `start`. Returns the segments and the
/// index of the last token consumed. A trailing `.method(` is not part of the path.
fn collect_path(tokens: &[Spanned], start: usize) -> (Vec<String>, usize) {
    let mut segments = Vec::new();
    if let Token::Ident(name) = &tokens[start].token {
        segments.push(name.clone());
    }
    let mut last = start;
    loop {
        match (tokens.get(last + 1), tokens.get(last + 2), tokens.get(last + 3)) {
            (Some(dot), Some(next), after) if dot.token == Token::Dot => {
                let Token::Ident(name) = &next.token else {
                    break;
                };
                if after.is_some_and(|t| t.token == Token::LeftParen) {
                    break;
                }
                segments.push(name.clone());
                last += 2;
            }
            (Some(open), Some(index), Some(close))
                if open.token == Token::LeftBracket && close.token == Token::RightBracket =>
            {
                match &index.token {
                    Token::Int(n) => segments.push(format!("[{n}]")),
                    Token::Str(s) => segments.push(s.clone()),
                    _ => break,
                }
                last += 3;
            }
            _ => break,
        }
    }
    (segments, last)
}

fn is_postfix_target(token: &Token) -> bool {
    matches!(
        token,
        Token::Ident(_) | Token::RightBracket | Token::RightParen | Token::Str(_)
    )
}

fn is_unary_context(token: &Token) -> bool {
    matches!(
        token,
        Token::EqEq
            | Token::NotEq
            | Token::Lt
            | Token::LtEq
            | Token::Gt
            | Token::GtEq
            | Token::AndAnd
            | Token::OrOr
            | Token::LeftParen
            | Token::LeftBracket
            | Token::LeftBrace
            | Token::Comma
            | Token::Colon
            | Token::Question
            | Token::In
            | Token::Bang
            | Token::Plus
            | Token::Minus
            | Token::Star
            | Token::Slash
            | Token::Percent
    )
}

fn numeric_value(token: &Token, negate: bool) -> Option<Value> {
    match token {
        Token::Int(n) => Some(Value::from(if negate { -n } else { *n })),
        Token::Float(f) => {
            serde_json::Number::from_f64(if negate { -f } else { *f }).map(Value::Number)
        }
        _ => None,
    }
}

fn literal_value(token: &Token) -> Value {
    match token {
        Token::Str(s) => Value::String(s.clone()),
        Token::Null => Value::Null,
        other => numeric_value(other, false).unwrap_or(Value::Null),
    }
}

fn push_var(out: &mut String, vars: &mut Map<String, Value>, value: Value) {
    let name = var_name(vars.len());
    out.push_str(VAR_PREFIX);
    out.push('.');
    out.push_str(&name);
    vars.insert(name, value);
}

/// `0 -> a`, `25 -> z`, `26 -> aa`, ...
fn var_name(mut n: usize) -> String {
    let mut name = Vec::new();
    loop {
        name.push(b'a' + (n % 26) as u8);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    name.reverse();
    String::from_utf8(name).unwrap_or_default()
}

/// Render a scalar JSON value as expression source text.
pub fn render_literal(value: &Value) -> Option<String> {
    match value {
        Value::Null => Some("null".to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(quote(s)),
        Value::Array(_) | Value::Object(_) => None,
    }
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lift_strings_and_numbers() {
        let lifted = lift_literals("event.data.id == \"abc\" && event.data.n > 10").unwrap();
        assert_eq!(
            lifted.expression,
            "event.data.id == vars.a && event.data.n > vars.b"
        );
        assert_eq!(lifted.vars.get("a"), Some(&json!("abc")));
        assert_eq!(lifted.vars.get("b"), Some(&json!(10)));
        assert_eq!(lifted.get("vars.a"), Some(&json!("abc")));
    }

    #[test]
    fn test_lift_shares_shape() {
        let a = lift_literals("event.data.id == 'x'").unwrap();
        let b = lift_literals("event.data.id == 'y'").unwrap();
        assert_eq!(a.expression, b.expression);
        assert_ne!(a.vars, b.vars);
    }

    #[test]
    fn test_lift_null_and_negative() {
        let lifted = lift_literals("a == null || b < -3.5").unwrap();
        assert_eq!(lifted.expression, "a == vars.a || b < vars.b");
        assert_eq!(lifted.vars.get("a"), Some(&Value::Null));
        assert_eq!(lifted.vars.get("b"), Some(&json!(-3.5)));

        // Binary minus is not folded.
        let lifted = lift_literals("a - 1 > 0").unwrap();
        assert_eq!(lifted.expression, "a - vars.a > vars.b");
    }

    #[test]
    fn test_lift_skips_subscripts() {
        let lifted = lift_literals("event.data.items[0].id == 'x' && m['k'] == 1").unwrap();
        assert_eq!(
            lifted.expression,
            "event.data.items[0].id == vars.a && m['k'] == vars.b"
        );
    }

    #[test]
    fn test_lift_list_literal_is_lifted() {
        let lifted = lift_literals("a in ['x', 'y']").unwrap();
        assert_eq!(lifted.expression, "a in [vars.a, vars.b]");
    }

    #[test]
    fn test_no_double_lift() {
        let lifted = lift_literals("event.data.id == vars.a").unwrap();
        assert_eq!(lifted.expression, "event.data.id == vars.a");
        assert!(lifted.vars.is_empty());
    }

    #[test]
    fn test_var_names() {
        assert_eq!(var_name(0), "a");
        assert_eq!(var_name(25), "z");
        assert_eq!(var_name(26), "aa");
        assert_eq!(var_name(27), "ab");
        assert_eq!(var_name(52), "ba");
    }

    #[test]
    fn test_interpolate() {
        let trigger = json!({"data": {"id": "A-1", "n": 3, "obj": {"x": 1}, "list": [5]}});
        let out = interpolate(
            "event.data.id == ctx.event.data.id && event.data.n > ctx.event.data.n",
            &["ctx", "event"],
            &trigger,
        )
        .unwrap();
        assert_eq!(out, "event.data.id == \"A-1\" && event.data.n > 3");

        // Objects stay in place; indices resolve.
        let out = interpolate(
            "x == ctx.event.data.obj && y == ctx.event.data.list[0]",
            &["ctx", "event"],
            &trigger,
        )
        .unwrap();
        assert_eq!(out, "x == ctx.event.data.obj && y == 5");

        // Method calls are not swallowed into the path.
        let out = interpolate(
            "ctx.event.data.id.startsWith('A')",
            &["ctx", "event"],
            &trigger,
        )
        .unwrap();
        assert_eq!(out, "\"A-1\".startsWith('A')");
    }

    #[test]
    fn test_render_literal_escapes() {
        assert_eq!(render_literal(&json!("a\"b")).as_deref(), Some("\"a\\\"b\""));
        assert_eq!(render_literal(&json!(null)).as_deref(), Some("null"));
        assert_eq!(render_literal(&json!([1])), None);
    }
}
