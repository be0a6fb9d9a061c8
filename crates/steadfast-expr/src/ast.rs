// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Expression AST.

use std::fmt;

use serde_json::Value;

/// Binary operators, in CEL spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    In,
}

impl BinaryOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::In => "in",
        }
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::Lt
                | BinaryOp::LtEq
                | BinaryOp::Gt
                | BinaryOp::GtEq
        )
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comprehension macros. These are never inverted by negation push-down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Macro {
    All,
    Exists,
    ExistsOne,
    Map,
    Filter,
}

impl Macro {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "all" => Some(Macro::All),
            "exists" => Some(Macro::Exists),
            "exists_one" => Some(Macro::ExistsOne),
            "map" => Some(Macro::Map),
            "filter" => Some(Macro::Filter),
            _ => None,
        }
    }
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Literal scalar: string, number, bool or null.
    Literal(Value),
    /// Bare identifier, e.g. `event`.
    Ident(String),
    /// Field selection, e.g. `event.data`.
    Member(Box<Expr>, String),
    /// Index access, e.g. `items[0]` or `data["key"]`.
    Index(Box<Expr>, Box<Expr>),
    /// `!expr`
    Not(Box<Expr>),
    /// `-expr`
    Neg(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// `cond ? a : b`
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    List(Vec<Expr>),
    Map(Vec<(Expr, Expr)>),
    /// Global function call, e.g. `size(x)`.
    Call(String, Vec<Expr>),
    /// Receiver-style call, e.g. `name.startsWith("a")`.
    Method(Box<Expr>, String, Vec<Expr>),
    /// `has(a.b)` field presence test.
    Has(Box<Expr>),
    /// `range.macro(var, body)`
    Comprehension {
        kind: Macro,
        range: Box<Expr>,
        var: String,
        body: Box<Expr>,
    },
}

impl Expr {
    /// The dotted path for a select chain rooted at an ident, e.g. `event.data.items[0].id`.
    ///
    /// Returns `None` for anything that is not a pure path.
    pub fn path(&self) -> Option<String> {
        match self {
            Expr::Ident(name) => Some(name.clone()),
            Expr::Member(target, field) => target.path().map(|p| format!("{p}.{field}")),
            Expr::Index(target, index) => {
                let base = target.path()?;
                match index.as_ref() {
                    Expr::Literal(Value::Number(n)) if n.is_i64() || n.is_u64() => {
                        Some(format!("{base}[{n}]"))
                    }
                    Expr::Literal(Value::String(s)) => Some(format!("{base}.{s}")),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// True if this subtree contains a comprehension macro.
    pub fn has_macros(&self) -> bool {
        match self {
            Expr::Comprehension { .. } => true,
            Expr::Literal(_) | Expr::Ident(_) => false,
            Expr::Member(e, _) | Expr::Not(e) | Expr::Neg(e) | Expr::Has(e) => e.has_macros(),
            Expr::Index(a, b) | Expr::And(a, b) | Expr::Or(a, b) | Expr::Binary(_, a, b) => {
                a.has_macros() || b.has_macros()
            }
            Expr::Ternary(a, b, c) => a.has_macros() || b.has_macros() || c.has_macros(),
            Expr::List(items) | Expr::Call(_, items) => items.iter().any(Expr::has_macros),
            Expr::Method(target, _, args) => {
                target.has_macros() || args.iter().any(Expr::has_macros)
            }
            Expr::Map(entries) => entries
                .iter()
                .any(|(k, v)| k.has_macros() || v.has_macros()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ident(name: &str) -> Box<Expr> {
        Box::new(Expr::Ident(name.to_string()))
    }

    #[test]
    fn test_path() {
        let expr = Expr::Member(
            Box::new(Expr::Index(
                Box::new(Expr::Member(ident("event"), "items".into())),
                Box::new(Expr::Literal(json!(0))),
            )),
            "id".into(),
        );
        assert_eq!(expr.path().as_deref(), Some("event.items[0].id"));

        let call = Expr::Call("size".into(), vec![Expr::Ident("a".into())]);
        assert_eq!(call.path(), None);
    }

    #[test]
    fn test_has_macros() {
        let comp = Expr::Comprehension {
            kind: Macro::Exists,
            range: ident("items"),
            var: "i".into(),
            body: Box::new(Expr::Literal(json!(true))),
        };
        assert!(comp.has_macros());
        assert!(Expr::Not(Box::new(comp)).has_macros());
        assert!(!Expr::Not(ident("a")).has_macros());
    }
}
