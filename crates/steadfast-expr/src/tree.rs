// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Predicate tree extracted from an expression AST.
//!
//! A [`Node`] is truthy when every node in `ands` is truthy, its own `predicate`
//! holds, and (if `ors` is non-empty) at least one of `ors` is truthy:
//!
//! ```text
//! a == 1 && b > 2 && (c == "x" || d == null)
//!
//! Node { group: G(size=3)
//!   ands: [a == 1 (G), b > 2 (G)]
//!   ors:  [c == "x" (G), d == null (G)]
//! }
//! ```
//!
//! Negation is pushed into the leaves (`!(a == b)` becomes `a != b`, De Morgan for
//! `&&`/`||`) but never into comprehension macros.

use std::fmt;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde_json::Value;
use ulid::Ulid;

use crate::ast::{BinaryOp, Expr};
use crate::lift::{Lifted, VAR_PREFIX};

/// Identifies the conjunction a predicate belongs to.
///
/// `size` is the number of parts that must match for the group to be a candidate.
/// `flag` is non-zero for groups mixing string `==` and `!=`: it holds the number
/// of string equality parts, which must all match before any `!=` part counts.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct GroupId {
    size: u16,
    flag: u8,
    tail: [u8; 6],
}

impl GroupId {
    pub fn new(size: u16, flag: u8, rng: &mut impl RngCore) -> Self {
        let mut tail = [0u8; 6];
        rng.fill_bytes(&mut tail);
        Self { size, flag, tail }
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn flag(&self) -> u8 {
        self.flag
    }

    /// Big-endian byte encoding: size (2), flag (1), random tail (6).
    pub fn to_bytes(&self) -> [u8; 9] {
        let mut out = [0u8; 9];
        out[..2].copy_from_slice(&self.size.to_be_bytes());
        out[2] = self.flag;
        out[3..].copy_from_slice(&self.tail);
        out
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupId({}/{}/", self.size, self.flag)?;
        for b in self.tail {
            write!(f, "{b:02x}")?;
        }
        f.write_str(")")
    }
}

/// Comparison operator of a [`Predicate`], always read as `ident <op> literal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    /// Any clause the engines cannot index (calls, macros, `in`, bare idents).
    Opaque,
}

impl Operator {
    fn from_binary(op: BinaryOp) -> Option<Self> {
        match op {
            BinaryOp::Eq => Some(Operator::Eq),
            BinaryOp::NotEq => Some(Operator::NotEq),
            BinaryOp::Lt => Some(Operator::Lt),
            BinaryOp::LtEq => Some(Operator::LtEq),
            BinaryOp::Gt => Some(Operator::Gt),
            BinaryOp::GtEq => Some(Operator::GtEq),
            _ => None,
        }
    }

    /// Logical negation: `!(a > b)` is `a <= b`.
    pub fn invert(self) -> Self {
        match self {
            Operator::Eq => Operator::NotEq,
            Operator::NotEq => Operator::Eq,
            Operator::Gt => Operator::LtEq,
            Operator::GtEq => Operator::Lt,
            Operator::Lt => Operator::GtEq,
            Operator::LtEq => Operator::Gt,
            Operator::Opaque => Operator::Opaque,
        }
    }

    /// Mirror for swapped operands: `5 < a` is `a > 5`.
    pub fn normalize(self) -> Self {
        match self {
            Operator::Gt => Operator::Lt,
            Operator::GtEq => Operator::LtEq,
            Operator::Lt => Operator::Gt,
            Operator::LtEq => Operator::GtEq,
            other => other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "==",
            Operator::NotEq => "!=",
            Operator::Lt => "<",
            Operator::LtEq => "<=",
            Operator::Gt => ">",
            Operator::GtEq => ">=",
            Operator::Opaque => "?",
        }
    }
}

/// A single `ident <op> literal` clause.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    /// Dotted path on the left-hand side, e.g. `event.data.id`.
    pub ident: String,
    pub operator: Operator,
    /// Literal on the right-hand side (`null` when `literal_ident` is set).
    pub literal: Value,
    /// Set when comparing two idents, e.g. `event.data.a == event.data.b`.
    pub literal_ident: Option<String>,
}

impl Predicate {
    fn opaque(description: String) -> Self {
        Self {
            ident: description,
            operator: Operator::Opaque,
            literal: Value::Null,
            literal_ident: None,
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.operator == Operator::Opaque {
            return write!(f, "<{}>", self.ident);
        }
        match &self.literal_ident {
            Some(other) => write!(f, "{} {} {}", self.ident, self.operator.as_str(), other),
            None => write!(f, "{} {} {}", self.ident, self.operator.as_str(), self.literal),
        }
    }
}

/// A node of the predicate tree.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Node {
    pub group_id: GroupId,
    pub ands: Vec<Node>,
    pub ors: Vec<Node>,
    pub predicate: Option<Predicate>,
}

impl Node {
    /// A leaf holds a predicate and no children.
    pub fn is_leaf(&self) -> bool {
        self.predicate.is_some() && self.ands.is_empty() && self.ors.is_empty()
    }

    /// Collapse a container holding a single leaf into that leaf.
    fn normalize(&mut self) {
        if self.predicate.is_some() || !self.ors.is_empty() || self.ands.len() != 1 {
            return;
        }
        if self.ands[0].is_leaf() {
            let child = self.ands.remove(0);
            self.predicate = child.predicate;
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self.ands.iter().map(|n| format!("({n})")).collect();
        if !self.ors.is_empty() {
            let ors: Vec<String> = self.ors.iter().map(|n| format!("({n})")).collect();
            parts.push(format!("({})", ors.join(" || ")));
        }
        if let Some(p) = &self.predicate {
            parts.push(p.to_string());
        }
        f.write_str(&parts.join(" && "))
    }
}

/// An expression parsed into its predicate tree.
#[derive(Debug, Clone)]
pub struct ParsedExpression {
    pub evaluable_id: Ulid,
    pub root: Node,
    pub lifted: Lifted,
    /// True when any comprehension macro appears.
    pub has_macros: bool,
}

impl ParsedExpression {
    /// Top-level matching groups. An expression that is a plain disjunction at
    /// the root has one group per branch; anything else is a single group.
    pub fn root_groups(&self) -> Vec<&Node> {
        if self.root.ands.is_empty() && self.root.predicate.is_none() && self.root.ors.len() > 1
        {
            self.root.ors.iter().collect()
        } else {
            vec![&self.root]
        }
    }
}

/// Build the predicate tree for `ast`, seeding group ids from the evaluable id so
/// rebuilding the same evaluable always yields the same groups.
pub fn build(evaluable_id: Ulid, ast: &Expr, lifted: Lifted) -> ParsedExpression {
    let seed = (evaluable_id.0 >> 64) as u64;
    let mut builder = Builder {
        rng: StdRng::seed_from_u64(seed),
        lifted: &lifted,
        has_macros: false,
    };
    let mut root = builder.navigate(ast, false);
    root.normalize();
    let has_macros = builder.has_macros;
    ParsedExpression {
        evaluable_id,
        root,
        lifted,
        has_macros,
    }
}

struct Builder<'a> {
    rng: StdRng,
    lifted: &'a Lifted,
    has_macros: bool,
}

impl Builder<'_> {
    fn navigate(&mut self, expr: &Expr, negated: bool) -> Node {
        let mut node = Node::default();

        let mut conjuncts = Vec::new();
        flatten(expr, negated, true, &mut conjuncts);

        for (item, neg) in conjuncts {
            if is_effective(item, neg, false) {
                let mut disjuncts = Vec::new();
                flatten(item, neg, false, &mut disjuncts);
                let branches: Vec<Node> = disjuncts
                    .into_iter()
                    .map(|(branch, bneg)| {
                        let mut child = self.navigate(branch, bneg);
                        child.normalize();
                        child
                    })
                    .collect();
                if node.ors.is_empty() {
                    node.ors = branches;
                } else {
                    // A second disjunction in the same conjunction becomes a compound
                    // child so the existing `ors` keep their meaning.
                    let mut compound = Node {
                        ors: branches,
                        ..Node::default()
                    };
                    self.assign_group(&mut compound);
                    node.ands.push(compound);
                }
                continue;
            }

            node.ands.push(Node {
                predicate: Some(self.predicate(item, neg)),
                ..Node::default()
            });
        }

        self.assign_group(&mut node);
        node
    }

    fn assign_group(&mut self, node: &mut Node) {
        let mut total = node.ands.len();
        if node.predicate.is_some() {
            total += 1;
        }
        if !node.ors.is_empty() {
            total += 1;
        }

        let mut string_eq: u8 = 0;
        let mut has_string_neq = false;
        for child in &node.ands {
            let Some(p) = &child.predicate else { continue };
            let indexed = p.literal.as_str().is_some_and(|s| !s.is_empty());
            if !indexed || p.literal_ident.is_some() {
                continue;
            }
            match p.operator {
                Operator::Eq => string_eq = string_eq.saturating_add(1),
                Operator::NotEq => has_string_neq = true,
                _ => {}
            }
        }
        let flag = if string_eq > 0 && has_string_neq {
            string_eq
        } else {
            0
        };

        let size = u16::try_from(total).unwrap_or(u16::MAX);
        node.group_id = GroupId::new(size, flag, &mut self.rng);

        let group_id = node.group_id;
        for child in node.ands.iter_mut().chain(node.ors.iter_mut()) {
            if child.is_leaf() {
                child.group_id = group_id;
            }
        }
    }

    fn predicate(&mut self, expr: &Expr, negated: bool) -> Predicate {
        if expr.has_macros() {
            self.has_macros = true;
        }
        let Expr::Binary(op, left, right) = expr else {
            return Predicate::opaque(describe(expr));
        };
        let Some(mut operator) = Operator::from_binary(*op) else {
            return Predicate::opaque(describe(expr));
        };
        if negated {
            operator = operator.invert();
        }

        let left_path = left.path();
        let right_path = right.path();

        match (left_path, right_path) {
            (Some(a), Some(b)) => {
                // Resolve lifted literals back into values.
                let a_lit = self.lifted.get(&a).cloned();
                let b_lit = self.lifted.get(&b).cloned();
                match (a_lit, b_lit) {
                    (None, Some(lit)) if !a.starts_with(VAR_PREFIX) => {
                        self.literal_predicate(a, operator, lit, false)
                    }
                    (Some(lit), None) if !b.starts_with(VAR_PREFIX) => {
                        self.literal_predicate(b, operator, lit, true)
                    }
                    (Some(_), Some(_)) => Predicate::opaque(describe(expr)),
                    _ => Predicate {
                        ident: a,
                        operator,
                        literal: Value::Null,
                        literal_ident: Some(b),
                    },
                }
            }
            (Some(a), None) => match right.as_ref() {
                Expr::Literal(lit) => self.literal_predicate(a, operator, lit.clone(), false),
                _ => Predicate::opaque(describe(expr)),
            },
            (None, Some(b)) => match left.as_ref() {
                Expr::Literal(lit) => self.literal_predicate(b, operator, lit.clone(), true),
                _ => Predicate::opaque(describe(expr)),
            },
            (None, None) => Predicate::opaque(describe(expr)),
        }
    }

    fn literal_predicate(
        &self,
        ident: String,
        mut operator: Operator,
        literal: Value,
        swapped: bool,
    ) -> Predicate {
        if swapped {
            operator = operator.normalize();
        }
        let orderable = matches!(literal, Value::Number(_) | Value::String(_));
        let ordering = matches!(
            operator,
            Operator::Lt | Operator::LtEq | Operator::Gt | Operator::GtEq
        );
        if ordering && !orderable {
            return Predicate::opaque(format!("{ident} {} {literal}", operator.as_str()));
        }
        if matches!(literal, Value::Array(_) | Value::Object(_)) {
            return Predicate::opaque(format!("{ident} {} {literal}", operator.as_str()));
        }
        Predicate {
            ident,
            operator,
            literal,
            literal_ident: None,
        }
    }
}

/// True when `expr` under `negated` behaves as `&&` (`want_and`) or `||`.
fn is_effective(expr: &Expr, negated: bool, want_and: bool) -> bool {
    match expr {
        Expr::And(..) => want_and != negated,
        Expr::Or(..) => want_and == negated,
        Expr::Not(inner) => is_effective(inner, !negated, want_and),
        _ => false,
    }
}

/// Collect the operands of a chain of effective `&&` (or `||`), pushing negation
/// through `!` and applying De Morgan.
fn flatten<'e>(expr: &'e Expr, negated: bool, want_and: bool, out: &mut Vec<(&'e Expr, bool)>) {
    match expr {
        Expr::Not(inner) if !inner.has_macros() => flatten(inner, !negated, want_and, out),
        Expr::And(a, b) | Expr::Or(a, b) if is_effective(expr, negated, want_and) => {
            flatten(a, negated, want_and, out);
            flatten(b, negated, want_and, out);
        }
        _ => out.push((expr, negated)),
    }
}

fn describe(expr: &Expr) -> String {
    match expr {
        Expr::Comprehension { range, kind, .. } => {
            format!("{kind:?}:{}", range.path().unwrap_or_default())
        }
        Expr::Call(name, _) => format!("call:{name}"),
        Expr::Method(target, name, _) => {
            format!("{}.{name}()", target.path().unwrap_or_default())
        }
        Expr::Has(target) => format!("has:{}", target.path().unwrap_or_default()),
        other => other.path().unwrap_or_else(|| "expr".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lift::lift_literals;
    use crate::parser::parse;
    use serde_json::json;

    fn parsed(src: &str) -> ParsedExpression {
        let lifted = lift_literals(src).unwrap();
        let ast = parse(&lifted.expression).unwrap();
        build(Ulid::from_parts(1, 42), &ast, lifted)
    }

    #[test]
    fn test_single_predicate_collapses() {
        let p = parsed("event.data.id == 'a'");
        let pred = p.root.predicate.as_ref().unwrap();
        assert_eq!(pred.ident, "event.data.id");
        assert_eq!(pred.operator, Operator::Eq);
        assert_eq!(pred.literal, json!("a"));
        assert_eq!(p.root.group_id.size(), 1);
        assert_eq!(p.root_groups().len(), 1);
    }

    #[test]
    fn test_and_chain_shares_group() {
        let p = parsed("a == 1 && b == 2 && c == 'x'");
        assert_eq!(p.root.ands.len(), 3);
        assert_eq!(p.root.group_id.size(), 3);
        for child in &p.root.ands {
            assert_eq!(child.group_id, p.root.group_id);
        }
    }

    #[test]
    fn test_root_ors_become_groups() {
        let p = parsed("a == 1 || b == 2 || (c == 3 && d == 4)");
        let groups = p.root_groups();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[2].ands.len(), 2);
        assert_eq!(groups[2].group_id.size(), 2);
    }

    #[test]
    fn test_and_with_or_counts_or_once() {
        let p = parsed("a == 1 && (b == 2 || c == 3)");
        assert_eq!(p.root.ands.len(), 1);
        assert_eq!(p.root.ors.len(), 2);
        assert_eq!(p.root.group_id.size(), 2);
        assert_eq!(p.root_groups().len(), 1);
    }

    #[test]
    fn test_negation_push_down() {
        let p = parsed("!(a == 'x')");
        assert_eq!(p.root.predicate.as_ref().unwrap().operator, Operator::NotEq);

        let p = parsed("!(a >= 5)");
        assert_eq!(p.root.predicate.as_ref().unwrap().operator, Operator::Lt);

        let p = parsed("!(a > 5)");
        assert_eq!(p.root.predicate.as_ref().unwrap().operator, Operator::LtEq);

        // De Morgan: !(a || b) == !a && !b
        let p = parsed("!(a == 1 || b == 2)");
        assert_eq!(p.root.ands.len(), 2);
        assert!(
            p.root
                .ands
                .iter()
                .all(|n| n.predicate.as_ref().unwrap().operator == Operator::NotEq)
        );

        // !(a && b) == !a || !b
        let p = parsed("!(a == 1 && b == 2)");
        assert_eq!(p.root_groups().len(), 2);

        // Double negation
        let p = parsed("!!(a == 1)");
        assert_eq!(p.root.predicate.as_ref().unwrap().operator, Operator::Eq);
    }

    #[test]
    fn test_negation_stops_at_macros() {
        let p = parsed("!items.exists(i, i == 1)");
        assert!(p.has_macros);
        assert_eq!(
            p.root.predicate.as_ref().unwrap().operator,
            Operator::Opaque
        );
    }

    #[test]
    fn test_literal_on_left_is_normalized() {
        let p = parsed("5 < a");
        let pred = p.root.predicate.as_ref().unwrap();
        assert_eq!(pred.ident, "a");
        assert_eq!(pred.operator, Operator::Gt);
        assert_eq!(pred.literal, json!(5));
    }

    #[test]
    fn test_two_idents() {
        let p = parsed("event.data.a == event.data.b");
        let pred = p.root.predicate.as_ref().unwrap();
        assert_eq!(pred.literal_ident.as_deref(), Some("event.data.b"));
    }

    #[test]
    fn test_neq_flag() {
        let p = parsed("a == 'x' && b == 'y' && c != 'z'");
        assert_eq!(p.root.group_id.flag(), 2);
        let p = parsed("a == 'x' && b == 'y'");
        assert_eq!(p.root.group_id.flag(), 0);
    }

    #[test]
    fn test_group_ids_are_deterministic() {
        let a = parsed("a == 1 && b == 2");
        let b = parsed("a == 1 && b == 2");
        assert_eq!(a.root.group_id, b.root.group_id);
        assert_eq!(a.root.group_id.to_bytes()[..2], [0, 2]);
    }

    #[test]
    fn test_unsupported_clauses_are_opaque() {
        let p = parsed("size(event.data.items) > 2 && event.name.startsWith('a')");
        assert!(
            p.root
                .ands
                .iter()
                .all(|n| n.predicate.as_ref().unwrap().operator == Operator::Opaque)
        );
    }
}
