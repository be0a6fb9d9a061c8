// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tree-walking evaluator over `serde_json::Value`.
//!
//! Semantics follow CEL where it matters for matching:
//!
//! - Selecting a missing field yields `null` rather than an error, so
//!   `event.data.missing == null` is true.
//! - `==` / `!=` are defined for every pair of values; numbers compare by value
//!   regardless of int/float representation, all other cross-type pairs are unequal.
//! - Ordering operators between incompatible types are an error.
//! - `&&` and `||` absorb errors when the other side decides the result
//!   (`false && <error>` is `false`, `true || <error>` is `true`).
//! - A top-level error is treated as "no match" by callers.

use std::cmp::Ordering;

use serde_json::{Map, Number, Value};

use crate::ast::{BinaryOp, Expr, Macro};
use crate::error::{ExprError, Result};
use crate::lift::VAR_PREFIX;

/// Evaluate `expr` against `input`, whose top-level keys are the root identifiers.
pub fn evaluate(expr: &Expr, input: &Value) -> Result<Value> {
    evaluate_with_vars(expr, input, None)
}

/// Evaluate with lifted literals available under the `vars` root identifier.
pub fn evaluate_with_vars(expr: &Expr, input: &Value, vars: Option<&Value>) -> Result<Value> {
    let mut scope = Scope {
        root: input,
        vars,
        locals: Vec::new(),
    };
    scope.eval(expr)
}

/// Evaluate `expr` and require a boolean result.
pub fn evaluate_bool(expr: &Expr, input: &Value) -> Result<bool> {
    match evaluate(expr, input)? {
        Value::Bool(b) => Ok(b),
        other => Err(ExprError::eval(format!(
            "expression returned {} instead of bool",
            type_name(&other)
        ))),
    }
}

struct Scope<'a> {
    root: &'a Value,
    vars: Option<&'a Value>,
    locals: Vec<(String, Value)>,
}

impl Scope<'_> {
    fn lookup(&self, name: &str) -> Option<&Value> {
        if let Some((_, v)) = self.locals.iter().rev().find(|(n, _)| n == name) {
            return Some(v);
        }
        if name == VAR_PREFIX
            && let Some(vars) = self.vars
        {
            return Some(vars);
        }
        self.root.get(name)
    }

    /// Borrow the value at a static select/index path without cloning intermediate
    /// objects. The outer `None` means `expr` is not a static path.
    fn borrow_path(&self, expr: &Expr) -> Option<Option<&Value>> {
        match expr {
            Expr::Ident(name) => Some(self.lookup(name)),
            Expr::Member(target, field) => {
                let target = self.borrow_path(target)?;
                Some(target.and_then(|t| t.as_object()).and_then(|m| m.get(field)))
            }
            Expr::Index(target, index) => {
                let Expr::Literal(index) = index.as_ref() else {
                    return None;
                };
                let target = self.borrow_path(target)?;
                Some(target.and_then(|t| match (t, index) {
                    (Value::Array(items), Value::Number(n)) => {
                        n.as_u64().and_then(|i| items.get(i as usize))
                    }
                    (Value::Object(map), Value::String(key)) => map.get(key),
                    _ => None,
                }))
            }
            _ => None,
        }
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Ident(_) | Expr::Member(..) | Expr::Index(..) => {
                if let Some(found) = self.borrow_path(expr) {
                    return Ok(found.cloned().unwrap_or(Value::Null));
                }
                match expr {
                    Expr::Member(target, field) => {
                        let target = self.eval(target)?;
                        Ok(select(&target, field))
                    }
                    Expr::Index(target, index) => {
                        let target = self.eval(target)?;
                        let index = self.eval(index)?;
                        Ok(index_value(&target, &index))
                    }
                    _ => Ok(Value::Null),
                }
            }
            Expr::Not(inner) => match self.eval(inner)? {
                Value::Bool(b) => Ok(Value::Bool(!b)),
                other => Err(no_overload("!", &other, None)),
            },
            Expr::Neg(inner) => {
                let value = self.eval(inner)?;
                match &value {
                    Value::Number(n) => {
                        if let Some(i) = n.as_i64() {
                            i.checked_neg()
                                .map(Value::from)
                                .ok_or_else(|| ExprError::eval("integer overflow"))
                        } else {
                            float(-n.as_f64().unwrap_or_default())
                        }
                    }
                    _ => Err(no_overload("-", &value, None)),
                }
            }
            Expr::And(left, right) => self.logical(left, right, false),
            Expr::Or(left, right) => self.logical(left, right, true),
            Expr::Binary(op, left, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                binary(*op, &left, &right)
            }
            Expr::Ternary(cond, then, otherwise) => match self.eval(cond)? {
                Value::Bool(true) => self.eval(then),
                Value::Bool(false) => self.eval(otherwise),
                other => Err(no_overload("?:", &other, None)),
            },
            Expr::List(items) => items
                .iter()
                .map(|item| self.eval(item))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Expr::Map(entries) => {
                let mut map = Map::new();
                for (key, value) in entries {
                    let key = match self.eval(key)? {
                        Value::String(s) => s,
                        Value::Number(n) => n.to_string(),
                        Value::Bool(b) => b.to_string(),
                        other => {
                            return Err(ExprError::eval(format!(
                                "unsupported map key type {}",
                                type_name(&other)
                            )));
                        }
                    };
                    let value = self.eval(value)?;
                    map.insert(key, value);
                }
                Ok(Value::Object(map))
            }
            Expr::Has(target) => match target.as_ref() {
                Expr::Member(operand, field) => {
                    let operand = self.eval(operand)?;
                    Ok(Value::Bool(
                        operand.as_object().is_some_and(|m| m.contains_key(field)),
                    ))
                }
                _ => Err(ExprError::eval("has() requires a field selection")),
            },
            Expr::Call(name, args) => {
                let args = args
                    .iter()
                    .map(|a| self.eval(a))
                    .collect::<Result<Vec<_>>>()?;
                call_function(name, None, &args)
            }
            Expr::Method(target, name, args) => {
                let target = self.eval(target)?;
                let args = args
                    .iter()
                    .map(|a| self.eval(a))
                    .collect::<Result<Vec<_>>>()?;
                call_function(name, Some(&target), &args)
            }
            Expr::Comprehension {
                kind,
                range,
                var,
                body,
            } => {
                let range = self.eval(range)?;
                self.comprehension(*kind, &range, var, body)
            }
        }
    }

    /// `&&` (`is_or == false`) and `||` (`is_or == true`) with error absorption.
    fn logical(&mut self, left: &Expr, right: &Expr, is_or: bool) -> Result<Value> {
        let short = is_or;
        let left = self.eval(left).and_then(|v| as_bool(v, if is_or { "||" } else { "&&" }));
        if let Ok(b) = left
            && b == short
        {
            return Ok(Value::Bool(short));
        }
        let right = self
            .eval(right)
            .and_then(|v| as_bool(v, if is_or { "||" } else { "&&" }));
        match (left, right) {
            (_, Ok(b)) if b == short => Ok(Value::Bool(short)),
            (Ok(_), Ok(_)) => Ok(Value::Bool(!short)),
            (Err(e), _) | (_, Err(e)) => Err(e),
        }
    }

    fn comprehension(&mut self, kind: Macro, range: &Value, var: &str, body: &Expr) -> Result<Value> {
        let items: Vec<Value> = match range {
            Value::Array(items) => items.clone(),
            Value::Object(map) => map.keys().cloned().map(Value::String).collect(),
            Value::Null => Vec::new(),
            other => return Err(no_overload("comprehension", other, None)),
        };

        let mut results = Vec::with_capacity(items.len());
        for item in items {
            self.locals.push((var.to_string(), item.clone()));
            let outcome = self.eval(body);
            self.locals.pop();
            results.push((item, outcome));
        }

        match kind {
            Macro::All => {
                let mut error = None;
                for (_, outcome) in results {
                    match outcome.and_then(|v| as_bool(v, "all")) {
                        Ok(false) => return Ok(Value::Bool(false)),
                        Ok(true) => {}
                        Err(e) => error = Some(e),
                    }
                }
                error.map_or(Ok(Value::Bool(true)), Err)
            }
            Macro::Exists => {
                let mut error = None;
                for (_, outcome) in results {
                    match outcome.and_then(|v| as_bool(v, "exists")) {
                        Ok(true) => return Ok(Value::Bool(true)),
                        Ok(false) => {}
                        Err(e) => error = Some(e),
                    }
                }
                error.map_or(Ok(Value::Bool(false)), Err)
            }
            Macro::ExistsOne => {
                let mut count = 0;
                for (_, outcome) in results {
                    if outcome.and_then(|v| as_bool(v, "exists_one"))? {
                        count += 1;
                    }
                }
                Ok(Value::Bool(count == 1))
            }
            Macro::Map => results
                .into_iter()
                .map(|(_, outcome)| outcome)
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Macro::Filter => {
                let mut kept = Vec::new();
                for (item, outcome) in results {
                    if outcome.and_then(|v| as_bool(v, "filter"))? {
                        kept.push(item);
                    }
                }
                Ok(Value::Array(kept))
            }
        }
    }
}

fn as_bool(value: Value, op: &str) -> Result<bool> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(no_overload(op, &other, None)),
    }
}

fn select(target: &Value, field: &str) -> Value {
    match target {
        Value::Object(map) => map.get(field).cloned().unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn index_value(target: &Value, index: &Value) -> Value {
    match (target, index) {
        (Value::Array(items), Value::Number(n)) => n
            .as_u64()
            .and_then(|i| items.get(i as usize))
            .cloned()
            .unwrap_or(Value::Null),
        (Value::Object(map), Value::String(key)) => map.get(key).cloned().unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn float(f: f64) -> Result<Value> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| ExprError::eval("non-finite float result"))
}

/// Equality shared by the evaluator and the matching engines.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(l), Value::Bool(r)) => l == r,
        (Value::Number(l), Value::Number(r)) => match (l.as_i64(), r.as_i64()) {
            (Some(l), Some(r)) => l == r,
            _ => l.as_f64() == r.as_f64(),
        },
        (Value::String(l), Value::String(r)) => l == r,
        (Value::Array(l), Value::Array(r)) => {
            l.len() == r.len() && l.iter().zip(r.iter()).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(l), Value::Object(r)) => {
            l.len() == r.len()
                && l
                    .iter()
                    .all(|(k, v)| r.get(k).is_some_and(|rv| values_equal(v, rv)))
        }
        _ => false,
    }
}

/// Ordering for comparable pairs; `None` when the types have no ordering overload.
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => match (l.as_i64(), r.as_i64()) {
            (Some(l), Some(r)) => Some(l.cmp(&r)),
            _ => l.as_f64()?.partial_cmp(&r.as_f64()?),
        },
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        (Value::Bool(l), Value::Bool(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(left, right))),
        BinaryOp::NotEq => Ok(Value::Bool(!values_equal(left, right))),
        BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
            let ordering = compare_values(left, right)
                .ok_or_else(|| no_overload(op.as_str(), left, Some(right)))?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::LtEq => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }))
        }
        BinaryOp::In => match right {
            Value::Array(items) => Ok(Value::Bool(items.iter().any(|i| values_equal(left, i)))),
            Value::Object(map) => match left {
                Value::String(key) => Ok(Value::Bool(map.contains_key(key))),
                _ => Ok(Value::Bool(false)),
            },
            _ => Err(no_overload("in", left, Some(right))),
        },
        BinaryOp::Add => match (left, right) {
            (Value::String(l), Value::String(r)) => Ok(Value::String(format!("{l}{r}"))),
            (Value::Array(l), Value::Array(r)) => {
                Ok(Value::Array(l.iter().chain(r.iter()).cloned().collect()))
            }
            (Value::Number(l), Value::Number(r)) => {
                arithmetic(l, r, i64::checked_add, |a, b| a + b, "+")
            }
            _ => Err(no_overload("+", left, Some(right))),
        },
        BinaryOp::Sub => numeric(left, right, i64::checked_sub, |a, b| a - b, "-"),
        BinaryOp::Mul => numeric(left, right, i64::checked_mul, |a, b| a * b, "*"),
        BinaryOp::Div => {
            if let (Some(_), Some(0)) = (left.as_i64(), right.as_i64()) {
                return Err(ExprError::eval("division by zero"));
            }
            numeric(left, right, i64::checked_div, |a, b| a / b, "/")
        }
        BinaryOp::Rem => {
            if let (Some(_), Some(0)) = (left.as_i64(), right.as_i64()) {
                return Err(ExprError::eval("modulus by zero"));
            }
            numeric(left, right, i64::checked_rem, |a, b| a % b, "%")
        }
    }
}

fn numeric(
    left: &Value,
    right: &Value,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
    name: &str,
) -> Result<Value> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => arithmetic(l, r, int_op, float_op, name),
        _ => Err(no_overload(name, left, Some(right))),
    }
}

fn arithmetic(
    l: &Number,
    r: &Number,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
    name: &str,
) -> Result<Value> {
    if let (Some(a), Some(b)) = (l.as_i64(), r.as_i64()) {
        return int_op(a, b)
            .map(Value::from)
            .ok_or_else(|| ExprError::eval(format!("integer overflow in '{name}'")));
    }
    match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) => float(float_op(a, b)),
        _ => Err(ExprError::eval(format!("invalid operands for '{name}'"))),
    }
}

fn call_function(name: &str, target: Option<&Value>, args: &[Value]) -> Result<Value> {
    // Receiver and global call forms are interchangeable: `size(x)` == `x.size()`.
    let mut all: Vec<&Value> = Vec::with_capacity(args.len() + 1);
    if let Some(t) = target {
        all.push(t);
    }
    all.extend(args.iter());

    match (name, all.as_slice()) {
        ("size", [v]) => match v {
            Value::String(s) => Ok(Value::from(s.chars().count() as i64)),
            Value::Array(a) => Ok(Value::from(a.len() as i64)),
            Value::Object(m) => Ok(Value::from(m.len() as i64)),
            other => Err(no_overload("size", other, None)),
        },
        ("contains", [Value::String(s), Value::String(sub)]) => {
            Ok(Value::Bool(s.contains(sub.as_str())))
        }
        ("startsWith", [Value::String(s), Value::String(p)]) => {
            Ok(Value::Bool(s.starts_with(p.as_str())))
        }
        ("endsWith", [Value::String(s), Value::String(p)]) => {
            Ok(Value::Bool(s.ends_with(p.as_str())))
        }
        ("lowerAscii", [Value::String(s)]) => Ok(Value::String(s.to_ascii_lowercase())),
        ("upperAscii", [Value::String(s)]) => Ok(Value::String(s.to_ascii_uppercase())),
        ("trim", [Value::String(s)]) => Ok(Value::String(s.trim().to_string())),
        ("int", [v]) => match v {
            Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(Value::from(i)),
                None => Ok(Value::from(n.as_f64().unwrap_or_default().trunc() as i64)),
            },
            Value::String(s) => s
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| ExprError::eval(format!("cannot convert '{s}' to int"))),
            Value::Bool(b) => Ok(Value::from(i64::from(*b))),
            other => Err(no_overload("int", other, None)),
        },
        ("double", [v]) => match v {
            Value::Number(n) => float(n.as_f64().unwrap_or_default()),
            Value::String(s) => s
                .parse::<f64>()
                .map_err(|_| ExprError::eval(format!("cannot convert '{s}' to double")))
                .and_then(float),
            other => Err(no_overload("double", other, None)),
        },
        ("string", [v]) => match v {
            Value::String(s) => Ok(Value::String(s.clone())),
            Value::Null => Ok(Value::String("null".to_string())),
            other => Ok(Value::String(other.to_string())),
        },
        ("type", [v]) => Ok(Value::String(type_name(v).to_string())),
        _ => Err(ExprError::eval(format!(
            "no matching overload for {name}/{}",
            all.len()
        ))),
    }
}

/// CEL-style type name for error messages and `type()`.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null_type",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "double",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

fn no_overload(op: &str, left: &Value, right: Option<&Value>) -> ExprError {
    match right {
        Some(r) => ExprError::eval(format!(
            "no matching overload for '{op}' on ({}, {})",
            type_name(left),
            type_name(r)
        )),
        None => ExprError::eval(format!(
            "no matching overload for '{op}' on {}",
            type_name(left)
        )),
    }
}
