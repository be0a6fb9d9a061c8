// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Compilation with a parse cache keyed by the lifted expression.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use ulid::Ulid;

use crate::ast::Expr;
use crate::error::{ExprError, Result};
use crate::eval::{evaluate_with_vars, type_name};
use crate::lift::{Lifted, lift_literals};
use crate::parser::parse;
use crate::tree::{self, ParsedExpression};

/// Upper bound on cached ASTs before the cache is reset.
const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// A compiled expression: its lifted form plus the shared AST.
#[derive(Debug, Clone)]
pub struct Program {
    lifted: Lifted,
    vars: Value,
    ast: Arc<Expr>,
}

impl Program {
    pub fn lifted(&self) -> &Lifted {
        &self.lifted
    }

    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    /// Evaluate against an activation whose top-level keys are root idents.
    pub fn evaluate(&self, input: &Value) -> Result<Value> {
        evaluate_with_vars(&self.ast, input, Some(&self.vars))
    }

    /// Evaluate and require a boolean.
    pub fn matches(&self, input: &Value) -> Result<bool> {
        match self.evaluate(input)? {
            Value::Bool(b) => Ok(b),
            other => Err(ExprError::eval(format!(
                "expression returned {} instead of bool",
                type_name(&other)
            ))),
        }
    }

    /// Build the predicate tree for an evaluable backed by this program.
    pub fn predicate_tree(&self, evaluable_id: Ulid) -> ParsedExpression {
        tree::build(evaluable_id, &self.ast, self.lifted.clone())
    }
}

/// Compiles expressions, sharing ASTs between expressions that differ only in
/// their literals.
#[derive(Debug)]
pub struct Compiler {
    cache: Mutex<HashMap<String, Arc<Expr>>>,
    capacity: usize,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }
}

impl Compiler {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn compile(&self, expression: &str) -> Result<Program> {
        let lifted = lift_literals(expression)?;
        let ast = self.parse_cached(&lifted.expression)?;
        let vars = Value::Object(lifted.vars.clone());
        Ok(Program { lifted, vars, ast })
    }

    /// Number of cached ASTs.
    pub fn cached(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn parse_cached(&self, source: &str) -> Result<Arc<Expr>> {
        if let Some(ast) = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(source)
        {
            return Ok(Arc::clone(ast));
        }

        let ast = Arc::new(parse(source)?);
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if cache.len() >= self.capacity {
            tracing::debug!(entries = cache.len(), "expression cache full, resetting");
            cache.clear();
        }
        cache.insert(source.to_string(), Arc::clone(&ast));
        Ok(ast)
    }
}
