// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bulk cancellation rules and the checker consulted before every dispatch.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use steadfast_expr::Compiler;
use tracing::warn;

use crate::error::{Component, CoreError, Result};
use crate::id::{CancellationId, EnvId, FunctionId, RunId};

/// Cancel every run of a function started inside `[started_after, started_before]`
/// whose trigger event satisfies `if`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cancellation {
    pub id: CancellationId,
    pub env_id: EnvId,
    pub function_id: FunctionId,
    #[serde(default, rename = "if", skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_after: Option<DateTime<Utc>>,
    pub started_before: DateTime<Utc>,
}

impl Cancellation {
    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        at <= self.started_before && self.started_after.is_none_or(|after| at >= after)
    }
}

/// Interval index of cancellation rules keyed by `(env_id, function_id)`.
///
/// Rules for a key are kept sorted by `started_before`, so a lookup skips every
/// rule that ended before the run started.
#[derive(Debug)]
pub struct CancellationChecker {
    compiler: Arc<Compiler>,
    rules: RwLock<HashMap<(EnvId, FunctionId), Vec<Cancellation>>>,
}

impl CancellationChecker {
    pub fn new(compiler: Arc<Compiler>) -> Self {
        Self {
            compiler,
            rules: RwLock::default(),
        }
    }

    /// Register a rule; its expression must compile.
    pub fn add(&self, rule: Cancellation) -> Result<()> {
        if let Some(expr) = &rule.expression {
            self.compiler
                .compile(expr)
                .map_err(|e| CoreError::compilation(Component::Lifecycle, e))?;
        }
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let list = rules.entry((rule.env_id, rule.function_id)).or_default();
        list.retain(|r| r.id != rule.id);
        let at = list.partition_point(|r| r.started_before < rule.started_before);
        list.insert(at, rule);
        Ok(())
    }

    pub fn remove(&self, id: CancellationId) -> bool {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        rules.retain(|_, list| {
            let before = list.len();
            list.retain(|r| r.id != id);
            removed |= list.len() != before;
            !list.is_empty()
        });
        removed
    }

    /// The first rule that cancels `run_id`, if any.
    ///
    /// The run's start time is read from its id. Rules whose expression fails
    /// to evaluate do not match.
    pub fn check(
        &self,
        env_id: EnvId,
        function_id: FunctionId,
        run_id: RunId,
        trigger: Option<&Value>,
    ) -> Option<CancellationId> {
        let started = run_id.created_at();
        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        let list = rules.get(&(env_id, function_id))?;
        let from = list.partition_point(|r| r.started_before < started);

        list[from..]
            .iter()
            .filter(|r| r.covers(started))
            .find(|r| match &r.expression {
                None => true,
                Some(expr) => self.expression_matches(expr, trigger),
            })
            .map(|r| r.id)
    }

    fn expression_matches(&self, expression: &str, trigger: Option<&Value>) -> bool {
        let Ok(program) = self.compiler.compile(expression) else {
            return false;
        };
        let input = json!({ "event": trigger.cloned().unwrap_or(Value::Null) });
        match program.matches(&input) {
            Ok(matched) => matched,
            Err(e) => {
                warn!(expression, error = %e, "Cancellation expression failed");
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
