// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process index of live event pauses.
//!
//! One aggregate evaluator per `(env_id, event_name)`. Expressions see the
//! incoming event as both `event` and `async`; references into the run's own
//! trigger event were replaced by literals when the pause was created.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::{Value, json};
use steadfast_expr::{AggregateEvaluator, Classification, Compiler, interpolate};
use tracing::{debug, warn};

use crate::error::{Component, CoreError, Result};
use crate::id::{EnvId, PauseId};
use crate::pause::Pause;

/// Rewrite a wait expression so it only references the incoming event.
///
/// Expressions written against `async.*` use `event.*` for the run's trigger
/// event; otherwise the trigger is reached through `ctx.event.*`. Either way
/// those references become literals taken from `trigger`.
pub fn interpolate_wait_expression(expression: &str, trigger: &Value) -> Result<String> {
    let prefix: &[&str] = if expression.contains("async.") {
        &["event"]
    } else {
        &["ctx", "event"]
    };
    interpolate(expression, prefix, trigger)
        .map_err(|e| CoreError::compilation(Component::Matcher, e))
}

/// The input an event is matched with.
pub fn activation(event: &Value) -> Value {
    json!({ "event": event, "async": event })
}

type Key = (EnvId, String);

/// Expression index over pauses waiting for events.
#[derive(Debug)]
pub struct PauseIndex {
    compiler: Arc<Compiler>,
    concurrency: usize,
    evaluators: RwLock<HashMap<Key, Arc<AggregateEvaluator<Pause>>>>,
}

impl PauseIndex {
    pub fn new(compiler: Arc<Compiler>, concurrency: usize) -> Self {
        Self {
            compiler,
            concurrency: concurrency.max(1),
            evaluators: RwLock::default(),
        }
    }

    /// Index a pause. Pauses without an event name are not indexed.
    ///
    /// The map lock is held across the insert so a concurrent `remove` cannot
    /// drop the evaluator between lookup and insert.
    pub fn add(&self, pause: Pause) -> Result<Option<Classification>> {
        let Some(name) = pause.event_name.clone() else {
            return Ok(None);
        };
        let key = (pause.env_id, name);
        let pause_id = pause.id;
        let mut map = self
            .evaluators
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let evaluator = map.entry(key.clone()).or_insert_with(|| {
            Arc::new(AggregateEvaluator::new(
                self.compiler.clone(),
                self.concurrency,
            ))
        });
        let added = evaluator.add(pause);
        if added.is_err() && evaluator.is_empty() {
            map.remove(&key);
        }
        let classification = added.map_err(|e| CoreError::compilation(Component::Matcher, e))?;
        debug!(pause_id = %pause_id, ?classification, "Pause indexed");
        Ok(Some(classification))
    }

    /// Drop a pause from the index. Unknown pauses are ignored: the pause may
    /// have been consumed through another path already.
    pub fn remove(&self, env_id: EnvId, event_name: &str, pause_id: PauseId) {
        let key = (env_id, event_name.to_string());
        let mut map = self
            .evaluators
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(evaluator) = map.get(&key) {
            if evaluator.remove(pause_id.as_ulid()).is_err() {
                debug!(pause_id = %pause_id, "Pause was not indexed");
            }
            if evaluator.is_empty() {
                map.remove(&key);
            }
        }
    }

    pub fn remove_pause(&self, pause: &Pause) {
        if let Some(name) = &pause.event_name {
            self.remove(pause.env_id, name, pause.id);
        }
    }

    /// Pauses in `env_id` waiting for `event_name` whose expression `event` satisfies.
    pub fn matches(&self, env_id: EnvId, event_name: &str, event: &Value) -> Vec<Arc<Pause>> {
        let evaluator = {
            let map = self
                .evaluators
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            match map.get(&(env_id, event_name.to_string())) {
                Some(e) => e.clone(),
                None => return Vec::new(),
            }
        };
        let found = evaluator.evaluate(&activation(event));
        if found.errors > 0 {
            warn!(
                event_name,
                errors = found.errors,
                "Pause expressions failed to evaluate"
            );
        }
        debug!(
            event_name,
            matched = found.matched.len(),
            evaluated = found.evaluated,
            "Pause match"
        );
        found.matched
    }

    /// Number of indexed pauses.
    pub fn len(&self) -> usize {
        self.evaluators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|e| e.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
