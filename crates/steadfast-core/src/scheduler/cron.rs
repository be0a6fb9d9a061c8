// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cron trigger scheduler.
//!
//! Keeps the next fire time of every `(function, cron)` pair. A pair seen for
//! the first time is only scheduled, so syncing a function never fires a
//! backlog of missed ticks. Once a fire time passes the function is started
//! and the next occurrence is computed from the current time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use croner::Cron;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::{Component, CoreError, Result};
use crate::id::FunctionId;
use crate::lifecycle::Lifecycle;

#[derive(Debug, Clone)]
pub struct CronSchedulerConfig {
    pub poll_interval: Duration,
}

impl Default for CronSchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
        }
    }
}

type CronKey = (FunctionId, String);

pub struct CronScheduler {
    lifecycle: Arc<Lifecycle>,
    config: CronSchedulerConfig,
    next: Mutex<HashMap<CronKey, DateTime<Utc>>>,
    shutdown: Arc<Notify>,
}

/// Next occurrence of `expr` strictly after `after`.
pub fn next_occurrence(expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let cron = Cron::new(expr)
        .parse()
        .map_err(|e| CoreError::validation(Component::Lifecycle, format!("invalid cron {expr:?}: {e}")))?;
    cron.find_next_occurrence(&after, false)
        .map_err(|e| CoreError::validation(Component::Lifecycle, format!("no next occurrence for {expr:?}: {e}")))
}

impl CronScheduler {
    pub fn new(lifecycle: Arc<Lifecycle>, config: CronSchedulerConfig) -> Self {
        Self {
            lifecycle,
            config,
            next: Mutex::new(HashMap::new()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub async fn run(self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Cron scheduler started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Cron scheduler shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Cron tick failed");
                    }
                }
            }
        }
    }

    /// Fire every due cron and schedule the ones not yet tracked. Returns
    /// the number of runs fired.
    pub async fn tick(&self) -> Result<usize> {
        let now = self.lifecycle.clock().now();
        let functions = self.lifecycle.registry().all();

        let mut due = Vec::new();
        {
            let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
            let live: Vec<CronKey> = functions
                .iter()
                .flat_map(|f| f.config.crons().map(|c| (f.id, c.to_string())))
                .collect();
            next.retain(|key, _| live.contains(key));

            for function in &functions {
                for cron in function.config.crons() {
                    let key = (function.id, cron.to_string());
                    match next.get(&key) {
                        Some(at) if *at <= now => due.push((function.clone(), cron.to_string(), *at)),
                        Some(_) => {}
                        None => match next_occurrence(cron, now) {
                            Ok(at) => {
                                debug!(fn_id = %function.id, cron, next = %at, "Cron scheduled");
                                next.insert(key, at);
                            }
                            Err(e) => warn!(fn_id = %function.id, cron, error = %e, "Skipping cron"),
                        },
                    }
                }
            }
        }

        let mut fired = 0;
        for (function, cron, at) in due {
            let result = self.lifecycle.fire_cron(&function, &cron, at).await;
            let following = next_occurrence(&cron, now)?;
            self.next
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert((function.id, cron.clone()), following);
            match result {
                Ok(scheduled) => {
                    debug!(fn_id = %function.id, cron, ?scheduled, "Cron fired");
                    fired += 1;
                }
                Err(e) => error!(fn_id = %function.id, cron, error = %e, "Failed to fire cron"),
            }
        }
        Ok(fired)
    }

    /// Next fire time of a tracked cron.
    pub fn next_fire(&self, function_id: FunctionId, cron: &str) -> Option<DateTime<Utc>> {
        self.next
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(function_id, cron.to_string()))
            .copied()
    }
}
