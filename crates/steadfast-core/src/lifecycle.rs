// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run lifecycle.
//!
//! The lifecycle ties the components together:
//!
//! - an ingested event resumes matching pauses, then schedules runs of every
//!   function it triggers, applying rate limit, debounce, batching, singleton
//!   and priority rules on the way into the queue
//! - a dispatched queue item is checked against cancellation rules, handed to
//!   the executor, and the executor's follow-ups are applied
//! - a run reaching a terminal status releases everything it held and
//!   resumes an invoking parent
//!
//! Scheduling decisions are serialized by one async lock so that debounce,
//! batch and singleton buckets never see interleaved updates.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use steadfast_expr::Compiler;
use tracing::{debug, info, instrument, warn};

use crate::cancel::{Cancellation, CancellationChecker};
use crate::clock::Clock;
use crate::error::{Component, CoreError, Result};
use crate::event::{Event, FN_INVOKED, SCHEDULED_TIMER};
use crate::executor::{Disposition, Executor, FollowUp};
use crate::function::{
    ConcurrencyScope, Function, FunctionConfig, FunctionRegistry, SingletonMode, evaluate_key,
    evaluate_priority,
};
use crate::id::{BatchId, CancellationId, EnvId, EventId, FunctionId, PauseId, QueueItemId, RunId};
use crate::matcher::{PauseIndex, interpolate_wait_expression};
use crate::opcode::{OpcodeKind, StepFailure};
use crate::pause::{Pause, PauseKind, PauseStore};
use crate::queue::{ConcurrencyKey, ItemKind, Queue, QueueItem, Rate, ThrottleKey};
use crate::run::{InvokedBy, Run, RunFilter, RunStatus, StatusUpdate};
use crate::state::StateStore;

/// Payload field of a queue item that fires a pause timeout.
pub const TIMEOUT_FOR: &str = "timeout_for";

/// Cancel rules without a timeout stay armed this long.
const DEFAULT_CANCEL_TIMEOUT_DAYS: i64 = 365;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    RateLimited,
    Singleton,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited => f.write_str("rate limited"),
            Self::Singleton => f.write_str("singleton run in progress"),
        }
    }
}

/// What scheduling did with a trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Scheduled {
    Started { run_id: RunId },
    /// A run was recorded as skipped and never queued.
    Skipped { run_id: RunId, reason: SkipReason },
    /// The event replaced the trigger of a pending debounced run.
    Debounced { run_id: RunId },
    /// The event was buffered into a batch.
    Batched { batch_id: BatchId },
}

impl Scheduled {
    pub fn run_id(&self) -> Option<RunId> {
        match self {
            Self::Started { run_id } | Self::Skipped { run_id, .. } | Self::Debounced { run_id } => {
                Some(*run_id)
            }
            Self::Batched { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    /// Use this id for the new run instead of generating one.
    pub run_id: Option<RunId>,
    pub cron: Option<String>,
    pub invoked_by: Option<InvokedBy>,
}

impl ScheduleOptions {
    /// Debounce and batching only apply to runs triggered by plain events.
    fn from_event(&self) -> bool {
        self.cron.is_none() && self.invoked_by.is_none()
    }
}

/// Result of ingesting one event.
#[derive(Debug, Clone, Serialize)]
pub struct IngestResult {
    pub event_id: EventId,
    pub runs: Vec<Scheduled>,
    /// Pauses the event resumed.
    pub resumed: Vec<PauseId>,
    /// Runs the event cancelled through a cancel rule.
    pub cancelled: Vec<RunId>,
}

/// What `recover` rebuilt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Recovery {
    pub pauses: usize,
    pub cancellations: usize,
    pub runs: usize,
}

#[derive(Debug, Clone)]
struct DebounceBucket {
    run_id: RunId,
    item_id: QueueItemId,
    first_at: DateTime<Utc>,
    /// Latest start allowed by the debounce timeout.
    deadline: Option<DateTime<Utc>>,
}

impl DebounceBucket {
    fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_none_or(|d| d > now)
    }
}

#[derive(Debug)]
struct BatchBuffer {
    id: BatchId,
    function: Arc<Function>,
    events: Vec<Event>,
    opened_at: DateTime<Utc>,
    timeout: Duration,
}

#[derive(Debug, Default)]
struct Buckets {
    debounces: HashMap<(FunctionId, String), DebounceBucket>,
    /// Singleton key to the run holding it.
    singletons: HashMap<String, RunId>,
    batches: HashMap<(FunctionId, String), BatchBuffer>,
}

/// The components a lifecycle drives.
pub struct LifecycleParts {
    pub registry: Arc<FunctionRegistry>,
    pub state: Arc<dyn StateStore>,
    pub pauses: Arc<dyn PauseStore>,
    pub queue: Arc<Queue>,
    pub executor: Arc<Executor>,
    pub clock: Arc<dyn Clock>,
    /// Fan-out bound of the pause matcher.
    pub matcher_concurrency: usize,
}

pub struct Lifecycle {
    compiler: Arc<Compiler>,
    registry: Arc<FunctionRegistry>,
    state: Arc<dyn StateStore>,
    pauses: Arc<dyn PauseStore>,
    index: Arc<PauseIndex>,
    queue: Arc<Queue>,
    executor: Arc<Executor>,
    cancellations: Arc<CancellationChecker>,
    clock: Arc<dyn Clock>,
    buckets: Mutex<Buckets>,
    schedule_lock: tokio::sync::Mutex<()>,
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("indexed_pauses", &self.index.len())
            .field("cancellation_rules", &self.cancellations.len())
            .finish_non_exhaustive()
    }
}

impl Lifecycle {
    pub fn new(parts: LifecycleParts) -> Self {
        let compiler = parts.registry.compiler().clone();
        Self {
            index: Arc::new(PauseIndex::new(compiler.clone(), parts.matcher_concurrency)),
            cancellations: Arc::new(CancellationChecker::new(compiler.clone())),
            compiler,
            registry: parts.registry,
            state: parts.state,
            pauses: parts.pauses,
            queue: parts.queue,
            executor: parts.executor,
            clock: parts.clock,
            buckets: Mutex::default(),
            schedule_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    pub fn state(&self) -> &Arc<dyn StateStore> {
        &self.state
    }

    pub fn pauses(&self) -> &Arc<dyn PauseStore> {
        &self.pauses
    }

    pub fn index(&self) -> &Arc<PauseIndex> {
        &self.index
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    pub fn cancellations(&self) -> &Arc<CancellationChecker> {
        &self.cancellations
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn buckets(&self) -> MutexGuard<'_, Buckets> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register function definitions for `env_id`.
    pub fn sync_functions(
        &self,
        env_id: EnvId,
        configs: Vec<FunctionConfig>,
    ) -> Result<Vec<Arc<Function>>> {
        let now = self.clock.now();
        configs
            .into_iter()
            .map(|config| self.registry.sync(env_id, config, now))
            .collect()
    }

    /// Persist an event, resume the pauses it matches and schedule the runs it
    /// triggers.
    #[instrument(skip(self, event), fields(event_id = %event.internal_id, name = %event.name))]
    pub async fn ingest(&self, event: Event) -> Result<IngestResult> {
        self.state.save_event(&event).await?;
        let value = event.to_value();
        let mut result = IngestResult {
            event_id: event.internal_id,
            runs: Vec::new(),
            resumed: Vec::new(),
            cancelled: Vec::new(),
        };

        for candidate in self.index.matches(event.env_id, &event.name, &value) {
            let Some(pause) = self.pauses.consume(candidate.id).await? else {
                debug!(pause_id = %candidate.id, "Pause already consumed");
                continue;
            };
            if pause.kind == PauseKind::Cancel {
                self.index.remove_pause(&pause);
                if self.cancel_if_active(pause.run_id).await? {
                    result.cancelled.push(pause.run_id);
                }
            } else if self.resume_pause(&pause, value.clone()).await? {
                result.resumed.push(pause.id);
            }
        }

        for function in self.registry.triggered_by(event.env_id, &event.name) {
            if !self.trigger_matches(&function, &event.name, &value) {
                continue;
            }
            let scheduled = self
                .schedule_run(&function, &event, ScheduleOptions::default())
                .await?;
            result.runs.push(scheduled);
        }

        info!(
            runs = result.runs.len(),
            resumed = result.resumed.len(),
            cancelled = result.cancelled.len(),
            "Event ingested"
        );
        Ok(result)
    }

    fn trigger_matches(&self, function: &Function, name: &str, event: &Value) -> bool {
        function
            .config
            .event_triggers()
            .filter(|(event_name, _)| *event_name == name)
            .any(|(_, expression)| match expression {
                None => true,
                Some(expression) => match self
                    .compiler
                    .compile(expression)
                    .and_then(|p| p.matches(&json!({ "event": event })))
                {
                    Ok(matched) => matched,
                    Err(e) => {
                        warn!(fn_id = %function.id, expression, error = %e, "Trigger expression failed");
                        false
                    }
                },
            })
    }

    /// Schedule a run of `function` for `event`.
    #[instrument(skip(self, function, event, options), fields(fn_id = %function.id, event_id = %event.internal_id))]
    pub async fn schedule_run(
        &self,
        function: &Arc<Function>,
        event: &Event,
        options: ScheduleOptions,
    ) -> Result<Scheduled> {
        let _guard = self.schedule_lock.lock().await;
        let now = self.clock.now();
        let value = event.to_value();
        let config = &function.config;

        if let Some(limit) = &config.rate_limit {
            let key = self.bucket_key(function, limit.key.as_deref(), &value)?;
            let rate = Rate::rate_limit(limit.limit, limit.period.duration());
            if !self.queue.check_rate_limit(&format!("r:{key}"), rate) {
                let run = self
                    .skipped_run(function, vec![event.internal_id], options, now)
                    .await?;
                info!(run_id = %run, "Run skipped by rate limit");
                return Ok(Scheduled::Skipped {
                    run_id: run,
                    reason: SkipReason::RateLimited,
                });
            }
        }

        if options.from_event() {
            if let Some(debounce) = &config.debounce {
                let key = self.bucket_key(function, debounce.key.as_deref(), &value)?;
                let existing = self
                    .buckets()
                    .debounces
                    .get(&(function.id, key.clone()))
                    .filter(|b| b.is_open(now))
                    .cloned();
                if let Some(bucket) = existing {
                    let mut at = now + debounce.period.duration();
                    if let Some(timeout) = debounce.timeout {
                        at = at.min(bucket.first_at + timeout.duration());
                    }
                    if self.queue.reschedule(bucket.item_id, at).is_ok() {
                        self.state
                            .replace_trigger_event(bucket.run_id, event.internal_id)
                            .await?;
                        debug!(run_id = %bucket.run_id, %at, "Debounced run pushed back");
                        return Ok(Scheduled::Debounced {
                            run_id: bucket.run_id,
                        });
                    }
                    // The start item is already running: open a new bucket.
                    self.buckets().debounces.remove(&(function.id, key.clone()));
                }

                let scheduled = self
                    .start_run(
                        function,
                        vec![event.clone()],
                        None,
                        options,
                        now + debounce.period.duration(),
                    )
                    .await?;
                if let Scheduled::Started { run_id } = scheduled
                    && let Some(item) = self
                        .queue
                        .items_for_run(run_id)
                        .into_iter()
                        .find(|i| i.kind == ItemKind::Start)
                {
                    self.buckets().debounces.insert(
                        (function.id, key),
                        DebounceBucket {
                            run_id,
                            item_id: item.id,
                            first_at: now,
                            deadline: debounce.timeout.as_ref().map(|t| now + t.duration()),
                        },
                    );
                }
                return Ok(scheduled);
            }

            if let Some(batch) = &config.batch_events {
                let key = self.bucket_key(function, batch.key.as_deref(), &value)?;
                let full = {
                    let mut buckets = self.buckets();
                    let buffer = buckets
                        .batches
                        .entry((function.id, key.clone()))
                        .or_insert_with(|| BatchBuffer {
                            id: BatchId::generate_at(now),
                            function: function.clone(),
                            events: Vec::new(),
                            opened_at: now,
                            timeout: batch.timeout.duration(),
                        });
                    buffer.events.push(event.clone());
                    let batch_id = buffer.id;
                    if buffer.events.len() < batch.max_size.max(1) {
                        debug!(%batch_id, size = buffer.events.len(), "Event buffered");
                        return Ok(Scheduled::Batched { batch_id });
                    }
                    buckets.batches.remove(&(function.id, key))
                };
                if let Some(buffer) = full {
                    return self
                        .start_run(&buffer.function, buffer.events, Some(buffer.id), options, now)
                        .await;
                }
            }
        }

        self.start_run(function, vec![event.clone()], None, options, now)
            .await
    }

    /// Drop debounce buckets whose timeout passed or whose start item left
    /// the queue without being processed.
    fn prune_debounces(&self, now: DateTime<Utc>) {
        let mut buckets = self.buckets();
        let before = buckets.debounces.len();
        buckets
            .debounces
            .retain(|_, b| b.is_open(now) && self.queue.find(b.item_id).is_some());
        let pruned = before - buckets.debounces.len();
        if pruned > 0 {
            debug!(pruned, "Pruned debounce buckets");
        }
    }

    /// Start runs for batches whose timeout passed, and prune stale debounce
    /// buckets.
    pub async fn flush_batches(&self) -> Result<Vec<Scheduled>> {
        let _guard = self.schedule_lock.lock().await;
        let now = self.clock.now();
        self.prune_debounces(now);
        let due: Vec<BatchBuffer> = {
            let mut buckets = self.buckets();
            let keys: Vec<(FunctionId, String)> = buckets
                .batches
                .iter()
                .filter(|(_, b)| b.opened_at + b.timeout <= now)
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter()
                .filter_map(|k| buckets.batches.remove(k))
                .collect()
        };

        let mut started = Vec::with_capacity(due.len());
        for buffer in due {
            debug!(batch_id = %buffer.id, size = buffer.events.len(), "Flushing batch");
            started.push(
                self.start_run(
                    &buffer.function,
                    buffer.events,
                    Some(buffer.id),
                    ScheduleOptions::default(),
                    now,
                )
                .await?,
            );
        }
        Ok(started)
    }

    /// Start a cron run of `function`.
    pub async fn fire_cron(
        &self,
        function: &Arc<Function>,
        cron: &str,
        at: DateTime<Utc>,
    ) -> Result<Scheduled> {
        let event = Event::internal(
            function.env_id,
            SCHEDULED_TIMER,
            json!({ "cron": cron, "fn_id": function.id }),
            at,
        );
        self.state.save_event(&event).await?;
        let options = ScheduleOptions {
            cron: Some(cron.to_string()),
            ..ScheduleOptions::default()
        };
        self.schedule_run(function, &event, options).await
    }

    /// Create the run and its start item. Callers hold the schedule lock.
    async fn start_run(
        &self,
        function: &Arc<Function>,
        events: Vec<Event>,
        batch_id: Option<BatchId>,
        options: ScheduleOptions,
        earliest_at: DateTime<Utc>,
    ) -> Result<Scheduled> {
        let now = self.clock.now();
        let trigger = events.first().map(Event::to_value).unwrap_or(Value::Null);
        let event_ids: Vec<EventId> = events.iter().map(|e| e.internal_id).collect();
        let config = &function.config;

        let mut singleton_key = None;
        if let Some(singleton) = &config.singleton {
            let key = format!("s:{}", self.bucket_key(function, singleton.key.as_deref(), &trigger)?);
            if let Some(holder) = self.singleton_holder(&key).await? {
                match singleton.mode {
                    SingletonMode::Skip => {
                        let run_id = self.skipped_run(function, event_ids, options, now).await?;
                        info!(%run_id, holder = %holder, "Run skipped by singleton");
                        return Ok(Scheduled::Skipped {
                            run_id,
                            reason: SkipReason::Singleton,
                        });
                    }
                    SingletonMode::Cancel => {
                        info!(holder = %holder, "Cancelling singleton holder");
                        self.cancel_if_active(holder).await?;
                    }
                }
            }
            singleton_key = Some(key);
        }

        let priority = config
            .priority
            .as_ref()
            .and_then(|p| p.run.as_deref())
            .map_or(0, |expr| evaluate_priority(&self.compiler, expr, &trigger));
        let (concurrency, throttle) = self.limits(function, &trigger)?;

        let mut run = Run::new(function.id, function.version, function.env_id, event_ids, now);
        if let Some(run_id) = options.run_id {
            run.run_id = run_id;
        }
        run.batch_id = batch_id;
        run.cron = options.cron;
        run.invoked_by = options.invoked_by;
        run.priority = priority;
        run.singleton_key = singleton_key.clone();
        self.state.create_run(&run).await?;
        if let Some(key) = singleton_key {
            self.buckets().singletons.insert(key, run.run_id);
        }

        let item = QueueItem::new(
            ItemKind::Start,
            run.run_id,
            function.id,
            function.env_id,
            "start",
            earliest_at,
        )
        .with_priority(priority)
        .with_max_attempts(self.executor.config().max_attempts(function.retries()))
        .with_limits(concurrency, throttle);
        self.queue.enqueue(item);

        self.arm_cancel_rules(function, &run, &trigger, now).await?;
        info!(run_id = %run.run_id, fn_id = %function.id, version = function.version, %earliest_at, "Run scheduled");
        Ok(Scheduled::Started { run_id: run.run_id })
    }

    async fn skipped_run(
        &self,
        function: &Function,
        event_ids: Vec<EventId>,
        options: ScheduleOptions,
        now: DateTime<Utc>,
    ) -> Result<RunId> {
        let mut run = Run::new(function.id, function.version, function.env_id, event_ids, now);
        if let Some(run_id) = options.run_id {
            run.run_id = run_id;
        }
        run.cron = options.cron;
        run.invoked_by = options.invoked_by;
        run.status = RunStatus::Skipped;
        run.ended_at = Some(now);
        self.state.create_run(&run).await?;
        Ok(run.run_id)
    }

    /// The live run holding singleton `key`, if any.
    async fn singleton_holder(&self, key: &str) -> Result<Option<RunId>> {
        let Some(holder) = self.buckets().singletons.get(key).copied() else {
            return Ok(None);
        };
        match self.state.load_run(holder).await? {
            Some(run) if !run.status.is_terminal() => Ok(Some(holder)),
            _ => {
                self.buckets().singletons.remove(key);
                Ok(None)
            }
        }
    }

    /// `<fn_id>` or `<fn_id>:<hash of key value>`.
    fn bucket_key(&self, function: &Function, expression: Option<&str>, event: &Value) -> Result<String> {
        match expression {
            None => Ok(function.id.to_string()),
            Some(expression) => {
                let value = evaluate_key(&self.compiler, expression, event)?;
                Ok(format!("{}:{}", function.id, key_hash(expression, &value)))
            }
        }
    }

    /// Concurrency buckets and throttle of a run with trigger `event`.
    fn limits(
        &self,
        function: &Function,
        event: &Value,
    ) -> Result<(Vec<ConcurrencyKey>, Option<ThrottleKey>)> {
        let mut keys = Vec::with_capacity(function.config.concurrency.len());
        for limit in &function.config.concurrency {
            let owner = match limit.scope {
                ConcurrencyScope::Fn => function.id.to_string(),
                ConcurrencyScope::Env => function.env_id.to_string(),
                ConcurrencyScope::Account => String::new(),
            };
            let mut key = format!("{}:{owner}", limit.scope.as_str());
            if let Some(expression) = &limit.key {
                let value = evaluate_key(&self.compiler, expression, event)?;
                key = format!("{key}:{}", key_hash(expression, &value));
            }
            keys.push(ConcurrencyKey::new(key, limit.limit));
        }

        let throttle = match &function.config.throttle {
            Some(throttle) => Some(ThrottleKey {
                key: format!("t:{}", self.bucket_key(function, throttle.key.as_deref(), event)?),
                rate: Rate::new(throttle.limit, throttle.period.duration(), throttle.burst),
            }),
            None => None,
        };
        Ok((keys, throttle))
    }

    /// One cancel pause per function cancel rule.
    async fn arm_cancel_rules(
        &self,
        function: &Function,
        run: &Run,
        trigger: &Value,
        now: DateTime<Utc>,
    ) -> Result<()> {
        for rule in &function.config.cancel {
            let expression = rule
                .expression
                .as_deref()
                .map(|expr| interpolate_wait_expression(expr, trigger))
                .transpose()?;
            let timeout_at = match rule.timeout {
                Some(timeout) => now + timeout.duration(),
                None => now + Duration::days(DEFAULT_CANCEL_TIMEOUT_DAYS),
            };
            self.save_pause(Pause {
                id: PauseId::generate_at(now),
                env_id: run.env_id,
                function_id: run.function_id,
                run_id: run.run_id,
                resumed_from_step_id: String::new(),
                kind: PauseKind::Cancel,
                event_name: Some(rule.event.clone()),
                expression,
                timeout_at,
                bind_as: "cancel".to_string(),
                invoke_correlation_id: None,
                extras: json!({}),
                created_at: now,
            })
            .await?;
        }
        Ok(())
    }

    /// Persist, reference and index a pause. Nothing is left behind when the
    /// expression is rejected by the index.
    async fn save_pause(&self, pause: Pause) -> Result<()> {
        self.pauses.create(&pause).await?;
        self.state.save_pause_ref(pause.run_id, pause.id).await?;
        let (pause_id, run_id) = (pause.id, pause.run_id);
        if let Err(e) = self.index.add(pause) {
            self.pauses.delete(pause_id).await?;
            self.state.remove_pause_ref(run_id, pause_id).await?;
            return Err(e);
        }
        Ok(())
    }

    /// Record `data` as the result of a consumed pause and enqueue the resume.
    ///
    /// Returns false when the run finished in the meantime.
    async fn resume_pause(&self, pause: &Pause, data: Value) -> Result<bool> {
        self.index.remove_pause(pause);
        self.state.remove_pause_ref(pause.run_id, pause.id).await?;

        let opcode = match pause.kind {
            PauseKind::Invoke => OpcodeKind::InvokeFunction,
            _ => OpcodeKind::WaitForEvent,
        };
        match self
            .state
            .append_stack(pause.run_id, &pause.bind_as, opcode, Some(data), 0)
            .await
        {
            Ok(_) => {}
            Err(CoreError::RunTerminal { .. }) => {
                debug!(run_id = %pause.run_id, "Run finished before its pause resumed");
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        let Some(run) = self.state.load_run(pause.run_id).await? else {
            return Ok(false);
        };
        let item = self
            .run_item(&run, ItemKind::Resume, format!("resume:{}", pause.id), self.clock.now())
            .await?;
        self.queue.enqueue(item);
        info!(run_id = %pause.run_id, pause_id = %pause.id, kind = %pause.kind, "Run resumed");
        Ok(true)
    }

    /// Time out a pause. Returns false when it was already consumed.
    pub async fn handle_timeout(&self, pause_id: PauseId) -> Result<bool> {
        let Some(pause) = self.pauses.consume(pause_id).await? else {
            return Ok(false);
        };
        debug!(run_id = %pause.run_id, %pause_id, kind = %pause.kind, "Pause timed out");
        match pause.kind {
            PauseKind::Cancel => {
                self.index.remove_pause(&pause);
                self.state.remove_pause_ref(pause.run_id, pause.id).await?;
                Ok(true)
            }
            PauseKind::Invoke => {
                let failure = StepFailure {
                    name: Some("InvokeTimeout".to_string()),
                    message: "invoked function did not finish in time".to_string(),
                    stack: None,
                };
                self.resume_pause(&pause, json!({ "error": failure })).await
            }
            PauseKind::Event | PauseKind::Signal => self.resume_pause(&pause, Value::Null).await,
        }
    }

    /// Time out every pause due at or before now, up to `limit`.
    pub async fn expire_pauses(&self, limit: usize) -> Result<usize> {
        let due = self.pauses.by_timeout(self.clock.now(), limit).await?;
        let mut expired = 0;
        for pause in due {
            if self.handle_timeout(pause.id).await? {
                expired += 1;
            }
        }
        Ok(expired)
    }

    /// A follow-up item of `run`, carrying its priority and concurrency buckets.
    async fn run_item(
        &self,
        run: &Run,
        kind: ItemKind,
        job_key: String,
        at: DateTime<Utc>,
    ) -> Result<QueueItem> {
        let mut item = QueueItem::new(kind, run.run_id, run.function_id, run.env_id, job_key, at)
            .with_priority(run.priority);
        if let Some(function) = self.registry.get_version(run.function_id, run.function_version) {
            let trigger = self.trigger_value(run).await?;
            let (concurrency, _) = self.limits(&function, &trigger)?;
            item = item
                .with_max_attempts(self.executor.config().max_attempts(function.retries()))
                .with_limits(concurrency, None);
        }
        Ok(item)
    }

    async fn trigger_value(&self, run: &Run) -> Result<Value> {
        let Some(event_id) = run.trigger_event_ids.first() else {
            return Ok(Value::Null);
        };
        Ok(self
            .state
            .load_event(*event_id)
            .await?
            .map(|e| e.to_value())
            .unwrap_or(Value::Null))
    }

    /// Dispatch one leased queue item and apply what came of it.
    #[instrument(skip(self, item), fields(run_id = %item.run_id, kind = ?item.kind, attempt = item.attempt))]
    pub async fn process(&self, item: &QueueItem) -> Result<Disposition> {
        let Some(run) = self.state.load_run(item.run_id).await? else {
            warn!("Queue item for unknown run");
            return Ok(Disposition::Ack);
        };
        if run.status.is_terminal() {
            debug!(status = %run.status, "Run already finished");
            return Ok(Disposition::Ack);
        }

        match item.kind {
            ItemKind::Cancel => {
                self.cancel_if_active(run.run_id).await?;
                return Ok(Disposition::Ack);
            }
            ItemKind::Start => {
                self.buckets()
                    .debounces
                    .retain(|_, bucket| bucket.run_id != run.run_id);
            }
            _ => {}
        }

        if let Some(pause_id) = item.payload.get(TIMEOUT_FOR).and_then(Value::as_str) {
            self.handle_timeout(pause_id.parse()?).await?;
            return Ok(Disposition::Ack);
        }

        let trigger = self.trigger_value(&run).await?;
        if let Some(rule) =
            self.cancellations
                .check(run.env_id, run.function_id, run.run_id, Some(&trigger))
        {
            info!(rule_id = %rule, "Run matched a cancellation rule");
            self.cancel_if_active(run.run_id).await?;
            return Ok(Disposition::Ack);
        }

        let Some(function) = self
            .registry
            .get_version(run.function_id, run.function_version)
        else {
            let failure = StepFailure::new(format!(
                "function {} version {} is not registered",
                run.function_id, run.function_version
            ));
            self.fail_run(&run, failure).await?;
            return Ok(Disposition::Ack);
        };

        let outcome = self.executor.execute(item, &function).await?;
        for follow_up in outcome.follow_ups {
            self.apply(item, follow_up).await?;
        }
        Ok(outcome.disposition)
    }

    async fn apply(&self, item: &QueueItem, follow_up: FollowUp) -> Result<()> {
        match follow_up {
            FollowUp::Enqueue(next) => {
                self.queue.enqueue(next);
            }
            FollowUp::WaitForEvent(pause) => self.suspend(pause).await?,
            FollowUp::Invoke {
                pause,
                function,
                payload,
                child_run_id,
            } => self.invoke(item, pause, &function, payload, child_run_id).await?,
            FollowUp::Finished {
                status,
                output,
                error,
            } => {
                if let Some(run) = self.state.load_run(item.run_id).await? {
                    self.finish_run(&run, status, output, error).await?;
                }
            }
        }
        Ok(())
    }

    /// Park a run on `pause` and schedule the pause's timeout.
    async fn suspend(&self, pause: Pause) -> Result<()> {
        let Some(run) = self.state.load_run(pause.run_id).await? else {
            return Ok(());
        };
        let (pause_id, timeout_at) = (pause.id, pause.timeout_at);
        match self.save_pause(pause).await {
            Ok(()) => {}
            Err(e) if e.is_user_error() => {
                warn!(run_id = %run.run_id, error = %e, "Pause rejected");
                return self.fail_run(&run, StepFailure::new(e.to_string())).await;
            }
            Err(e) => return Err(e),
        }
        let timeout = self
            .run_item(&run, ItemKind::Resume, format!("timeout:{pause_id}"), timeout_at)
            .await?
            .with_payload(json!({ TIMEOUT_FOR: pause_id }));
        self.queue.enqueue(timeout);
        debug!(run_id = %run.run_id, %pause_id, %timeout_at, "Run waiting");
        Ok(())
    }

    async fn invoke(
        &self,
        item: &QueueItem,
        pause: Pause,
        slug: &str,
        payload: Value,
        child_run_id: RunId,
    ) -> Result<()> {
        let pause_id = pause.id;
        let step_id = pause.resumed_from_step_id.clone();
        self.suspend(pause).await?;

        let Some(child) = self.registry.by_slug(item.env_id, slug) else {
            warn!(run_id = %item.run_id, function = slug, "Invoked function not found");
            let failure = StepFailure {
                name: Some("FunctionNotFound".to_string()),
                message: format!("function '{slug}' not found"),
                stack: None,
            };
            return self.resume_with_error(pause_id, failure).await;
        };

        let now = self.clock.now();
        let mut data = payload
            .get("data")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        data.insert(
            "_invoke".to_string(),
            json!({ "correlation_id": child_run_id, "parent_run_id": item.run_id }),
        );
        let mut event = Event::internal(item.env_id, FN_INVOKED, Value::Object(data), now);
        if let Some(user) = payload.get("user") {
            event.user = user.clone();
        }
        self.state.save_event(&event).await?;

        let options = ScheduleOptions {
            run_id: Some(child_run_id),
            invoked_by: Some(InvokedBy {
                run_id: item.run_id,
                function_id: item.function_id,
                step_id,
            }),
            ..ScheduleOptions::default()
        };
        if let Scheduled::Skipped { run_id, reason } = self.schedule_run(&child, &event, options).await? {
            let failure = StepFailure {
                name: Some("InvokeSkipped".to_string()),
                message: format!("invoked run {run_id} was skipped: {reason}"),
                stack: None,
            };
            return self.resume_with_error(pause_id, failure).await;
        }
        Ok(())
    }

    async fn resume_with_error(&self, pause_id: PauseId, failure: StepFailure) -> Result<()> {
        if let Some(pause) = self.pauses.consume(pause_id).await? {
            self.resume_pause(&pause, json!({ "error": failure })).await?;
        }
        Ok(())
    }

    /// Cancel a run. Unknown runs are `NotFound`, finished ones `RunTerminal`.
    #[instrument(skip(self))]
    pub async fn cancel_run(&self, run_id: RunId) -> Result<()> {
        let run = self
            .state
            .load_run(run_id)
            .await?
            .ok_or_else(|| CoreError::not_found(Component::Lifecycle, "run", run_id))?;
        let terminal = || CoreError::RunTerminal {
            run_id: run_id.to_string(),
            status: run.status.to_string(),
        };
        if run.status.is_terminal() {
            return Err(terminal());
        }
        if !self
            .state
            .set_status(run_id, RunStatus::Cancelled, StatusUpdate::ended(self.clock.now()))
            .await?
        {
            return Err(terminal());
        }
        info!("Run cancelled");
        self.finish_run(&run, RunStatus::Cancelled, None, None).await
    }

    /// Cancel a run unless it is unknown or already finished.
    async fn cancel_if_active(&self, run_id: RunId) -> Result<bool> {
        match self.cancel_run(run_id).await {
            Ok(()) => Ok(true),
            Err(CoreError::RunTerminal { .. } | CoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Fail the run of an item the queue gave up on.
    pub async fn fail_dead_lettered(&self, item: &QueueItem) -> Result<()> {
        let Some(run) = self.state.load_run(item.run_id).await? else {
            return Ok(());
        };
        if run.status.is_terminal() {
            return Ok(());
        }
        let failure = StepFailure::new(format!(
            "queue item {} exhausted {} attempts",
            item.job_key, item.max_attempts
        ));
        self.fail_run(&run, failure).await
    }

    async fn fail_run(&self, run: &Run, failure: StepFailure) -> Result<()> {
        let update = StatusUpdate {
            error: Some(failure.clone()),
            ..StatusUpdate::ended(self.clock.now())
        };
        if self
            .state
            .set_status(run.run_id, RunStatus::Failed, update)
            .await?
        {
            warn!(run_id = %run.run_id, message = %failure.message, "Run failed");
            self.finish_run(run, RunStatus::Failed, None, Some(failure))
                .await?;
        }
        Ok(())
    }

    /// Release what a run that just became terminal held, and resume its
    /// invoking parent.
    async fn finish_run(
        &self,
        run: &Run,
        status: RunStatus,
        output: Option<Value>,
        error: Option<StepFailure>,
    ) -> Result<()> {
        {
            let mut buckets = self.buckets();
            if let Some(key) = &run.singleton_key
                && buckets.singletons.get(key) == Some(&run.run_id)
            {
                buckets.singletons.remove(key);
            }
            buckets.debounces.retain(|_, b| b.run_id != run.run_id);
        }

        for pause in self.pauses.by_run(run.run_id).await? {
            self.index.remove_pause(&pause);
        }
        for pause_id in self.pauses.delete_by_run(run.run_id).await? {
            self.state.remove_pause_ref(run.run_id, pause_id).await?;
        }
        let removed = self.queue.remove_run_items(run.run_id);
        debug!(run_id = %run.run_id, %status, removed, "Run resources released");

        if run.invoked_by.is_some()
            && let Some(parent) = self
                .pauses
                .by_invoke_correlation(&run.run_id.to_string())
                .await?
            && let Some(parent) = self.pauses.consume(parent.id).await?
        {
            let result = match status {
                RunStatus::Completed => json!({ "data": output.unwrap_or(Value::Null) }),
                _ => {
                    let failure = error.unwrap_or_else(|| StepFailure {
                        name: Some("FunctionCancelled".to_string()),
                        message: format!("invoked run {} ended as {status}", run.run_id),
                        stack: None,
                    });
                    json!({ "error": failure })
                }
            };
            self.resume_pause(&parent, result).await?;
        }
        Ok(())
    }

    /// Register a bulk cancellation rule.
    pub async fn add_cancellation(&self, rule: Cancellation) -> Result<()> {
        self.cancellations.add(rule.clone())?;
        self.state.save_cancellation(&rule).await?;
        info!(rule_id = %rule.id, fn_id = %rule.function_id, "Cancellation rule added");
        Ok(())
    }

    pub async fn remove_cancellation(&self, id: CancellationId) -> Result<bool> {
        self.cancellations.remove(id);
        self.state.delete_cancellation(id).await
    }

    /// Rebuild in-process state from the stores after a restart.
    ///
    /// Stored pauses are indexed again, cancellation rules reloaded, singleton
    /// slots reclaimed, and active runs with neither queued work nor a pause
    /// to wait on are queued again.
    pub async fn recover(&self) -> Result<Recovery> {
        let now = self.clock.now();
        let mut recovery = Recovery::default();

        for pause in self.pauses.all().await? {
            if pause.event_name.is_none() {
                continue;
            }
            let pause_id = pause.id;
            match self.index.add(pause) {
                Ok(_) => recovery.pauses += 1,
                Err(e) => warn!(%pause_id, error = %e, "Stored pause could not be indexed"),
            }
        }

        for rule in self.state.load_cancellations().await? {
            self.cancellations.add(rule)?;
            recovery.cancellations += 1;
        }

        for run in self.state.list_runs(&RunFilter::active()).await? {
            if let Some(key) = &run.singleton_key {
                self.buckets().singletons.insert(key.clone(), run.run_id);
            }
            if !self.queue.items_for_run(run.run_id).is_empty() {
                continue;
            }
            let waiting = self
                .pauses
                .by_run(run.run_id)
                .await?
                .iter()
                .any(|p| p.kind != PauseKind::Cancel);
            if waiting {
                continue;
            }
            let kind = if run.status == RunStatus::Queued {
                ItemKind::Start
            } else {
                ItemKind::Step
            };
            let item = self.run_item(&run, kind, "recover".to_string(), now).await?;
            if self.queue.enqueue(item) {
                recovery.runs += 1;
            }
        }

        info!(
            pauses = recovery.pauses,
            cancellations = recovery.cancellations,
            runs = recovery.runs,
            "Recovered"
        );
        Ok(recovery)
    }
}

fn key_hash(expression: &str, value: &str) -> String {
    let digest = Sha256::digest(format!("{expression}\u{0}{value}").as_bytes());
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::driver::tests::ScriptedDriver;
    use crate::event::IncomingEvent;
    use crate::executor::ExecutorConfig;
    use crate::function::tests::config;
    use crate::pause::MemoryPauseStore;
    use crate::queue::QueueConfig;
    use crate::state::MemoryStateStore;
    use uuid::Uuid;

    pub(crate) struct Harness {
        pub lifecycle: Arc<Lifecycle>,
        pub queue: Arc<Queue>,
        pub state: Arc<MemoryStateStore>,
        pub pauses: Arc<MemoryPauseStore>,
        pub driver: Arc<ScriptedDriver>,
        pub clock: Arc<ManualClock>,
    }

    pub(crate) fn harness() -> Harness {
        let clock = Arc::new(ManualClock::starting_now());
        let state = Arc::new(MemoryStateStore::new());
        let pauses = Arc::new(MemoryPauseStore::new());
        let driver = Arc::new(ScriptedDriver::default());
        let queue = Arc::new(Queue::new(QueueConfig::default(), clock.clone()));
        let executor = Arc::new(Executor::new(
            ExecutorConfig::default(),
            state.clone(),
            driver.clone(),
            clock.clone(),
        ));
        let lifecycle = Arc::new(Lifecycle::new(LifecycleParts {
            registry: Arc::new(FunctionRegistry::new(Arc::new(Compiler::default()))),
            state: state.clone(),
            pauses: pauses.clone(),
            queue: queue.clone(),
            executor,
            clock: clock.clone(),
            matcher_concurrency: 2,
        }));
        Harness {
            lifecycle,
            queue,
            state,
            pauses,
            driver,
            clock,
        }
    }

    impl Harness {
        pub fn sync(&self, cfg: FunctionConfig) -> Arc<Function> {
            self.lifecycle
                .sync_functions(Uuid::nil(), vec![cfg])
                .unwrap()
                .remove(0)
        }

        pub async fn send(&self, name: &str, data: Value) -> IngestResult {
            let event = Event::ingest(
                IncomingEvent::new(name, data),
                Uuid::nil(),
                None,
                self.clock.now(),
            )
            .unwrap();
            self.lifecycle.ingest(event).await.unwrap()
        }

        /// Process the run's first due item the way a worker would.
        pub async fn step(&self, run_id: RunId) -> Disposition {
            let item = self
                .queue
                .items_for_run(run_id)
                .into_iter()
                .find(|i| i.earliest_at <= self.clock.now())
                .expect("a due item");
            let disposition = self.lifecycle.process(&item).await.unwrap();
            if disposition == Disposition::Ack {
                let _ = self.queue.ack(item.id, item.lease_token);
            }
            disposition
        }

        pub async fn status(&self, run_id: RunId) -> RunStatus {
            self.state.load_run(run_id).await.unwrap().unwrap().status
        }
    }

    pub(crate) fn started(scheduled: &Scheduled) -> RunId {
        match scheduled {
            Scheduled::Started { run_id } => *run_id,
            other => panic!("expected a started run, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_event_starts_run_and_completes() {
        let h = harness();
        h.sync(config("checkout", "order.created"));
        h.driver.push(200, json!({"ok": true}));

        let result = h.send("order.created", json!({"id": "A"})).await;
        assert_eq!(result.runs.len(), 1);
        let run_id = started(&result.runs[0]);
        assert_eq!(h.status(run_id).await, RunStatus::Queued);

        assert_eq!(h.step(run_id).await, Disposition::Ack);
        let run = h.state.load_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.output, Some(json!({"ok": true})));
        assert!(h.queue.is_empty());

        // Other event names trigger nothing.
        assert!(h.send("order.updated", json!({})).await.runs.is_empty());
    }

    #[tokio::test]
    async fn test_trigger_expression_filters() {
        let h = harness();
        let mut cfg = config("vip", "order.created");
        cfg.triggers = serde_json::from_value(json!([
            {"event": "order.created", "if": "event.data.total > 100"}
        ]))
        .unwrap();
        h.sync(cfg);

        assert!(h.send("order.created", json!({"total": 10})).await.runs.is_empty());
        assert_eq!(h.send("order.created", json!({"total": 500})).await.runs.len(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_skips_run() {
        let h = harness();
        let mut cfg = config("digest", "user.login");
        cfg.rate_limit = serde_json::from_value(json!({"limit": 1, "period": "1h", "key": "event.data.user"})).unwrap();
        h.sync(cfg);

        let first = h.send("user.login", json!({"user": "u1"})).await;
        let second = h.send("user.login", json!({"user": "u1"})).await;
        let other = h.send("user.login", json!({"user": "u2"})).await;

        started(&first.runs[0]);
        started(&other.runs[0]);
        let Scheduled::Skipped { run_id, reason } = second.runs[0] else {
            panic!("expected skip");
        };
        assert_eq!(reason, SkipReason::RateLimited);
        assert_eq!(h.status(run_id).await, RunStatus::Skipped);
        assert!(h.queue.items_for_run(run_id).is_empty());
    }

    #[tokio::test]
    async fn test_singleton_modes() {
        let h = harness();
        let mut cfg = config("sync", "account.changed");
        cfg.singleton = serde_json::from_value(json!({"mode": "skip"})).unwrap();
        h.sync(cfg);

        let first = started(&h.send("account.changed", json!({})).await.runs[0]);
        let second = h.send("account.changed", json!({})).await;
        assert!(matches!(
            second.runs[0],
            Scheduled::Skipped { reason: SkipReason::Singleton, .. }
        ));

        let mut cfg = config("sync", "account.changed");
        cfg.singleton = serde_json::from_value(json!({"mode": "cancel"})).unwrap();
        h.sync(cfg);
        let third = started(&h.send("account.changed", json!({})).await.runs[0]);
        assert_eq!(h.status(first).await, RunStatus::Cancelled);
        assert_eq!(h.status(third).await, RunStatus::Queued);
        assert!(h.queue.items_for_run(first).is_empty());
    }

    #[tokio::test]
    async fn test_debounce_replaces_trigger_and_pushes_back() {
        let h = harness();
        let mut cfg = config("search-index", "doc.saved");
        cfg.debounce = serde_json::from_value(json!({"period": "5s", "timeout": "8s"})).unwrap();
        h.sync(cfg);

        let t0 = h.clock.now();
        let first = h.send("doc.saved", json!({"rev": 1})).await;
        let run_id = started(&first.runs[0]);

        h.clock.advance(Duration::seconds(2));
        let second = h.send("doc.saved", json!({"rev": 2})).await;
        assert_eq!(second.runs[0], Scheduled::Debounced { run_id });
        let item = h.queue.items_for_run(run_id).remove(0);
        assert_eq!(item.earliest_at, t0 + Duration::seconds(7));

        // Capped at first event + timeout.
        h.clock.advance(Duration::seconds(4));
        h.send("doc.saved", json!({"rev": 3})).await;
        let item = h.queue.items_for_run(run_id).remove(0);
        assert_eq!(item.earliest_at, t0 + Duration::seconds(8));

        let state = h.state.load(run_id).await.unwrap();
        assert_eq!(state.run.trigger_event_ids.len(), 1);
        assert_eq!(state.trigger_event().unwrap().data["rev"], 3);
    }

    #[tokio::test]
    async fn test_debounce_buckets_are_pruned() {
        let h = harness();
        let mut cfg = config("search-index", "doc.saved");
        cfg.debounce = serde_json::from_value(json!({"period": "5s", "timeout": "8s"})).unwrap();
        h.sync(cfg);
        let open = |h: &Harness| h.lifecycle.buckets().debounces.len();

        // Fired.
        let fired = started(&h.send("doc.saved", json!({"rev": 1})).await.runs[0]);
        assert_eq!(open(&h), 1);
        h.driver.push(200, json!({"ok": true}));
        h.clock.advance(Duration::seconds(5));
        h.step(fired).await;
        assert_eq!(open(&h), 0);

        // Timed out before a worker picked it up.
        let late = started(&h.send("doc.saved", json!({"rev": 2})).await.runs[0]);
        h.clock.advance(Duration::seconds(9));
        h.lifecycle.flush_batches().await.unwrap();
        assert_eq!(open(&h), 0);
        let next = h.send("doc.saved", json!({"rev": 3})).await;
        let fresh = started(&next.runs[0]);
        assert_ne!(fresh, late);

        // Start item removed without running.
        assert_eq!(open(&h), 1);
        h.queue.remove_run_items(fresh);
        h.lifecycle.flush_batches().await.unwrap();
        assert_eq!(open(&h), 0);
    }

    #[tokio::test]
    async fn test_batch_fills_then_flushes_on_timeout() {
        let h = harness();
        let mut cfg = config("bulk", "row.added");
        cfg.batch_events = serde_json::from_value(json!({"maxSize": 2, "timeout": "10s"})).unwrap();
        h.sync(cfg);

        let a = h.send("row.added", json!({"n": 1})).await;
        assert!(matches!(a.runs[0], Scheduled::Batched { .. }));
        let b = h.send("row.added", json!({"n": 2})).await;
        let run_id = started(&b.runs[0]);
        let run = h.state.load_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.trigger_event_ids.len(), 2);
        assert!(run.batch_id.is_some());

        h.send("row.added", json!({"n": 3})).await;
        assert!(h.lifecycle.flush_batches().await.unwrap().is_empty());
        h.clock.advance(Duration::seconds(11));
        let flushed = h.lifecycle.flush_batches().await.unwrap();
        assert_eq!(flushed.len(), 1);
        let run = h.state.load_run(started(&flushed[0])).await.unwrap().unwrap();
        assert_eq!(run.trigger_event_ids.len(), 1);
    }

    #[tokio::test]
    async fn test_wait_for_event_resumes_once() {
        let h = harness();
        h.sync(config("checkout", "order.created"));
        h.driver.push(200, json!([{
            "op": "WaitForEvent",
            "id": "paid",
            "opts": {"event": "order.paid", "if": "event.data.id == ctx.event.data.id", "timeout": "1h"}
        }]));

        let run_id = started(&h.send("order.created", json!({"id": "A"})).await.runs[0]);
        h.step(run_id).await;
        assert_eq!(h.status(run_id).await, RunStatus::Waiting);
        assert_eq!(h.lifecycle.index().len(), 1);

        let miss = h.send("order.paid", json!({"id": "B"})).await;
        assert!(miss.resumed.is_empty());
        let hit = h.send("order.paid", json!({"id": "A"})).await;
        assert_eq!(hit.resumed.len(), 1);
        let again = h.send("order.paid", json!({"id": "A"})).await;
        assert!(again.resumed.is_empty());

        let state = h.state.load(run_id).await.unwrap();
        assert_eq!(state.steps()["paid"]["data"]["id"], "A");
        assert!(h.lifecycle.index().is_empty());
        assert!(h.state.pause_refs(run_id).await.unwrap().is_empty());

        h.driver.push(200, json!([{"op": "RunComplete", "id": "done", "data": "shipped"}]));
        // The resume item is due now; the timeout item is an hour out.
        h.step(run_id).await;
        assert_eq!(h.status(run_id).await, RunStatus::Completed);
        assert!(h.queue.items_for_run(run_id).is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_event_timeout_resumes_with_null() {
        let h = harness();
        h.sync(config("checkout", "order.created"));
        h.driver.push(200, json!([{
            "op": "WaitForEvent",
            "id": "paid",
            "opts": {"event": "order.paid", "timeout": "1h"}
        }]));
        let run_id = started(&h.send("order.created", json!({})).await.runs[0]);
        h.step(run_id).await;

        assert_eq!(h.lifecycle.expire_pauses(10).await.unwrap(), 0);
        h.clock.advance(Duration::hours(1));
        // The timeout item fires first; the scan then finds nothing.
        h.step(run_id).await;
        assert_eq!(h.lifecycle.expire_pauses(10).await.unwrap(), 0);

        let state = h.state.load(run_id).await.unwrap();
        assert_eq!(state.steps()["paid"], Value::Null);
        let resume = h.queue.items_for_run(run_id);
        assert_eq!(resume.len(), 1);
        assert_eq!(resume[0].kind, ItemKind::Resume);
    }

    #[tokio::test]
    async fn test_cancel_rule_cancels_waiting_run() {
        let h = harness();
        let mut cfg = config("checkout", "order.created");
        cfg.cancel = serde_json::from_value(json!([
            {"event": "order.cancelled", "if": "event.data.id == async.data.id"}
        ]))
        .unwrap();
        h.sync(cfg);
        h.driver.push(200, json!([{"op": "Sleep", "id": "nap", "name": "1h"}]));

        let run_id = started(&h.send("order.created", json!({"id": "A"})).await.runs[0]);
        h.step(run_id).await;
        assert_eq!(h.status(run_id).await, RunStatus::Waiting);

        let other = h.send("order.cancelled", json!({"id": "B"})).await;
        assert!(other.cancelled.is_empty());
        let result = h.send("order.cancelled", json!({"id": "A"})).await;
        assert_eq!(result.cancelled, vec![run_id]);

        assert_eq!(h.status(run_id).await, RunStatus::Cancelled);
        assert!(h.pauses.by_run(run_id).await.unwrap().is_empty());
        assert!(h.queue.items_for_run(run_id).is_empty());
        assert!(h.lifecycle.index().is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_rule_checked_before_dispatch() {
        let h = harness();
        let function = h.sync(config("checkout", "order.created"));
        let run_id = started(&h.send("order.created", json!({"plan": "free"})).await.runs[0]);

        h.lifecycle
            .add_cancellation(Cancellation {
                id: CancellationId::generate(),
                env_id: Uuid::nil(),
                function_id: function.id,
                expression: Some("event.data.plan == 'free'".to_string()),
                started_after: None,
                started_before: h.clock.now() + Duration::seconds(1),
            })
            .await
            .unwrap();

        assert_eq!(h.step(run_id).await, Disposition::Ack);
        assert_eq!(h.status(run_id).await, RunStatus::Cancelled);
        assert_eq!(h.driver.calls(), 0);
        assert_eq!(h.state.load_cancellations().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_run_errors() {
        let h = harness();
        h.sync(config("checkout", "order.created"));
        let run_id = started(&h.send("order.created", json!({})).await.runs[0]);

        h.lifecycle.cancel_run(run_id).await.unwrap();
        let err = h.lifecycle.cancel_run(run_id).await.unwrap_err();
        assert!(matches!(err, CoreError::RunTerminal { .. }));
        let err = h.lifecycle.cancel_run(RunId::generate()).await.unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_invoke_resumes_parent_with_child_output() {
        let h = harness();
        h.sync(config("parent", "order.created"));
        h.sync(config("child", "never.sent"));
        h.driver.push(200, json!([{
            "op": "InvokeFunction",
            "id": "charge",
            "opts": {"function_id": "child", "payload": {"data": {"amount": 5}}}
        }]));

        let parent = started(&h.send("order.created", json!({})).await.runs[0]);
        h.step(parent).await;
        assert_eq!(h.status(parent).await, RunStatus::Waiting);

        let child = h
            .state
            .list_runs(&RunFilter::active())
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.run_id != parent)
            .unwrap();
        assert_eq!(child.invoked_by.as_ref().unwrap().run_id, parent);
        let child_state = h.state.load(child.run_id).await.unwrap();
        let trigger = child_state.trigger_event().unwrap();
        assert_eq!(trigger.name, FN_INVOKED);
        assert_eq!(trigger.data["amount"], 5);

        h.driver.push(200, json!({"charged": true}));
        h.step(child.run_id).await;
        assert_eq!(h.status(child.run_id).await, RunStatus::Completed);

        let state = h.state.load(parent).await.unwrap();
        assert_eq!(state.steps()["charge"], json!({"data": {"charged": true}}));
        assert!(h.pauses.by_run(parent).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invoke_unknown_function_resumes_with_error() {
        let h = harness();
        h.sync(config("parent", "order.created"));
        h.driver.push(200, json!([{
            "op": "InvokeFunction",
            "id": "call",
            "opts": {"function_id": "missing"}
        }]));
        let parent = started(&h.send("order.created", json!({})).await.runs[0]);
        h.step(parent).await;

        let state = h.state.load(parent).await.unwrap();
        assert_eq!(state.steps()["call"]["error"]["name"], "FunctionNotFound");
        assert_eq!(h.queue.items_for_run(parent).len(), 2);
    }

    #[tokio::test]
    async fn test_concurrency_and_priority_are_attached() {
        let h = harness();
        let mut cfg = config("send", "mail.queued");
        cfg.concurrency = serde_json::from_value(json!([
            {"scope": "fn", "limit": 1},
            {"scope": "env", "limit": 10, "key": "event.data.tenant"}
        ]))
        .unwrap();
        cfg.throttle = serde_json::from_value(json!({"limit": 5, "period": "1m"})).unwrap();
        cfg.priority = serde_json::from_value(json!({"run": "event.data.vip ? 120 : 0"})).unwrap();
        let function = h.sync(cfg);

        let run_id = started(&h.send("mail.queued", json!({"tenant": "t1", "vip": true})).await.runs[0]);
        let item = h.queue.items_for_run(run_id).remove(0);
        assert_eq!(item.priority, 120);
        assert_eq!(item.concurrency.len(), 2);
        assert_eq!(item.concurrency[0], ConcurrencyKey::new(format!("f:{}", function.id), 1));
        assert!(item.concurrency[1].key.starts_with(&format!("e:{}:", Uuid::nil())));
        assert_eq!(item.throttle.unwrap().key, format!("t:{}", function.id));
        assert_eq!(
            item.max_attempts,
            ExecutorConfig::default().max_attempts(function.retries())
        );
    }

    #[tokio::test]
    async fn test_recover_requeues_stranded_runs() {
        let h = harness();
        h.sync(config("checkout", "order.created"));
        let run_id = started(&h.send("order.created", json!({})).await.runs[0]);

        // Simulate a restart that lost the in-memory queue.
        h.queue.remove_run_items(run_id);
        let recovery = h.lifecycle.recover().await.unwrap();
        assert_eq!(recovery.runs, 1);
        let items = h.queue.items_for_run(run_id);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].kind, ItemKind::Start);

        // Nothing more to do the second time.
        assert_eq!(h.lifecycle.recover().await.unwrap().runs, 0);
    }

    #[tokio::test]
    async fn test_cron_run_records_schedule() {
        let h = harness();
        let mut cfg = config("nightly", "unused");
        cfg.triggers = serde_json::from_value(json!([{"cron": "0 0 * * *"}])).unwrap();
        let function = h.sync(cfg);

        let scheduled = h
            .lifecycle
            .fire_cron(&function, "0 0 * * *", h.clock.now())
            .await
            .unwrap();
        let state = h.state.load(started(&scheduled)).await.unwrap();
        assert_eq!(state.run.cron.as_deref(), Some("0 0 * * *"));
        assert_eq!(state.trigger_event().unwrap().name, SCHEDULED_TIMER);
    }

    #[test]
    fn test_key_hash_is_stable() {
        assert_eq!(key_hash("event.data.id", "a"), key_hash("event.data.id", "a"));
        assert_ne!(key_hash("event.data.id", "a"), key_hash("event.data.id", "b"));
        assert_eq!(key_hash("x", "y").len(), 16);
    }
}
