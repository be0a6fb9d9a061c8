// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Turns one queue item into one call to a step target.
//!
//! The executor loads the run, calls the target with the memoized stack,
//! records step results and terminal statuses in the state store, and
//! describes everything else it wants to happen as [`FollowUp`]s. It never
//! touches the queue or the pause store directly; the lifecycle applies the
//! follow-ups and the worker acks or nacks the item.
//!
//! Response classification:
//!
//! | Response | Result |
//! |---|---|
//! | transport error, 5xx, missing SDK header | infra retry, up to `max_infra_retries` |
//! | 4xx with `retryable: false` | run failed |
//! | other 4xx, `StepError` opcode | step retry, up to the function's `retries` |
//! | 2xx with opcodes | opcodes applied |
//! | 206 without opcodes | continue calling |
//! | 200 without opcodes | run completed with the body as output |

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::driver::{Driver, RequestContext, StepRequest, StepResponse};
use crate::duration::resolve_until;
use crate::error::{CoreError, Result};
use crate::function::Function;
use crate::id::{PauseId, RunId};
use crate::matcher::interpolate_wait_expression;
use crate::opcode::{GeneratorOpcode, OpcodeKind, StepFailure, parse_opcodes};
use crate::pause::{Pause, PauseKind};
use crate::queue::backoff::{exponential, with_jitter};
use crate::queue::{ItemKind, QueueItem, to_chrono};
use crate::run::{RunState, RunStatus, StatusUpdate};
use crate::state::StateStore;

/// Invokes without a timeout wait this long.
const DEFAULT_INVOKE_TIMEOUT_DAYS: i64 = 365;

/// Executor configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Retries for transport errors, 5xx and non-SDK responses.
    pub max_infra_retries: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
    /// Retry delays are spread by this fraction either way.
    pub retry_jitter: f64,
    /// Timeout of a single step target call.
    pub request_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_infra_retries: 5,
            retry_base: Duration::from_secs(10),
            retry_max: Duration::from_secs(6 * 3600),
            retry_jitter: 0.2,
            request_timeout: Duration::from_secs(300),
        }
    }
}

impl ExecutorConfig {
    /// Queue-level attempt ceiling for items of a function with `retries`.
    ///
    /// Step and infra budgets are enforced by the executor; this only
    /// backstops items that keep failing before a response is classified.
    pub fn max_attempts(&self, retries: u32) -> u32 {
        retries
            .saturating_add(self.max_infra_retries)
            .saturating_add(2)
    }

    /// `min(retry_max, retry_base * 2^n)` with jitter.
    pub fn backoff(&self, n: u32) -> Duration {
        with_jitter(
            exponential(n, self.retry_base, self.retry_max),
            self.retry_jitter,
        )
    }
}

/// What the worker does with the item.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Ack,
    Retry { at: DateTime<Utc>, infra: bool },
}

/// Work the lifecycle carries out after a step attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FollowUp {
    Enqueue(QueueItem),
    /// Persist and index the pause, then schedule its timeout.
    WaitForEvent(Pause),
    /// Start `function` as a child run and park the parent on `pause`.
    Invoke {
        pause: Pause,
        function: String,
        payload: Value,
        child_run_id: RunId,
    },
    /// The run reached a terminal status; its status is already written.
    Finished {
        status: RunStatus,
        output: Option<Value>,
        error: Option<StepFailure>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub disposition: Disposition,
    pub follow_ups: Vec<FollowUp>,
}

impl Outcome {
    pub fn ack() -> Self {
        Self {
            disposition: Disposition::Ack,
            follow_ups: Vec::new(),
        }
    }

    fn ack_with(follow_ups: Vec<FollowUp>) -> Self {
        Self {
            disposition: Disposition::Ack,
            follow_ups,
        }
    }

    fn retry(at: DateTime<Utc>, infra: bool) -> Self {
        Self {
            disposition: Disposition::Retry { at, infra },
            follow_ups: Vec::new(),
        }
    }
}

pub struct Executor {
    config: ExecutorConfig,
    state: Arc<dyn StateStore>,
    driver: Arc<dyn Driver>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Executor {
    pub fn new(
        config: ExecutorConfig,
        state: Arc<dyn StateStore>,
        driver: Arc<dyn Driver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            state,
            driver,
            clock,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run one attempt of `item` against `function`'s step target.
    ///
    /// Errors are store failures; every step target outcome, failures
    /// included, is expressed through the returned [`Outcome`].
    #[instrument(
        skip(self, item, function),
        fields(run_id = %item.run_id, fn_id = %item.function_id, kind = ?item.kind, attempt = item.attempt)
    )]
    pub async fn execute(&self, item: &QueueItem, function: &Function) -> Result<Outcome> {
        if item.kind == ItemKind::Cancel {
            return Ok(Outcome::ack());
        }

        if item.kind == ItemKind::Sleep
            && let Some(step_id) = item.payload.get("step_id").and_then(Value::as_str)
        {
            match self
                .state
                .append_stack(item.run_id, step_id, OpcodeKind::Sleep, None, item.attempt)
                .await
            {
                Ok(_) => {}
                Err(CoreError::RunTerminal { .. }) => return Ok(Outcome::ack()),
                Err(e) => return Err(e),
            }
        }

        let state = self.state.load(item.run_id).await?;
        if state.run.status.is_terminal() {
            debug!(status = %state.run.status, "Run already finished; dropping item");
            return Ok(Outcome::ack());
        }
        if state.run.status != RunStatus::Running {
            self.state
                .set_status(item.run_id, RunStatus::Running, StatusUpdate::default())
                .await?;
        }

        let request = self.request(item, &state);
        let url = &function.target().url;
        let response = match self.driver.execute(url, &request).await {
            Ok(response) => response,
            Err(e) if e.is_retryable() => return self.infra_failure(item, e.to_string()).await,
            Err(e) => return Err(e),
        };

        // The run may have been cancelled while the call was in flight.
        if let Some(run) = self.state.load_run(item.run_id).await?
            && run.status.is_terminal()
        {
            info!(status = %run.status, "Discarding step response for finished run");
            return Ok(Outcome::ack());
        }

        self.classify(item, function, &state, response).await
    }

    fn request(&self, item: &QueueItem, state: &RunState) -> StepRequest {
        let event = state
            .trigger_event()
            .map(|e| e.to_value())
            .unwrap_or(Value::Null);
        let events = state
            .run
            .batch_id
            .map(|_| state.events.iter().map(|e| e.to_value()).collect());
        StepRequest {
            event,
            events,
            ctx: RequestContext {
                run_id: item.run_id,
                attempt: item.attempt,
                stack: state.stack.iter().map(|e| e.step_id.clone()).collect(),
                env: item.env_id,
                fn_id: item.function_id,
                step_id: item.step_id.clone(),
            },
            steps: state.steps(),
            use_api: false,
        }
    }

    async fn classify(
        &self,
        item: &QueueItem,
        function: &Function,
        state: &RunState,
        response: StepResponse,
    ) -> Result<Outcome> {
        if !response.sdk {
            return self
                .infra_failure(item, format!("response without SDK header (status {})", response.status))
                .await;
        }
        match response.status {
            200..=299 => {
                let outcome = self.apply_response(item, function, state, &response).await;
                match outcome {
                    Err(e) if e.is_user_error() => {
                        warn!(error = %e, "Invalid opcode from step target");
                        self.fail(item, StepFailure::new(e.to_string())).await
                    }
                    other => other,
                }
            }
            400..=499 => {
                let (failure, retryable) = StepFailure::from_body(&response.body);
                if retryable {
                    self.step_failure(item, function, failure).await
                } else {
                    info!(message = %failure.message, "Step failed without retry");
                    self.fail(item, failure).await
                }
            }
            status => self.infra_failure(item, format!("step target returned {status}")).await,
        }
    }

    async fn apply_response(
        &self,
        item: &QueueItem,
        function: &Function,
        state: &RunState,
        response: &StepResponse,
    ) -> Result<Outcome> {
        let opcodes = match parse_opcodes(&response.body) {
            Ok(Some(opcodes)) => opcodes,
            Ok(None) if response.status == 206 => {
                return Ok(Outcome::ack_with(vec![self.continuation(item, function)]));
            }
            Ok(None) => return self.complete(item, response.body.clone()).await,
            Err(e) => {
                warn!(error = %e, "Malformed opcode batch from step target");
                let failure = StepFailure {
                    name: Some("InvalidOpcode".to_string()),
                    message: e.to_string(),
                    stack: None,
                };
                return self.step_failure(item, function, failure).await;
            }
        };

        let now = self.clock.now();
        let mut follow_ups = Vec::new();
        let mut suspended = false;
        let mut planned = false;

        for op in &opcodes {
            match op.op {
                OpcodeKind::Step | OpcodeKind::StepRun => {
                    match self
                        .state
                        .append_stack(item.run_id, &op.id, op.op, op.data.clone(), item.attempt)
                        .await
                    {
                        Ok(appended) if !appended.inserted => {
                            debug!(step_id = %op.id, "Step already recorded; keeping first result");
                        }
                        Ok(_) => {}
                        Err(CoreError::RunTerminal { .. }) => return Ok(Outcome::ack()),
                        Err(e) => return Err(e),
                    }
                }
                OpcodeKind::StepPlanned => {
                    planned = true;
                    follow_ups.push(FollowUp::Enqueue(
                        self.next_item(item, function, ItemKind::Step, format!("plan:{}", op.id), now)
                            .with_step(op.id.clone()),
                    ));
                }
                OpcodeKind::Sleep => {
                    suspended = true;
                    let until = op.sleep_until(now)?;
                    follow_ups.push(FollowUp::Enqueue(
                        self.next_item(item, function, ItemKind::Sleep, format!("sleep:{}", op.id), until)
                            .with_payload(json!({ "step_id": op.id })),
                    ));
                }
                OpcodeKind::WaitForEvent => {
                    suspended = true;
                    follow_ups.push(FollowUp::WaitForEvent(self.wait_pause(item, state, op, now)?));
                }
                OpcodeKind::InvokeFunction => {
                    suspended = true;
                    follow_ups.push(self.invoke(item, op, now)?);
                }
                OpcodeKind::RunComplete => {
                    return self.complete(item, op.data.clone().unwrap_or(Value::Null)).await;
                }
                OpcodeKind::StepError => {
                    let failure = op
                        .error
                        .clone()
                        .unwrap_or_else(|| StepFailure::new(format!("step '{}' failed", op.id)));
                    return self.step_failure(item, function, failure).await;
                }
                OpcodeKind::None => {}
            }
        }

        if suspended {
            self.state
                .set_status(item.run_id, RunStatus::Waiting, StatusUpdate::default())
                .await?;
        } else if !planned {
            follow_ups.push(self.continuation(item, function));
        }
        Ok(Outcome::ack_with(follow_ups))
    }

    fn wait_pause(
        &self,
        item: &QueueItem,
        state: &RunState,
        op: &GeneratorOpcode,
        now: DateTime<Utc>,
    ) -> Result<Pause> {
        let opts = op.wait_opts()?;
        let trigger = state
            .trigger_event()
            .map(|e| e.to_value())
            .unwrap_or(Value::Null);
        let expression = opts
            .expression
            .as_deref()
            .map(|expr| interpolate_wait_expression(expr, &trigger))
            .transpose()?;
        Ok(Pause {
            id: PauseId::generate_at(now),
            env_id: item.env_id,
            function_id: item.function_id,
            run_id: item.run_id,
            resumed_from_step_id: op.id.clone(),
            kind: PauseKind::Event,
            bind_as: op.bind_key(&opts),
            event_name: Some(opts.event),
            expression,
            timeout_at: resolve_until(&opts.timeout, now)?,
            invoke_correlation_id: None,
            extras: json!({}),
            created_at: now,
        })
    }

    fn invoke(&self, item: &QueueItem, op: &GeneratorOpcode, now: DateTime<Utc>) -> Result<FollowUp> {
        let opts = op.invoke_opts()?;
        let timeout_at = match &opts.timeout {
            Some(timeout) => resolve_until(timeout, now)?,
            None => now + chrono::Duration::days(DEFAULT_INVOKE_TIMEOUT_DAYS),
        };
        let child_run_id = RunId::generate_at(now);
        let pause = Pause {
            id: PauseId::generate_at(now),
            env_id: item.env_id,
            function_id: item.function_id,
            run_id: item.run_id,
            resumed_from_step_id: op.id.clone(),
            kind: PauseKind::Invoke,
            event_name: None,
            expression: None,
            timeout_at,
            bind_as: op.id.clone(),
            invoke_correlation_id: Some(child_run_id.to_string()),
            extras: json!({ "function_id": opts.function_id }),
            created_at: now,
        };
        Ok(FollowUp::Invoke {
            pause,
            function: opts.function_id,
            payload: opts.payload,
            child_run_id,
        })
    }

    /// A follow-up item of the same run, due at `at`.
    pub fn next_item(
        &self,
        item: &QueueItem,
        function: &Function,
        kind: ItemKind,
        job_key: String,
        at: DateTime<Utc>,
    ) -> QueueItem {
        QueueItem::new(kind, item.run_id, item.function_id, item.env_id, job_key, at)
            .with_priority(item.priority)
            .with_max_attempts(self.config.max_attempts(function.retries()))
            .with_limits(item.concurrency.clone(), None)
    }

    fn continuation(&self, item: &QueueItem, function: &Function) -> FollowUp {
        FollowUp::Enqueue(self.next_item(
            item,
            function,
            ItemKind::Step,
            format!("after:{}", item.id),
            self.clock.now(),
        ))
    }

    async fn complete(&self, item: &QueueItem, output: Value) -> Result<Outcome> {
        let now = self.clock.now();
        let update = StatusUpdate {
            output: Some(output.clone()),
            ..StatusUpdate::ended(now)
        };
        if !self
            .state
            .set_status(item.run_id, RunStatus::Completed, update)
            .await?
        {
            return Ok(Outcome::ack());
        }
        info!("Run completed");
        Ok(Outcome::ack_with(vec![FollowUp::Finished {
            status: RunStatus::Completed,
            output: Some(output),
            error: None,
        }]))
    }

    async fn fail(&self, item: &QueueItem, failure: StepFailure) -> Result<Outcome> {
        let now = self.clock.now();
        let update = StatusUpdate {
            error: Some(failure.clone()),
            ..StatusUpdate::ended(now)
        };
        if !self
            .state
            .set_status(item.run_id, RunStatus::Failed, update)
            .await?
        {
            return Ok(Outcome::ack());
        }
        warn!(message = %failure.message, "Run failed");
        Ok(Outcome::ack_with(vec![FollowUp::Finished {
            status: RunStatus::Failed,
            output: None,
            error: Some(failure),
        }]))
    }

    async fn step_failure(&self, item: &QueueItem, function: &Function, failure: StepFailure) -> Result<Outcome> {
        let failures = item.step_failures();
        if failures < function.retries() {
            let at = self.clock.now() + to_chrono(self.config.backoff(failures));
            info!(message = %failure.message, failures, %at, "Step failed; retrying");
            return Ok(Outcome::retry(at, false));
        }
        self.fail(item, failure).await
    }

    async fn infra_failure(&self, item: &QueueItem, message: String) -> Result<Outcome> {
        if item.infra_attempts < self.config.max_infra_retries {
            let at = self.clock.now() + to_chrono(self.config.backoff(item.infra_attempts));
            warn!(error = %message, infra_attempts = item.infra_attempts, %at, "Infrastructure error; retrying");
            return Ok(Outcome::retry(at, true));
        }
        let failure = StepFailure {
            name: Some("InfrastructureError".to_string()),
            message,
            stack: None,
        };
        self.fail(item, failure).await
    }
}
