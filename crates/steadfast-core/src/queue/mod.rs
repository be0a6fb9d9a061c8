// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Partitioned work queue.
//!
//! Items are sharded into one partition per function. Workers lease a
//! partition, pick due items from it, and lease those items individually;
//! the partition lease is only held while choosing. Item leases carry the
//! concurrency slots the item took, so acking, nacking or reaping an expired
//! lease gives them back.
//!
//! Enqueue is idempotent on `(run_id, job_key, attempt)`: a duplicate of a
//! live item, or of one already acked for a still-live run, is dropped.

pub mod backoff;
pub mod concurrency;
pub mod partition;
pub mod throttle;

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::QueueError;
use crate::id::{EnvId, FunctionId, QueueItemId, RunId};

pub use concurrency::{ConcurrencyCounters, ConcurrencyKey};
pub use partition::PartitionLease;
pub use throttle::{Gcra, Rate};

use partition::{HeldLease, Partition, ReadyKey};

/// Key of the implicit account-wide concurrency bucket.
pub const ACCOUNT_CONCURRENCY_KEY: &str = "account";

/// Queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Ceiling on in-flight items across every function; 0 means unlimited.
    pub account_concurrency: u32,
    /// How long an empty, unleased partition is kept before it is dropped.
    pub partition_eviction: Duration,
    /// Upper bound of the random delay added to a throttled item's retry time.
    pub throttle_jitter: Duration,
    /// Oldest dead letters are discarded past this many.
    pub dead_letter_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            account_concurrency: 0,
            partition_eviction: Duration::from_secs(60),
            throttle_jitter: Duration::from_millis(100),
            dead_letter_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// First call of a new run.
    Start,
    /// Follow-up call after a step result or a planned step.
    Step,
    /// Wake-up after a sleep.
    Sleep,
    /// Wake-up after a pause was consumed or timed out.
    Resume,
    /// Cancel the run when dispatched.
    Cancel,
}

/// Dequeue-side throttle bucket an item is admitted through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleKey {
    pub key: String,
    pub rate: Rate,
}

/// A unit of work for one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueItem {
    pub id: QueueItemId,
    pub kind: ItemKind,
    pub run_id: RunId,
    pub function_id: FunctionId,
    pub env_id: EnvId,
    /// Completed dispatches of this item, infra failures included.
    pub attempt: u32,
    /// The subset of `attempt` that failed for infrastructure reasons.
    pub infra_attempts: u32,
    pub max_attempts: u32,
    pub earliest_at: DateTime<Utc>,
    pub priority: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Idempotency key within the run, e.g. `start` or `resume:<pause_id>`.
    pub job_key: String,
    pub payload: Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub concurrency: Vec<ConcurrencyKey>,
    #[serde(skip)]
    pub throttle: Option<ThrottleKey>,
    /// Lease this copy was handed out under; 0 when unleased. `ack`, `nack`
    /// and `renew_item` reject any other token.
    #[serde(skip)]
    pub lease_token: u64,
}

impl QueueItem {
    pub fn new(
        kind: ItemKind,
        run_id: RunId,
        function_id: FunctionId,
        env_id: EnvId,
        job_key: impl Into<String>,
        earliest_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: QueueItemId::generate(),
            kind,
            run_id,
            function_id,
            env_id,
            attempt: 0,
            infra_attempts: 0,
            max_attempts: 1,
            earliest_at,
            priority: 0,
            step_id: None,
            job_key: job_key.into(),
            payload: Value::Null,
            concurrency: Vec::new(),
            throttle: None,
            lease_token: 0,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_limits(mut self, concurrency: Vec<ConcurrencyKey>, throttle: Option<ThrottleKey>) -> Self {
        self.concurrency = concurrency;
        self.throttle = throttle;
        self
    }

    /// Failed dispatches that count against the function's retry policy.
    pub fn step_failures(&self) -> u32 {
        self.attempt.saturating_sub(self.infra_attempts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    MaxAttempts,
    Drained,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
    pub item: QueueItem,
    pub reason: DeadLetterReason,
    pub at: DateTime<Utc>,
}

/// Result of a nack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Nacked {
    Retrying { at: DateTime<Utc> },
    DeadLettered,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueMetrics {
    pub enqueued: u64,
    pub duplicates: u64,
    pub throttled: u64,
    pub rate_limited: u64,
    pub dead_lettered: u64,
    pub partition_concurrency_limit_total: u64,
}

type IdempotencyKey = (RunId, String, u32);

#[derive(Debug)]
struct ItemLease {
    token: u64,
    expires_at: DateTime<Utc>,
    keys: Vec<ConcurrencyKey>,
}

#[derive(Debug)]
struct Entry {
    item: QueueItem,
    seq: u64,
    /// Attempt at enqueue time; the idempotency key never changes.
    enqueued_attempt: u32,
    lease: Option<ItemLease>,
    /// Passed the throttle once; retries are not throttled again.
    admitted: bool,
}

impl Entry {
    fn ready_key(&self) -> ReadyKey {
        (
            self.item.earliest_at,
            Reverse(self.item.priority),
            self.seq,
            self.item.id,
        )
    }

    /// Fails unless `token` is the item's current lease, or 0 for an
    /// unleased item.
    fn check_holder(&self, token: u64) -> Result<(), QueueError> {
        let held = self.lease.as_ref().map_or(0, |l| l.token);
        if held == token {
            Ok(())
        } else {
            Err(QueueError::LeaseExpired)
        }
    }

    fn idempotency_key(&self) -> IdempotencyKey {
        (
            self.item.run_id,
            self.item.job_key.clone(),
            self.enqueued_attempt,
        )
    }
}

#[derive(Debug, Default)]
struct Inner {
    items: HashMap<QueueItemId, Entry>,
    partitions: HashMap<FunctionId, Partition>,
    keys: HashMap<IdempotencyKey, QueueItemId>,
    /// Keys of acked items, per run, until the run's items are removed.
    done: HashMap<RunId, HashSet<(String, u32)>>,
    leased_runs: HashMap<RunId, QueueItemId>,
    counters: ConcurrencyCounters,
    throttles: Gcra,
    rate_limits: Gcra,
    dead: VecDeque<DeadLetter>,
    seq: u64,
    lease_token: u64,
    metrics: QueueMetrics,
}

impl Inner {
    /// Take `id` out of the index and give back whatever its lease held.
    fn take(&mut self, id: QueueItemId) -> Option<Entry> {
        let entry = self.items.remove(&id)?;
        self.keys.remove(&entry.idempotency_key());
        if let Some(partition) = self.partitions.get_mut(&entry.item.function_id) {
            partition.ready.remove(&entry.ready_key());
            partition.items = partition.items.saturating_sub(1);
        }
        if let Some(lease) = &entry.lease {
            self.counters.release(&lease.keys);
        }
        if self.leased_runs.get(&entry.item.run_id) == Some(&id) {
            self.leased_runs.remove(&entry.item.run_id);
        }
        Some(entry)
    }

    /// Return a leased entry to its partition's ready set.
    fn unlease(&mut self, id: QueueItemId) {
        let Some(entry) = self.items.get_mut(&id) else {
            return;
        };
        if let Some(lease) = entry.lease.take() {
            self.counters.release(&lease.keys);
        }
        entry.item.lease_token = 0;
        if self.leased_runs.get(&entry.item.run_id) == Some(&id) {
            self.leased_runs.remove(&entry.item.run_id);
        }
        if let Some(partition) = self.partitions.get_mut(&entry.item.function_id) {
            partition.ready.insert(entry.ready_key());
        }
    }

    fn dead_letter(&mut self, item: QueueItem, reason: DeadLetterReason, at: DateTime<Utc>, capacity: usize) {
        warn!(
            item_id = %item.id,
            run_id = %item.run_id,
            fn_id = %item.function_id,
            attempt = item.attempt,
            ?reason,
            "Queue item moved to dead-letter queue"
        );
        self.metrics.dead_lettered += 1;
        self.dead.push_back(DeadLetter { item, reason, at });
        while self.dead.len() > capacity {
            self.dead.pop_front();
        }
    }

    /// First due item of `partition` whose run has nothing else leased.
    fn first_dispatchable(&self, partition: &Partition, now: DateTime<Utc>) -> Option<&Entry> {
        partition
            .ready
            .iter()
            .take_while(|(at, ..)| *at <= now)
            .filter_map(|(.., id)| self.items.get(id))
            .find(|entry| !self.leased_runs.contains_key(&entry.item.run_id))
    }
}

/// The partitioned queue.
#[derive(Debug)]
pub struct Queue {
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl Queue {
    pub fn new(config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            inner: Mutex::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn account_key(&self) -> Option<ConcurrencyKey> {
        (self.config.account_concurrency > 0)
            .then(|| ConcurrencyKey::new(ACCOUNT_CONCURRENCY_KEY, self.config.account_concurrency))
    }

    /// Add `item`. Returns `false` when it duplicates a live or acked item.
    pub fn enqueue(&self, item: QueueItem) -> bool {
        let now = self.clock.now();
        let mut guard = self.lock();
        let inner = &mut *guard;

        let key = (item.run_id, item.job_key.clone(), item.attempt);
        let acked = inner
            .done
            .get(&item.run_id)
            .is_some_and(|done| done.contains(&(key.1.clone(), key.2)));
        if acked || inner.keys.contains_key(&key) || inner.items.contains_key(&item.id) {
            inner.metrics.duplicates += 1;
            debug!(run_id = %item.run_id, job_key = %item.job_key, "Duplicate enqueue dropped");
            return false;
        }

        inner.seq += 1;
        let entry = Entry {
            enqueued_attempt: item.attempt,
            seq: inner.seq,
            lease: None,
            admitted: false,
            item,
        };
        let partition = inner
            .partitions
            .entry(entry.item.function_id)
            .or_insert_with(|| Partition::new(entry.item.function_id));
        partition.ready.insert(entry.ready_key());
        partition.items += 1;
        partition.track_emptiness(now);

        inner.keys.insert(key, entry.item.id);
        inner.metrics.enqueued += 1;
        debug!(
            item_id = %entry.item.id,
            run_id = %entry.item.run_id,
            kind = ?entry.item.kind,
            earliest_at = %entry.item.earliest_at,
            "Enqueued"
        );
        inner.items.insert(entry.item.id, entry);
        true
    }

    /// Take one unit from the enqueue-side rate limit bucket `key`.
    pub fn check_rate_limit(&self, key: &str, rate: Rate) -> bool {
        let now = self.clock.now();
        let mut inner = self.lock();
        match inner.rate_limits.check(key, rate, now) {
            Ok(()) => true,
            Err(_) => {
                inner.metrics.rate_limited += 1;
                false
            }
        }
    }

    /// Lease up to `scan_limit` partitions with due work, lowest pointer first.
    ///
    /// A partition whose next dispatchable item has no concurrency capacity is
    /// skipped and backed off.
    pub fn lease_partition(&self, worker: &str, scan_limit: usize, ttl: Duration) -> Vec<PartitionLease> {
        let now = self.clock.now();
        let account = self.account_key();
        let mut guard = self.lock();
        let inner = &mut *guard;

        let mut candidates: Vec<(DateTime<Utc>, FunctionId)> = inner
            .partitions
            .values()
            .filter(|p| !p.is_leased(now) && !p.in_backoff(now))
            .filter_map(|p| p.pointer_score().filter(|at| *at <= now).map(|at| (at, p.id)))
            .collect();
        candidates.sort();

        let mut leases = Vec::new();
        for (_, fn_id) in candidates {
            if leases.len() >= scan_limit {
                break;
            }
            let Some(partition) = inner.partitions.get(&fn_id) else {
                continue;
            };
            let Some(head) = inner.first_dispatchable(partition, now) else {
                continue;
            };
            let keys: Vec<&ConcurrencyKey> = head.item.concurrency.iter().chain(account.iter()).collect();
            if let Some(full) = inner.counters.saturated(keys) {
                debug!(fn_id = %fn_id, key = full, "Partition at concurrency limit");
                inner.metrics.partition_concurrency_limit_total += 1;
                if let Some(partition) = inner.partitions.get_mut(&fn_id) {
                    back_off(partition, now);
                }
                continue;
            }

            inner.lease_token += 1;
            let token = inner.lease_token;
            let expires_at = now + to_chrono(ttl);
            if let Some(partition) = inner.partitions.get_mut(&fn_id) {
                partition.gate_failures = 0;
                partition.lease = Some(HeldLease {
                    worker: worker.to_string(),
                    token,
                    expires_at,
                });
                leases.push(PartitionLease {
                    partition: fn_id,
                    worker: worker.to_string(),
                    token,
                    expires_at,
                });
            }
        }
        leases
    }

    /// Extend a held partition lease.
    pub fn renew_partition(&self, lease: &PartitionLease, ttl: Duration) -> Result<PartitionLease, QueueError> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let partition = inner
            .partitions
            .get_mut(&lease.partition)
            .ok_or(QueueError::NotFound)?;
        if !partition.holds(lease, now) {
            return Err(QueueError::LeaseExpired);
        }
        let expires_at = now + to_chrono(ttl);
        if let Some(held) = partition.lease.as_mut() {
            held.expires_at = expires_at;
        }
        Ok(PartitionLease {
            expires_at,
            ..lease.clone()
        })
    }

    /// Give a partition back without delaying it.
    pub fn release_partition(&self, lease: &PartitionLease) {
        let mut inner = self.lock();
        if let Some(partition) = inner.partitions.get_mut(&lease.partition)
            && partition
                .lease
                .as_ref()
                .is_some_and(|l| l.token == lease.token && l.worker == lease.worker)
        {
            partition.lease = None;
        }
    }

    /// Release a partition and keep it out of scans until `next_at`.
    pub fn requeue_partition(&self, partition_id: FunctionId, next_at: DateTime<Utc>) {
        let now = self.clock.now();
        let mut inner = self.lock();
        if let Some(partition) = inner.partitions.get_mut(&partition_id) {
            partition.lease = None;
            partition.not_before = (next_at > now).then_some(next_at);
        }
    }

    /// Due items of a leased partition in dispatch order, skipping runs that
    /// already have an item in flight.
    pub fn peek(&self, lease: &PartitionLease, limit: usize) -> Result<Vec<QueueItemId>, QueueError> {
        let now = self.clock.now();
        let inner = self.lock();
        let partition = inner
            .partitions
            .get(&lease.partition)
            .ok_or(QueueError::NotFound)?;
        if !partition.holds(lease, now) {
            return Err(QueueError::LeaseExpired);
        }
        let mut runs = HashSet::new();
        Ok(partition
            .ready
            .iter()
            .take_while(|(at, ..)| *at <= now)
            .filter_map(|(.., id)| inner.items.get(id))
            .filter(|e| !inner.leased_runs.contains_key(&e.item.run_id))
            .filter(|e| runs.insert(e.item.run_id))
            .take(limit)
            .map(|e| e.item.id)
            .collect())
    }

    /// Lease one item of a held partition.
    ///
    /// Takes a slot in every concurrency bucket of the item. A start item
    /// with a throttle that has no capacity is pushed back to when the bucket
    /// refills and `Throttled` is returned.
    pub fn lease_item(
        &self,
        lease: &PartitionLease,
        item_id: QueueItemId,
        ttl: Duration,
    ) -> Result<QueueItem, QueueError> {
        let now = self.clock.now();
        let account = self.account_key();
        let mut guard = self.lock();
        let inner = &mut *guard;

        let partition = inner
            .partitions
            .get_mut(&lease.partition)
            .ok_or(QueueError::NotFound)?;
        if !partition.holds(lease, now) {
            return Err(QueueError::LeaseExpired);
        }
        let entry = inner.items.get_mut(&item_id).ok_or(QueueError::NotFound)?;
        if entry.item.function_id != lease.partition || entry.item.earliest_at > now {
            return Err(QueueError::NotFound);
        }
        if entry.lease.is_some() {
            return Err(QueueError::AlreadyLeased);
        }
        if inner
            .leased_runs
            .get(&entry.item.run_id)
            .is_some_and(|id| *id != item_id)
        {
            return Err(QueueError::AlreadyLeased);
        }

        let keys: Vec<ConcurrencyKey> = entry
            .item
            .concurrency
            .iter()
            .cloned()
            .chain(account)
            .collect();
        if let Some(full) = inner.counters.saturated(&keys) {
            let key = full.to_string();
            inner.metrics.partition_concurrency_limit_total += 1;
            back_off(partition, now);
            return Err(QueueError::ConcurrencyLimited { key });
        }

        if entry.item.kind == ItemKind::Start && !entry.admitted {
            if let Some(throttle) = entry.item.throttle.clone()
                && let Err(refill_at) = inner.throttles.check(&throttle.key, throttle.rate, now)
            {
                let retry_at = refill_at + jitter(self.config.throttle_jitter);
                partition.ready.remove(&entry.ready_key());
                entry.item.earliest_at = retry_at;
                partition.ready.insert(entry.ready_key());
                inner.metrics.throttled += 1;
                debug!(run_id = %entry.item.run_id, %retry_at, "Start throttled");
                return Err(QueueError::Throttled { retry_at });
            }
            entry.admitted = true;
        }

        inner
            .counters
            .acquire(&keys)
            .map_err(|key| QueueError::ConcurrencyLimited { key })?;
        partition.ready.remove(&entry.ready_key());
        partition.gate_failures = 0;
        inner.lease_token += 1;
        entry.lease = Some(ItemLease {
            token: inner.lease_token,
            expires_at: now + to_chrono(ttl),
            keys,
        });
        entry.item.lease_token = inner.lease_token;
        inner.leased_runs.insert(entry.item.run_id, item_id);
        Ok(entry.item.clone())
    }

    /// Extend an item lease that is still held under `lease_token`.
    pub fn renew_item(
        &self,
        item_id: QueueItemId,
        lease_token: u64,
        ttl: Duration,
    ) -> Result<DateTime<Utc>, QueueError> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let entry = inner.items.get_mut(&item_id).ok_or(QueueError::NotFound)?;
        match entry.lease.as_mut() {
            Some(lease) if lease.token == lease_token && lease.expires_at > now => {
                lease.expires_at = now + to_chrono(ttl);
                Ok(lease.expires_at)
            }
            _ => Err(QueueError::LeaseExpired),
        }
    }

    /// Remove a finished item. `lease_token` must be the item's current
    /// lease; a holder whose lease was reaped gets `LeaseExpired`.
    pub fn ack(&self, item_id: QueueItemId, lease_token: u64) -> Result<(), QueueError> {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner
            .items
            .get(&item_id)
            .ok_or(QueueError::NotFound)?
            .check_holder(lease_token)?;
        let entry = inner.take(item_id).ok_or(QueueError::NotFound)?;
        inner
            .done
            .entry(entry.item.run_id)
            .or_default()
            .insert((entry.item.job_key.clone(), entry.enqueued_attempt));
        if let Some(partition) = inner.partitions.get_mut(&entry.item.function_id) {
            partition.track_emptiness(now);
        }
        Ok(())
    }

    /// Record a failed dispatch and schedule the next one at `retry_at`, or
    /// dead-letter the item once it reaches `max_attempts`.
    pub fn nack(
        &self,
        item_id: QueueItemId,
        lease_token: u64,
        retry_at: Option<DateTime<Utc>>,
        infra: bool,
    ) -> Result<Nacked, QueueError> {
        let now = self.clock.now();
        let mut guard = self.lock();
        let inner = &mut *guard;

        let entry = inner.items.get(&item_id).ok_or(QueueError::NotFound)?;
        entry.check_holder(lease_token)?;
        let exhausted = entry.item.attempt + 1 >= entry.item.max_attempts;
        if exhausted {
            if let Some(mut entry) = inner.take(item_id) {
                entry.item.attempt += 1;
                if infra {
                    entry.item.infra_attempts += 1;
                }
                let function_id = entry.item.function_id;
                inner.dead_letter(entry.item, DeadLetterReason::MaxAttempts, now, self.config.dead_letter_capacity);
                if let Some(partition) = inner.partitions.get_mut(&function_id) {
                    partition.track_emptiness(now);
                }
            }
            return Ok(Nacked::DeadLettered);
        }

        inner.unlease(item_id);
        let at = retry_at.unwrap_or(now);
        if let Some(entry) = inner.items.get_mut(&item_id)
            && let Some(partition) = inner.partitions.get_mut(&entry.item.function_id)
        {
            partition.ready.remove(&entry.ready_key());
            entry.item.attempt += 1;
            if infra {
                entry.item.infra_attempts += 1;
            }
            entry.item.earliest_at = at;
            partition.ready.insert(entry.ready_key());
        }
        Ok(Nacked::Retrying { at })
    }

    /// Return items with expired leases to their partitions, clear expired
    /// partition leases, and drop partitions that stayed empty. Attempts are
    /// left untouched. Returns the number of reaped items.
    pub fn reap_expired(&self) -> usize {
        let now = self.clock.now();
        let eviction = to_chrono(self.config.partition_eviction);
        let mut inner = self.lock();

        let expired: Vec<QueueItemId> = inner
            .items
            .values()
            .filter(|e| e.lease.as_ref().is_some_and(|l| l.expires_at <= now))
            .map(|e| e.item.id)
            .collect();
        for id in &expired {
            warn!(item_id = %id, "Item lease expired; returning to partition");
            inner.unlease(*id);
        }

        inner.partitions.retain(|_, p| {
            if p.lease.as_ref().is_some_and(|l| l.expires_at <= now) {
                p.lease = None;
            }
            !(p.lease.is_none() && p.empty_since.is_some_and(|since| since + eviction <= now))
        });
        inner.throttles.evict_idle(now);
        inner.rate_limits.evict_idle(now);
        expired.len()
    }

    /// Move every unleased item of a partition to the dead-letter queue.
    pub fn drain(&self, partition_id: FunctionId) -> usize {
        let now = self.clock.now();
        let mut inner = self.lock();
        let ids: Vec<QueueItemId> = match inner.partitions.get(&partition_id) {
            Some(p) => p.ready.iter().map(|(.., id)| *id).collect(),
            None => return 0,
        };
        for id in &ids {
            if let Some(entry) = inner.take(*id) {
                inner.dead_letter(entry.item, DeadLetterReason::Drained, now, self.config.dead_letter_capacity);
            }
        }
        if let Some(partition) = inner.partitions.get_mut(&partition_id) {
            partition.track_emptiness(now);
        }
        ids.len()
    }

    /// Drop every item of a run, leased or not, and forget its acked keys.
    pub fn remove_run_items(&self, run_id: RunId) -> usize {
        let now = self.clock.now();
        let mut inner = self.lock();
        let ids: Vec<QueueItemId> = inner
            .items
            .values()
            .filter(|e| e.item.run_id == run_id)
            .map(|e| e.item.id)
            .collect();
        for id in &ids {
            if let Some(entry) = inner.take(*id)
                && let Some(partition) = inner.partitions.get_mut(&entry.item.function_id)
            {
                partition.track_emptiness(now);
            }
        }
        inner.done.remove(&run_id);
        ids.len()
    }

    /// Move an unleased item to a new time.
    pub fn reschedule(&self, item_id: QueueItemId, at: DateTime<Utc>) -> Result<(), QueueError> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let entry = inner.items.get_mut(&item_id).ok_or(QueueError::NotFound)?;
        if entry.lease.is_some() {
            return Err(QueueError::AlreadyLeased);
        }
        let partition = inner
            .partitions
            .get_mut(&entry.item.function_id)
            .ok_or(QueueError::NotFound)?;
        partition.ready.remove(&entry.ready_key());
        entry.item.earliest_at = at;
        partition.ready.insert(entry.ready_key());
        Ok(())
    }

    pub fn find(&self, item_id: QueueItemId) -> Option<QueueItem> {
        self.lock().items.get(&item_id).map(|e| e.item.clone())
    }

    pub fn items_for_run(&self, run_id: RunId) -> Vec<QueueItem> {
        let inner = self.lock();
        let mut items: Vec<&Entry> = inner
            .items
            .values()
            .filter(|e| e.item.run_id == run_id)
            .collect();
        items.sort_by_key(|e| e.seq);
        items.into_iter().map(|e| e.item.clone()).collect()
    }

    /// Items currently holding a slot in the concurrency bucket `key`.
    pub fn in_flight(&self, key: &str) -> u32 {
        self.lock().counters.in_flight(key)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().dead.iter().cloned().collect()
    }

    pub fn metrics(&self) -> QueueMetrics {
        self.lock().metrics
    }

    /// Items in a partition, leased included.
    pub fn pending(&self, partition_id: FunctionId) -> usize {
        self.lock()
            .partitions
            .get(&partition_id)
            .map_or(0, |p| p.items)
    }

    /// Earliest time any unleased item becomes due.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.lock()
            .partitions
            .values()
            .filter_map(Partition::pointer_score)
            .min()
    }

    pub fn partition_count(&self) -> usize {
        self.lock().partitions.len()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn back_off(partition: &mut Partition, now: DateTime<Utc>) {
    let delay = backoff::partition_backoff(partition.gate_failures);
    partition.gate_failures = partition.gate_failures.saturating_add(1);
    partition.not_before = Some(now + to_chrono(delay));
}

fn jitter(max: Duration) -> chrono::Duration {
    let millis = max.as_millis() as i64;
    if millis <= 0 {
        return chrono::Duration::zero();
    }
    chrono::Duration::milliseconds(rand::thread_rng().gen_range(0..=millis))
}

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}
