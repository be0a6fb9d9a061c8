// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue workers.
//!
//! Each worker loop leases partitions with due work, takes the head item of
//! every partition it got, gives the partition back and dispatches the item
//! through the lifecycle. The items of one scan are dispatched concurrently;
//! a heartbeat renews each item lease while its step executes, and the lease
//! token fences off acks from a worker whose lease was reaped.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::{QueueError, Result};
use crate::executor::Disposition;
use crate::lifecycle::Lifecycle;
use crate::queue::backoff::{exponential, with_jitter};
use crate::queue::{Nacked, PartitionLease, QueueItem};

/// Floor of the retry delay after the lifecycle itself errored.
const PROCESS_RETRY_BASE: Duration = Duration::from_secs(1);
const PROCESS_RETRY_MAX: Duration = Duration::from_secs(60);
/// Leases are renewed this many times per TTL.
const RENEWALS_PER_TTL: u32 = 3;
const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(10);

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent worker loops
    pub workers: usize,
    /// Lease duration of partitions and items
    pub lease_ttl: Duration,
    /// Sleep between scans that found nothing to do
    pub poll_interval: Duration,
    /// Partitions leased per scan
    pub scan_limit: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 100,
            lease_ttl: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            scan_limit: 16,
        }
    }
}

/// One worker loop.
pub struct Worker {
    id: String,
    lifecycle: Arc<Lifecycle>,
    config: WorkerPoolConfig,
}

impl Worker {
    pub fn new(id: impl Into<String>, lifecycle: Arc<Lifecycle>, config: WorkerPoolConfig) -> Self {
        Self {
            id: id.into(),
            lifecycle,
            config,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!(worker = %self.id, "Worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let processed = match self.tick().await {
                Ok(n) => n,
                Err(e) => {
                    error!(worker = %self.id, error = %e, "Worker tick failed");
                    0
                }
            };
            if processed > 0 {
                continue;
            }
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        debug!(worker = %self.id, "Worker stopped");
    }

    /// One scan: lease partitions and dispatch one item from each. Returns
    /// the number of items dispatched.
    pub async fn tick(&self) -> Result<usize> {
        let queue = self.lifecycle.queue();
        let reaped = queue.reap_expired();
        if reaped > 0 {
            debug!(worker = %self.id, reaped, "Reaped expired leases");
        }

        let leases = queue.lease_partition(&self.id, self.config.scan_limit, self.config.lease_ttl);
        let mut items = Vec::with_capacity(leases.len());
        for lease in &leases {
            let item = self.take_head(lease);
            queue.release_partition(lease);
            if let Some(item) = item {
                items.push(item);
            }
        }

        let dispatched = items.len();
        join_all(items.into_iter().map(|item| self.dispatch(item))).await;
        Ok(dispatched)
    }

    fn take_head(&self, lease: &PartitionLease) -> Option<QueueItem> {
        let queue = self.lifecycle.queue();
        let head = match queue.peek(lease, 1) {
            Ok(ids) => ids.into_iter().next()?,
            Err(e) => {
                debug!(partition = %lease.partition, error = %e, "Peek failed");
                return None;
            }
        };
        match queue.lease_item(lease, head, self.config.lease_ttl) {
            Ok(item) => Some(item),
            Err(QueueError::Throttled { retry_at }) => {
                debug!(partition = %lease.partition, %retry_at, "Partition throttled");
                None
            }
            Err(QueueError::ConcurrencyLimited { key }) => {
                debug!(partition = %lease.partition, key, "Partition at concurrency limit");
                None
            }
            Err(e) => {
                debug!(partition = %lease.partition, item_id = %head, error = %e, "Item lease failed");
                None
            }
        }
    }

    /// Run the lifecycle for `item`, renewing its lease until it returns.
    async fn process_leased(&self, item: &QueueItem) -> Result<Disposition> {
        let queue = self.lifecycle.queue();
        let ttl = self.config.lease_ttl;
        let mut heartbeat = tokio::time::interval((ttl / RENEWALS_PER_TTL).max(MIN_RENEW_INTERVAL));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        heartbeat.tick().await;

        let process = self.lifecycle.process(item);
        tokio::pin!(process);
        loop {
            tokio::select! {
                result = &mut process => return result,
                _ = heartbeat.tick() => {
                    if let Err(e) = queue.renew_item(item.id, item.lease_token, ttl) {
                        warn!(
                            worker = %self.id,
                            item_id = %item.id,
                            error = %e,
                            "Item lease renewal failed"
                        );
                    }
                }
            }
        }
    }

    async fn dispatch(&self, item: QueueItem) {
        let queue = self.lifecycle.queue();
        let disposition = match self.process_leased(&item).await {
            Ok(disposition) => disposition,
            Err(e) => {
                let delay = with_jitter(
                    exponential(item.attempt, PROCESS_RETRY_BASE, PROCESS_RETRY_MAX),
                    0.2,
                );
                let at = self.lifecycle.clock().now()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::seconds(1));
                error!(
                    worker = %self.id,
                    run_id = %item.run_id,
                    item_id = %item.id,
                    error = %e,
                    "Processing failed; retrying"
                );
                Disposition::Retry { at, infra: true }
            }
        };

        match disposition {
            Disposition::Ack => match queue.ack(item.id, item.lease_token) {
                Ok(()) | Err(QueueError::NotFound) => {}
                Err(QueueError::LeaseExpired) => {
                    warn!(worker = %self.id, item_id = %item.id, "Item lease lost before ack");
                }
                Err(e) => warn!(item_id = %item.id, error = %e, "Ack failed"),
            },
            Disposition::Retry { at, infra } => match queue.nack(item.id, item.lease_token, Some(at), infra) {
                Ok(Nacked::Retrying { at }) => {
                    debug!(run_id = %item.run_id, %at, infra, "Item scheduled for retry");
                }
                Ok(Nacked::DeadLettered) => {
                    warn!(run_id = %item.run_id, job_key = %item.job_key, "Item dead-lettered");
                    if let Err(e) = self.lifecycle.fail_dead_lettered(&item).await {
                        error!(run_id = %item.run_id, error = %e, "Failed to fail dead-lettered run");
                    }
                }
                Err(QueueError::NotFound) => {}
                Err(QueueError::LeaseExpired) => {
                    warn!(worker = %self.id, item_id = %item.id, "Item lease lost before nack");
                }
                Err(e) => warn!(item_id = %item.id, error = %e, "Nack failed"),
            },
        }
    }
}

/// A fixed number of worker loops sharing one lifecycle.
pub struct WorkerPool {
    lifecycle: Arc<Lifecycle>,
    config: WorkerPoolConfig,
    shutdown: Arc<Notify>,
}

impl WorkerPool {
    pub fn new(lifecycle: Arc<Lifecycle>, config: WorkerPoolConfig) -> Self {
        Self {
            lifecycle,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run every worker until shutdown, then wait for in-flight items.
    pub async fn run(self) {
        info!(
            workers = self.config.workers,
            lease_ttl_ms = self.config.lease_ttl.as_millis() as u64,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            scan_limit = self.config.scan_limit,
            "Worker pool started"
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let handles: Vec<JoinHandle<()>> = (0..self.config.workers.max(1))
            .map(|i| {
                let worker = Worker::new(
                    format!("worker-{i}"),
                    self.lifecycle.clone(),
                    self.config.clone(),
                );
                tokio::spawn(worker.run(stop_rx.clone()))
            })
            .collect();

        self.shutdown.notified().await;
        info!("Worker pool shutting down");
        let _ = stop_tx.send(true);
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Worker task panicked: {}", e);
            }
        }
        info!("Worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::function::tests::config;
    use crate::lifecycle::tests::{harness, started};
    use crate::run::RunStatus;
    use serde_json::json;

    fn worker(h: &crate::lifecycle::tests::Harness) -> Worker {
        Worker::new("worker-test", h.lifecycle.clone(), WorkerPoolConfig::default())
    }

    #[tokio::test]
    async fn test_tick_runs_item_to_completion() {
        let h = harness();
        h.sync(config("checkout", "order.created"));
        h.driver.push(200, json!({"ok": true}));
        let run_id = started(&h.send("order.created", json!({"id": 1})).await.runs[0]);

        let w = worker(&h);
        assert_eq!(w.tick().await.unwrap(), 1);
        assert_eq!(h.status(run_id).await, RunStatus::Completed);
        assert!(h.queue.is_empty());
        assert_eq!(w.tick().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_tick_nacks_retry() {
        let h = harness();
        h.sync(config("checkout", "order.created"));
        h.driver.push(500, json!({"error": "boom"}));
        let run_id = started(&h.send("order.created", json!({"id": 1})).await.runs[0]);

        let w = worker(&h);
        assert_eq!(w.tick().await.unwrap(), 1);

        let items = h.queue.items_for_run(run_id);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].attempt, 1);
        assert_eq!(items[0].infra_attempts, 1);
        assert!(items[0].earliest_at > h.clock.now());
        // Not due yet.
        assert_eq!(w.tick().await.unwrap(), 0);
        assert_eq!(h.driver.calls(), 1);
    }

    #[tokio::test]
    async fn test_one_item_per_run_per_scan() {
        let h = harness();
        h.sync(config("a", "order.created"));
        h.sync(config("b", "order.created"));
        h.driver.push(200, json!(1));
        h.driver.push(200, json!(2));
        let result = h.send("order.created", json!({})).await;
        assert_eq!(result.runs.len(), 2);

        let w = worker(&h);
        assert_eq!(w.tick().await.unwrap(), 2);
        for scheduled in &result.runs {
            assert_eq!(h.status(started(scheduled)).await, RunStatus::Completed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_keeps_slow_step_leased() {
        let h = harness();
        h.sync(config("checkout", "order.created"));
        h.driver.push(200, json!({"ok": true}));
        *h.driver.stall.lock().unwrap() = Some(Duration::from_secs(60));
        let run_id = started(&h.send("order.created", json!({"id": 1})).await.runs[0]);

        let w = worker(&h);
        let watcher = async {
            // Offset from the 10s renewal ticks.
            tokio::time::sleep(Duration::from_secs(5)).await;
            for _ in 0..5 {
                h.clock.advance(chrono::Duration::seconds(10));
                assert_eq!(h.queue.reap_expired(), 0);
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
        };
        let (dispatched, ()) = tokio::join!(w.tick(), watcher);

        assert_eq!(dispatched.unwrap(), 1);
        assert_eq!(h.driver.calls(), 1);
        assert_eq!(h.status(run_id).await, RunStatus::Completed);
        assert!(h.queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_dispatches_items_concurrently() {
        let h = harness();
        h.sync(config("a", "order.created"));
        h.sync(config("b", "order.created"));
        h.driver.push(200, json!(1));
        h.driver.push(200, json!(2));
        *h.driver.stall.lock().unwrap() = Some(Duration::from_secs(10));
        h.send("order.created", json!({})).await;

        let begin = tokio::time::Instant::now();
        assert_eq!(worker(&h).tick().await.unwrap(), 2);
        assert!(begin.elapsed() < Duration::from_secs(15));
        assert_eq!(h.driver.calls(), 2);
    }

    #[tokio::test]
    async fn test_pool_stops_on_shutdown() {
        let h = harness();
        let pool = WorkerPool::new(
            h.lifecycle.clone(),
            WorkerPoolConfig {
                workers: 2,
                poll_interval: Duration::from_millis(5),
                ..WorkerPoolConfig::default()
            },
        );
        let shutdown = pool.shutdown_handle();
        let handle = tokio::spawn(pool.run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
