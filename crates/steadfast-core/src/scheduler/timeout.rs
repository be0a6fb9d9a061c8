// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pause timeout scanner.
//!
//! Timeouts are also scheduled as queue items when a run starts waiting. The
//! scan covers pauses whose item was lost with the in-process queue, and
//! cancel-rule pauses, which have no item.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::lifecycle::Lifecycle;

/// Timeout scheduler configuration.
#[derive(Debug, Clone)]
pub struct TimeoutSchedulerConfig {
    /// How often to scan for expired pauses
    pub scan_interval: Duration,
    /// Maximum pauses expired per scan
    pub batch_size: usize,
}

impl Default for TimeoutSchedulerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(1),
            batch_size: 500,
        }
    }
}

pub struct TimeoutScheduler {
    lifecycle: Arc<Lifecycle>,
    config: TimeoutSchedulerConfig,
    shutdown: Arc<Notify>,
}

impl TimeoutScheduler {
    pub fn new(lifecycle: Arc<Lifecycle>, config: TimeoutSchedulerConfig) -> Self {
        Self {
            lifecycle,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the scan loop until shutdown.
    pub async fn run(self) {
        info!(
            scan_interval_ms = self.config.scan_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Timeout scheduler started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Timeout scheduler shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.scan_interval) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Failed to expire pauses");
                    }
                }
            }
        }
    }

    /// Expire due pauses until fewer than a full batch is left.
    pub async fn tick(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let expired = self.lifecycle.expire_pauses(self.config.batch_size).await?;
            total += expired;
            if expired < self.config.batch_size {
                break;
            }
        }
        if total > 0 {
            debug!(expired = total, "Pauses timed out");
        }
        Ok(total)
    }
}
