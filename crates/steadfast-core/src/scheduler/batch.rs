// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flushes event batches whose timeout passed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{error, info};

use crate::error::Result;
use crate::lifecycle::Lifecycle;

#[derive(Debug, Clone)]
pub struct BatchSchedulerConfig {
    pub poll_interval: Duration,
}

impl Default for BatchSchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
        }
    }
}

pub struct BatchScheduler {
    lifecycle: Arc<Lifecycle>,
    config: BatchSchedulerConfig,
    shutdown: Arc<Notify>,
}

impl BatchScheduler {
    pub fn new(lifecycle: Arc<Lifecycle>, config: BatchSchedulerConfig) -> Self {
        Self {
            lifecycle,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub async fn run(self) {
        info!("Batch scheduler started");
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Batch scheduler shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Failed to flush batches");
                    }
                }
            }
        }
    }

    pub async fn tick(&self) -> Result<usize> {
        Ok(self.lifecycle.flush_batches().await?.len())
    }
}
