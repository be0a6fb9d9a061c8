// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime.
//!
//! Wires stores, queue, executor and lifecycle together and runs the worker
//! pool and background schedulers.
//!
//! # Example
//!
//! ```ignore
//! use steadfast_core::runtime::SteadfastRuntime;
//!
//! let runtime = SteadfastRuntime::builder()
//!     .database_url("sqlite:.data/steadfast.db?mode=rwc")
//!     .build()?
//!     .start()
//!     .await?;
//!
//! runtime.lifecycle().ingest(event).await?;
//!
//! runtime.shutdown().await?;
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use steadfast_expr::Compiler;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::driver::{Driver, HttpDriver};
use crate::executor::{Executor, ExecutorConfig};
use crate::function::{FunctionConfig, FunctionRegistry};
use crate::lifecycle::{Lifecycle, LifecycleParts};
use crate::migrations;
use crate::pause::{MemoryPauseStore, PauseStore, SqlitePauseStore};
use crate::queue::{Queue, QueueConfig};
use crate::scheduler::{
    BatchScheduler, BatchSchedulerConfig, CronScheduler, CronSchedulerConfig, TimeoutScheduler,
    TimeoutSchedulerConfig,
};
use crate::state::{MemoryStateStore, SqliteStateStore, StateStore};
use crate::worker::{WorkerPool, WorkerPoolConfig};

/// Database URL selecting the in-memory stores.
pub const MEMORY_URL: &str = "memory";

/// Builder for creating a [`SteadfastRuntime`].
pub struct SteadfastRuntimeBuilder {
    database_url: String,
    env_id: Uuid,
    functions_path: Option<PathBuf>,
    functions: Vec<FunctionConfig>,
    matcher_concurrency: usize,
    queue: QueueConfig,
    executor: ExecutorConfig,
    workers: WorkerPoolConfig,
    timeouts: TimeoutSchedulerConfig,
    crons: CronSchedulerConfig,
    batches: BatchSchedulerConfig,
    clock: Option<Arc<dyn Clock>>,
    driver: Option<Arc<dyn Driver>>,
}

impl Default for SteadfastRuntimeBuilder {
    fn default() -> Self {
        Self {
            database_url: MEMORY_URL.to_string(),
            env_id: Uuid::nil(),
            functions_path: None,
            functions: Vec::new(),
            matcher_concurrency: num_cpus::get(),
            queue: QueueConfig::default(),
            executor: ExecutorConfig::default(),
            workers: WorkerPoolConfig::default(),
            timeouts: TimeoutSchedulerConfig::default(),
            crons: CronSchedulerConfig::default(),
            batches: BatchSchedulerConfig::default(),
            clock: None,
            driver: None,
        }
    }
}

impl SteadfastRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from environment configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            database_url: config.database_url.clone(),
            env_id: config.env_id,
            functions_path: config.functions_path.clone(),
            matcher_concurrency: config.matcher_concurrency,
            queue: config.queue.clone(),
            executor: config.executor.clone(),
            workers: config.workers.clone(),
            timeouts: config.timeouts.clone(),
            ..Self::default()
        }
    }

    /// Set the SQLite URL, or [`MEMORY_URL`] for in-memory stores.
    ///
    /// Default: `memory`
    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Set the environment that functions are synced into.
    pub fn env_id(mut self, env_id: Uuid) -> Self {
        self.env_id = env_id;
        self
    }

    /// Sync the function definitions in this JSON file at start.
    pub fn functions_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.functions_path = Some(path.into());
        self
    }

    /// Sync these function definitions at start.
    pub fn functions(mut self, functions: Vec<FunctionConfig>) -> Self {
        self.functions = functions;
        self
    }

    pub fn matcher_concurrency(mut self, concurrency: usize) -> Self {
        self.matcher_concurrency = concurrency;
        self
    }

    pub fn queue_config(mut self, config: QueueConfig) -> Self {
        self.queue = config;
        self
    }

    pub fn executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor = config;
        self
    }

    pub fn worker_config(mut self, config: WorkerPoolConfig) -> Self {
        self.workers = config;
        self
    }

    pub fn timeout_config(mut self, config: TimeoutSchedulerConfig) -> Self {
        self.timeouts = config;
        self
    }

    pub fn cron_config(mut self, config: CronSchedulerConfig) -> Self {
        self.crons = config;
        self
    }

    pub fn batch_config(mut self, config: BatchSchedulerConfig) -> Self {
        self.batches = config;
        self
    }

    /// Override the clock.
    ///
    /// Default: [`SystemClock`]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Override the step driver.
    ///
    /// Default: [`HttpDriver`] with the executor's request timeout
    pub fn driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if a setting is invalid.
    pub fn build(self) -> Result<SteadfastRuntimeConfig> {
        if self.database_url.trim().is_empty() {
            return Err(anyhow::anyhow!("database_url is required"));
        }
        if self.workers.workers == 0 {
            return Err(anyhow::anyhow!("at least one worker is required"));
        }
        let driver: Arc<dyn Driver> = match self.driver {
            Some(driver) => driver,
            None => Arc::new(HttpDriver::new(self.executor.request_timeout)?),
        };

        Ok(SteadfastRuntimeConfig {
            database_url: self.database_url,
            env_id: self.env_id,
            functions_path: self.functions_path,
            functions: self.functions,
            matcher_concurrency: self.matcher_concurrency.max(1),
            queue: self.queue,
            executor: self.executor,
            workers: self.workers,
            timeouts: self.timeouts,
            crons: self.crons,
            batches: self.batches,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            driver,
        })
    }
}

/// Configuration for a [`SteadfastRuntime`].
pub struct SteadfastRuntimeConfig {
    database_url: String,
    env_id: Uuid,
    functions_path: Option<PathBuf>,
    functions: Vec<FunctionConfig>,
    matcher_concurrency: usize,
    queue: QueueConfig,
    executor: ExecutorConfig,
    workers: WorkerPoolConfig,
    timeouts: TimeoutSchedulerConfig,
    crons: CronSchedulerConfig,
    batches: BatchSchedulerConfig,
    clock: Arc<dyn Clock>,
    driver: Arc<dyn Driver>,
}

impl SteadfastRuntimeConfig {
    /// Open the stores and assemble the lifecycle without starting any
    /// background task. Configured functions are synced and state is
    /// recovered.
    pub async fn assemble(&self) -> Result<Arc<Lifecycle>> {
        let (state, pauses): (Arc<dyn StateStore>, Arc<dyn PauseStore>) =
            if self.database_url == MEMORY_URL {
                info!("Using in-memory stores");
                (
                    Arc::new(MemoryStateStore::new()),
                    Arc::new(MemoryPauseStore::new()),
                )
            } else {
                let pool = migrations::connect_sqlite(&self.database_url).await?;
                info!(database_url = %self.database_url, "SQLite stores ready");
                (
                    Arc::new(SqliteStateStore::new(pool.clone())),
                    Arc::new(SqlitePauseStore::new(pool)),
                )
            };

        let queue = Arc::new(Queue::new(self.queue.clone(), self.clock.clone()));
        let executor = Arc::new(Executor::new(
            self.executor.clone(),
            state.clone(),
            self.driver.clone(),
            self.clock.clone(),
        ));
        let lifecycle = Arc::new(Lifecycle::new(LifecycleParts {
            registry: Arc::new(FunctionRegistry::new(Arc::new(Compiler::default()))),
            state,
            pauses,
            queue,
            executor,
            clock: self.clock.clone(),
            matcher_concurrency: self.matcher_concurrency,
        }));

        let mut functions = self.functions.clone();
        if let Some(path) = &self.functions_path {
            functions.extend(load_functions(path)?);
        }
        if !functions.is_empty() {
            let synced = lifecycle.sync_functions(self.env_id, functions)?;
            info!(count = synced.len(), env_id = %self.env_id, "Functions synced");
        }

        let recovery = lifecycle.recover().await?;
        info!(
            pauses = recovery.pauses,
            cancellations = recovery.cancellations,
            runs = recovery.runs,
            "State recovered"
        );
        Ok(lifecycle)
    }

    /// Start the runtime, spawning the worker pool and schedulers.
    pub async fn start(self) -> Result<SteadfastRuntime> {
        let lifecycle = self.assemble().await?;

        let pool = WorkerPool::new(lifecycle.clone(), self.workers.clone());
        let timeouts = TimeoutScheduler::new(lifecycle.clone(), self.timeouts.clone());
        let crons = CronScheduler::new(lifecycle.clone(), self.crons.clone());
        let batches = BatchScheduler::new(lifecycle.clone(), self.batches.clone());

        let shutdowns = vec![
            pool.shutdown_handle(),
            timeouts.shutdown_handle(),
            crons.shutdown_handle(),
            batches.shutdown_handle(),
        ];
        let handles = vec![
            ("worker pool", tokio::spawn(pool.run())),
            ("timeout scheduler", tokio::spawn(timeouts.run())),
            ("cron scheduler", tokio::spawn(crons.run())),
            ("batch scheduler", tokio::spawn(batches.run())),
        ];

        info!(
            workers = self.workers.workers,
            env_id = %self.env_id,
            "SteadfastRuntime started"
        );

        Ok(SteadfastRuntime {
            lifecycle,
            handles,
            shutdowns,
            running: Arc::new(AtomicBool::new(true)),
        })
    }
}

/// A running steadfast engine.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct SteadfastRuntime {
    lifecycle: Arc<Lifecycle>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
    shutdowns: Vec<Arc<Notify>>,
    running: Arc<AtomicBool>,
}

impl SteadfastRuntime {
    /// Create a new builder.
    pub fn builder() -> SteadfastRuntimeBuilder {
        SteadfastRuntimeBuilder::new()
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.handles.iter().all(|(_, h)| !h.is_finished())
    }

    /// Signal every task to stop and wait for them.
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down SteadfastRuntime...");
        self.running.store(false, Ordering::SeqCst);
        for shutdown in &self.shutdowns {
            shutdown.notify_one();
        }

        let deadline = Duration::from_secs(30);
        for (name, handle) in self.handles {
            match tokio::time::timeout(deadline, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(task = name, "Task panicked: {}", e),
                Err(_) => error!(task = name, "Task did not stop in time"),
            }
        }
        info!("SteadfastRuntime shutdown complete");
        Ok(())
    }
}

/// Read a JSON array of function definitions.
pub fn load_functions(path: &std::path::Path) -> Result<Vec<FunctionConfig>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading functions from {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing functions in {}", path.display()))
}
