// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;

use crate::executor::ExecutorConfig;
use crate::queue::QueueConfig;
use crate::scheduler::TimeoutSchedulerConfig;
use crate::worker::WorkerPoolConfig;

const DEFAULT_DATABASE_URL: &str = "sqlite:.data/steadfast.db?mode=rwc";

/// Steadfast engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL, or `memory` for the in-memory stores
    pub database_url: String,
    /// HTTP listen address
    pub http_addr: SocketAddr,
    /// Environment that ingested events belong to
    pub env_id: Uuid,
    /// JSON file of function definitions synced at startup
    pub functions_path: Option<PathBuf>,
    /// Base URL used by CLI client subcommands
    pub api_url: String,
    /// Matcher fan-out bound
    pub matcher_concurrency: usize,
    pub queue: QueueConfig,
    pub executor: ExecutorConfig,
    pub workers: WorkerPoolConfig,
    pub timeouts: TimeoutSchedulerConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// All variables are optional:
    /// - `STEADFAST_DATABASE_URL`: SQLite URL or `memory` (default: `sqlite:.data/steadfast.db?mode=rwc`)
    /// - `STEADFAST_HTTP_PORT`: HTTP port (default: 8288)
    /// - `STEADFAST_WORKERS`: worker loops (default: 100)
    /// - `STEADFAST_LEASE_TTL_MS`: lease ttl (default: 30000)
    /// - `STEADFAST_POLL_INTERVAL_MS`: idle poll interval (default: 100)
    /// - `STEADFAST_PARTITION_SCAN_LIMIT`: partitions per scan (default: 16)
    /// - `STEADFAST_TIMEOUT_SCAN_INTERVAL_MS`: pause timeout scan (default: 1000)
    /// - `STEADFAST_MAX_INFRA_RETRIES`: infra retry budget (default: 5)
    /// - `STEADFAST_RETRY_BASE_MS` / `STEADFAST_RETRY_MAX_MS`: backoff (default: 10s / 6h)
    /// - `STEADFAST_ACCOUNT_CONCURRENCY`: account ceiling, 0 = unlimited (default: 0)
    /// - `STEADFAST_MATCHER_CONCURRENCY`: matcher fan-out (default: CPU count)
    /// - `STEADFAST_FUNCTIONS_PATH`: function definitions file (default: unset)
    /// - `STEADFAST_ENV_ID`: environment UUID (default: nil)
    /// - `STEADFAST_API_URL`: API base URL for the CLI (default: http://127.0.0.1:8288)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("STEADFAST_DATABASE_URL")
            .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
        if database_url.trim().is_empty() {
            return Err(ConfigError::Missing("STEADFAST_DATABASE_URL"));
        }

        let http_port: u16 = parse_var(
            "STEADFAST_HTTP_PORT",
            "8288",
            "must be a valid port number",
        )?;
        let worker_count: usize =
            parse_var("STEADFAST_WORKERS", "100", "must be a positive integer")?;
        if worker_count == 0 {
            return Err(ConfigError::Invalid(
                "STEADFAST_WORKERS",
                "must be a positive integer",
            ));
        }
        let lease_ttl_ms: u64 = parse_var(
            "STEADFAST_LEASE_TTL_MS",
            "30000",
            "must be a duration in milliseconds",
        )?;
        let poll_interval_ms: u64 = parse_var(
            "STEADFAST_POLL_INTERVAL_MS",
            "100",
            "must be a duration in milliseconds",
        )?;
        let scan_limit: usize = parse_var(
            "STEADFAST_PARTITION_SCAN_LIMIT",
            "16",
            "must be a positive integer",
        )?;
        let timeout_scan_ms: u64 = parse_var(
            "STEADFAST_TIMEOUT_SCAN_INTERVAL_MS",
            "1000",
            "must be a duration in milliseconds",
        )?;
        let max_infra_retries: u32 = parse_var(
            "STEADFAST_MAX_INFRA_RETRIES",
            "5",
            "must be a non-negative integer",
        )?;
        let retry_base_ms: u64 = parse_var(
            "STEADFAST_RETRY_BASE_MS",
            "10000",
            "must be a duration in milliseconds",
        )?;
        let retry_max_ms: u64 = parse_var(
            "STEADFAST_RETRY_MAX_MS",
            "21600000",
            "must be a duration in milliseconds",
        )?;
        let account_concurrency: u32 = parse_var(
            "STEADFAST_ACCOUNT_CONCURRENCY",
            "0",
            "must be a non-negative integer",
        )?;
        let matcher_concurrency: usize = match std::env::var("STEADFAST_MATCHER_CONCURRENCY") {
            Ok(raw) => raw.parse().map_err(|_| {
                ConfigError::Invalid(
                    "STEADFAST_MATCHER_CONCURRENCY",
                    "must be a positive integer",
                )
            })?,
            Err(_) => num_cpus::get(),
        };
        let env_id = match std::env::var("STEADFAST_ENV_ID") {
            Ok(raw) => Uuid::parse_str(&raw)
                .map_err(|_| ConfigError::Invalid("STEADFAST_ENV_ID", "must be a UUID"))?,
            Err(_) => Uuid::nil(),
        };
        let functions_path = std::env::var("STEADFAST_FUNCTIONS_PATH")
            .ok()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);
        let api_url = std::env::var("STEADFAST_API_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8288".to_string());

        let lease_ttl = Duration::from_millis(lease_ttl_ms);
        Ok(Self {
            database_url,
            http_addr: SocketAddr::from(([0, 0, 0, 0], http_port)),
            env_id,
            functions_path,
            api_url,
            matcher_concurrency: matcher_concurrency.max(1),
            queue: QueueConfig {
                account_concurrency,
                ..QueueConfig::default()
            },
            executor: ExecutorConfig {
                max_infra_retries,
                retry_base: Duration::from_millis(retry_base_ms),
                retry_max: Duration::from_millis(retry_max_ms),
                ..ExecutorConfig::default()
            },
            workers: WorkerPoolConfig {
                workers: worker_count,
                lease_ttl,
                poll_interval: Duration::from_millis(poll_interval_ms),
                scan_limit: scan_limit.max(1),
            },
            timeouts: TimeoutSchedulerConfig {
                scan_interval: Duration::from_millis(timeout_scan_ms),
                ..TimeoutSchedulerConfig::default()
            },
        })
    }

    /// Whether the in-memory stores were selected.
    pub fn is_memory(&self) -> bool {
        self.database_url == "memory"
    }
}

fn parse_var<T: FromStr>(
    name: &'static str,
    default: &str,
    reason: &'static str,
) -> Result<T, ConfigError> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(name, reason))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "STEADFAST_DATABASE_URL",
        "STEADFAST_HTTP_PORT",
        "STEADFAST_WORKERS",
        "STEADFAST_LEASE_TTL_MS",
        "STEADFAST_POLL_INTERVAL_MS",
        "STEADFAST_PARTITION_SCAN_LIMIT",
        "STEADFAST_TIMEOUT_SCAN_INTERVAL_MS",
        "STEADFAST_MAX_INFRA_RETRIES",
        "STEADFAST_RETRY_BASE_MS",
        "STEADFAST_RETRY_MAX_MS",
        "STEADFAST_ACCOUNT_CONCURRENCY",
        "STEADFAST_MATCHER_CONCURRENCY",
        "STEADFAST_FUNCTIONS_PATH",
        "STEADFAST_ENV_ID",
        "STEADFAST_API_URL",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn clean() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for var in VARS {
                guard.remove(var);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::clean();

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.http_addr.port(), 8288);
        assert_eq!(config.workers.workers, 100);
        assert_eq!(config.workers.lease_ttl, Duration::from_secs(30));
        assert_eq!(config.workers.scan_limit, 16);
        assert_eq!(config.executor.max_infra_retries, 5);
        assert_eq!(config.executor.retry_base, Duration::from_secs(10));
        assert_eq!(config.executor.retry_max, Duration::from_secs(6 * 3600));
        assert_eq!(config.queue.account_concurrency, 0);
        assert_eq!(config.timeouts.scan_interval, Duration::from_secs(1));
        assert_eq!(config.env_id, Uuid::nil());
        assert!(config.functions_path.is_none());
        assert!(config.matcher_concurrency >= 1);
        assert!(!config.is_memory());
    }

    #[test]
    fn test_config_from_env_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("STEADFAST_DATABASE_URL", "memory");
        guard.set("STEADFAST_HTTP_PORT", "9999");
        guard.set("STEADFAST_WORKERS", "4");
        guard.set("STEADFAST_ACCOUNT_CONCURRENCY", "50");
        guard.set("STEADFAST_MATCHER_CONCURRENCY", "2");
        guard.set("STEADFAST_FUNCTIONS_PATH", "fns.json");
        guard.set("STEADFAST_ENV_ID", "6f1c2a4e-8a57-4a43-9b7e-1f0c8d3f2e10");

        let config = Config::from_env().unwrap();

        assert!(config.is_memory());
        assert_eq!(config.http_addr.port(), 9999);
        assert_eq!(config.workers.workers, 4);
        assert_eq!(config.queue.account_concurrency, 50);
        assert_eq!(config.matcher_concurrency, 2);
        assert_eq!(config.functions_path, Some(PathBuf::from("fns.json")));
        assert_eq!(
            config.env_id.to_string(),
            "6f1c2a4e-8a57-4a43-9b7e-1f0c8d3f2e10"
        );
    }

    #[test]
    fn test_config_invalid_port() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("STEADFAST_HTTP_PORT", "99999"); // > 65535

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("STEADFAST_HTTP_PORT", _)));
    }

    #[test]
    fn test_config_zero_workers() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("STEADFAST_WORKERS", "0");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("STEADFAST_WORKERS", _)));
    }

    #[test]
    fn test_config_invalid_env_id() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("STEADFAST_ENV_ID", "prod");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("STEADFAST_ENV_ID", _)));
    }

    #[test]
    fn test_config_empty_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("STEADFAST_DATABASE_URL", " ");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("STEADFAST_DATABASE_URL")));
        assert!(err.to_string().contains("STEADFAST_DATABASE_URL"));
    }

    #[test]
    fn test_config_error_display() {
        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(
            invalid.to_string(),
            "invalid value for MY_VAR: must be a number"
        );
    }
}
