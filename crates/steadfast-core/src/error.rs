// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for steadfast-core.
//!
//! Every error crossing a component boundary carries the [`Component`] it came
//! from; the lifecycle decides recovery using [`CoreError::is_retryable`].

use std::fmt;

use chrono::{DateTime, Utc};
use steadfast_expr::ExprError;
use thiserror::Error;

/// Result type using CoreError.
pub type Result<T> = std::result::Result<T, CoreError>;

/// The component an error originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Matcher,
    PauseStore,
    Queue,
    StateStore,
    Executor,
    Lifecycle,
    Config,
    Api,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Matcher => "matcher",
            Self::PauseStore => "pause_store",
            Self::Queue => "queue",
            Self::StateStore => "state_store",
            Self::Executor => "executor",
            Self::Lifecycle => "lifecycle",
            Self::Config => "config",
            Self::Api => "api",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Core errors.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Bad input: unknown function, malformed definition or expression.
    #[error("[{component}] validation failed: {message}")]
    Validation {
        component: Component,
        message: String,
    },

    /// A referenced entity does not exist.
    #[error("[{component}] {entity} '{id}' not found")]
    NotFound {
        component: Component,
        entity: &'static str,
        id: String,
    },

    /// The run is terminal and cannot be mutated.
    #[error("run '{run_id}' is already {status}")]
    RunTerminal { run_id: String, status: String },

    /// Network, 5xx or datastore timeout.
    #[error("[{component}] transient infrastructure error: {message}")]
    TransientInfra {
        component: Component,
        message: String,
    },

    /// The step reported a retryable failure.
    #[error("step failed: {message}")]
    Step { message: String },

    /// The step reported a failure that must not be retried.
    #[error("step failed permanently: {message}")]
    NonRetryableStep { message: String },

    /// The run was cancelled.
    #[error("run '{run_id}' was cancelled")]
    Cancelled { run_id: String },

    /// Lease or compare-and-set conflict.
    #[error("[{component}] contention: {message}")]
    Contention {
        component: Component,
        message: String,
    },

    /// An expression failed to compile.
    #[error("[{component}] expression rejected: {source}")]
    Compilation {
        component: Component,
        #[source]
        source: ExprError,
    },

    /// Database operation failed.
    #[error("database error during {operation}: {details}")]
    Database { operation: String, details: String },

    /// A stored or received payload could not be (de)serialized.
    #[error("serialization error: {details}")]
    Serialization { details: String },
}

impl CoreError {
    pub fn validation(component: Component, message: impl Into<String>) -> Self {
        Self::Validation {
            component,
            message: message.into(),
        }
    }

    pub fn not_found(component: Component, entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            component,
            entity,
            id: id.to_string(),
        }
    }

    pub fn infra(component: Component, message: impl Into<String>) -> Self {
        Self::TransientInfra {
            component,
            message: message.into(),
        }
    }

    pub fn compilation(component: Component, source: ExprError) -> Self {
        Self::Compilation { component, source }
    }

    /// Stable error code for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::RunTerminal { .. } => "RUN_TERMINAL",
            Self::TransientInfra { .. } => "TRANSIENT_INFRA_ERROR",
            Self::Step { .. } => "STEP_ERROR",
            Self::NonRetryableStep { .. } => "NON_RETRYABLE_STEP_ERROR",
            Self::Cancelled { .. } => "CANCELLED",
            Self::Contention { .. } => "CONTENTION",
            Self::Compilation { .. } => "COMPILATION_ERROR",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::Serialization { .. } => "SERIALIZATION_ERROR",
        }
    }

    /// Whether the operation may succeed if attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientInfra { .. }
                | Self::Step { .. }
                | Self::Contention { .. }
                | Self::Database { .. }
        )
    }

    /// Errors caused by the caller's input rather than the operator's system.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::NotFound { .. }
                | Self::RunTerminal { .. }
                | Self::Compilation { .. }
        )
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CoreError::Database {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization {
            details: err.to_string(),
        }
    }
}

impl From<ExprError> for CoreError {
    fn from(err: ExprError) -> Self {
        if err.is_compilation() {
            CoreError::Compilation {
                component: Component::Matcher,
                source: err,
            }
        } else {
            CoreError::Validation {
                component: Component::Matcher,
                message: err.to_string(),
            }
        }
    }
}

/// Queue-level failures, kept separate so workers can branch on contention.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue item or partition not found")]
    NotFound,

    #[error("already leased")]
    AlreadyLeased,

    #[error("lease expired")]
    LeaseExpired,

    #[error("concurrency limit reached for {key}")]
    ConcurrencyLimited { key: String },

    #[error("throttled until {retry_at}")]
    Throttled { retry_at: DateTime<Utc> },
}

impl From<QueueError> for CoreError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::NotFound => CoreError::not_found(Component::Queue, "queue item", "?"),
            other => CoreError::Contention {
                component: Component::Queue,
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = CoreError::not_found(Component::StateStore, "run", "01ABC");
        assert_eq!(err.error_code(), "NOT_FOUND");
        assert_eq!(err.to_string(), "[state_store] run '01ABC' not found");
        assert!(err.is_user_error());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(CoreError::infra(Component::Executor, "timeout").is_retryable());
        assert!(
            CoreError::Step {
                message: "boom".into()
            }
            .is_retryable()
        );
        assert!(
            !CoreError::NonRetryableStep {
                message: "boom".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_expr_error_conversion() {
        let err: CoreError = ExprError::Unsupported("bytes".into()).into();
        assert_eq!(err.error_code(), "COMPILATION_ERROR");
        let err: CoreError = ExprError::Evaluation("bad".into()).into();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_queue_error_conversion() {
        let err: CoreError = QueueError::AlreadyLeased.into();
        assert_eq!(err.error_code(), "CONTENTION");
    }
}
