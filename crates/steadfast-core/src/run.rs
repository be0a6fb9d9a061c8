// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runs and their memoized step stack.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Component, CoreError};
use crate::event::Event;
use crate::id::{BatchId, EnvId, EventId, FunctionId, RunId};
use crate::opcode::{OpcodeKind, StepFailure};

/// Run status.
///
/// `Queued -> Running -> (Waiting <-> Running)* -> Completed | Failed | Cancelled`.
/// `Skipped` is reached directly from creation when a rate limit or
/// singleton rule declines the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "waiting" => Ok(Self::Waiting),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "skipped" => Ok(Self::Skipped),
            other => Err(CoreError::validation(
                Component::StateStore,
                format!("unknown run status '{other}'"),
            )),
        }
    }
}

/// A parent waiting on this run through `invoke`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokedBy {
    pub run_id: RunId,
    pub function_id: FunctionId,
    /// Step id of the parent's `invoke` opcode.
    pub step_id: String,
}

/// One execution of a function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub env_id: EnvId,
    pub function_id: FunctionId,
    pub function_version: u32,
    pub trigger_event_ids: Vec<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<BatchId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_run_id: Option<RunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoked_by: Option<InvokedBy>,
    /// Priority factor in seconds, applied to every queue item of the run.
    #[serde(default)]
    pub priority: i64,
    /// Bucket key that holds this run's singleton slot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub singleton_key: Option<String>,
}

impl Run {
    pub fn new(
        function_id: FunctionId,
        function_version: u32,
        env_id: EnvId,
        trigger_event_ids: Vec<EventId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id: RunId::generate_at(now),
            env_id,
            function_id,
            function_version,
            trigger_event_ids,
            batch_id: None,
            original_run_id: None,
            cron: None,
            status: RunStatus::Queued,
            started_at: now,
            ended_at: None,
            output: None,
            error: None,
            invoked_by: None,
            priority: 0,
            singleton_key: None,
        }
    }
}

/// A memoized step result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackEntry {
    pub index: u32,
    pub step_id: String,
    pub opcode: OpcodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Attempt that produced this result, 0-based.
    pub attempt: u32,
}

/// Result of `append_stack`.
#[derive(Debug, Clone, PartialEq)]
pub struct Appended {
    pub index: u32,
    /// The entry now stored for the step id; the earlier one when deduplicated.
    pub entry: StackEntry,
    /// False when another writer already recorded this step id.
    pub inserted: bool,
}

/// Fields written together with a status change.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub output: Option<Value>,
    pub error: Option<StepFailure>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    pub fn ended(at: DateTime<Utc>) -> Self {
        Self {
            ended_at: Some(at),
            ..Self::default()
        }
    }
}

/// Everything the executor needs to call a step target.
#[derive(Debug, Clone)]
pub struct RunState {
    pub run: Run,
    pub stack: Vec<StackEntry>,
    pub events: Vec<Event>,
}

impl RunState {
    /// Memoized outputs keyed by step id.
    pub fn steps(&self) -> BTreeMap<String, Value> {
        self.stack
            .iter()
            .map(|e| (e.step_id.clone(), e.data.clone().unwrap_or(Value::Null)))
            .collect()
    }

    pub fn trigger_event(&self) -> Option<&Event> {
        self.events.first()
    }
}

/// Filter for listing runs.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub function_id: Option<FunctionId>,
    pub status: Option<RunStatus>,
    /// Only non-terminal runs.
    pub active_only: bool,
    pub limit: Option<usize>,
}

impl RunFilter {
    pub fn active() -> Self {
        Self {
            active_only: true,
            ..Self::default()
        }
    }

    pub fn accepts(&self, run: &Run) -> bool {
        self.function_id.is_none_or(|f| f == run.function_id)
            && self.status.is_none_or(|s| s == run.status)
            && (!self.active_only || !run.status.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_status_round_trip() {
        for status in [
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::Waiting,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
            RunStatus::Skipped,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("paused".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Skipped.is_terminal());
        assert!(!RunStatus::Waiting.is_terminal());
        assert!(!RunStatus::Queued.is_terminal());
    }

    #[test]
    fn test_filter() {
        let run = Run::new(FunctionId::generate(), 1, Uuid::nil(), vec![], Utc::now());
        assert!(RunFilter::active().accepts(&run));
        let filter = RunFilter {
            status: Some(RunStatus::Completed),
            ..RunFilter::default()
        };
        assert!(!filter.accepts(&run));
    }
}
