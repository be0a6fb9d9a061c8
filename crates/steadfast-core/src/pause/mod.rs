// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Suspended runs.
//!
//! A pause records that a run is waiting for an event, an invoked child run,
//! or its own cancellation event. Pauses are consumed at most once: whichever
//! of the matching event and the timeout scan consumes first resumes the run,
//! the other finds nothing.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryPauseStore;
pub use self::sqlite::SqlitePauseStore;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use steadfast_expr::Evaluable;
use ulid::Ulid;

use crate::error::{Component, CoreError, Result};
use crate::id::{EnvId, FunctionId, PauseId, RunId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PauseKind {
    /// `wait_for_event`
    Event,
    /// Waiting for an invoked child run to finish.
    Invoke,
    /// Waiting for an explicit signal.
    Signal,
    /// A function-level cancel rule; consuming it cancels the run.
    Cancel,
}

impl PauseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::Invoke => "invoke",
            Self::Signal => "signal",
            Self::Cancel => "cancel",
        }
    }
}

impl fmt::Display for PauseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PauseKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "event" => Ok(Self::Event),
            "invoke" => Ok(Self::Invoke),
            "signal" => Ok(Self::Signal),
            "cancel" => Ok(Self::Cancel),
            other => Err(CoreError::validation(
                Component::PauseStore,
                format!("unknown pause kind '{other}'"),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pause {
    pub id: PauseId,
    pub env_id: EnvId,
    pub function_id: FunctionId,
    pub run_id: RunId,
    /// Step id whose result the resume records.
    pub resumed_from_step_id: String,
    pub kind: PauseKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
    /// Predicate with trigger-event references already interpolated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    pub timeout_at: DateTime<Utc>,
    /// Key the matched event is bound under in the resumed run's steps.
    pub bind_as: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoke_correlation_id: Option<String>,
    #[serde(default)]
    pub extras: Value,
    pub created_at: DateTime<Utc>,
}

impl Evaluable for Pause {
    fn id(&self) -> Ulid {
        self.id.as_ulid()
    }

    fn expression(&self) -> &str {
        self.expression.as_deref().unwrap_or("")
    }
}

/// Pause store interface.
#[allow(missing_docs)]
#[async_trait]
pub trait PauseStore: Send + Sync {
    async fn create(&self, pause: &Pause) -> Result<PauseId>;

    /// Atomically remove and return the pause. Returns `Some` exactly once.
    async fn consume(&self, pause_id: PauseId) -> Result<Option<Pause>>;

    /// Pauses whose timeout is at or before `now`, oldest first.
    async fn by_timeout(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Pause>>;

    async fn by_event(&self, env_id: EnvId, event_name: &str) -> Result<Vec<PauseId>>;

    async fn get(&self, pause_id: PauseId) -> Result<Option<Pause>>;

    async fn by_run(&self, run_id: RunId) -> Result<Vec<Pause>>;

    async fn by_invoke_correlation(&self, correlation_id: &str) -> Result<Option<Pause>>;

    async fn delete(&self, pause_id: PauseId) -> Result<bool>;

    /// Delete every pause of a run, returning the deleted ids.
    async fn delete_by_run(&self, run_id: RunId) -> Result<Vec<PauseId>>;

    async fn all(&self) -> Result<Vec<Pause>>;

    async fn list_event_names(&self, env_id: EnvId) -> Result<Vec<String>>;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use uuid::Uuid;

    pub(crate) fn pause(event: &str, expression: Option<&str>, timeout_at: DateTime<Utc>) -> Pause {
        Pause {
            id: PauseId::generate(),
            env_id: Uuid::nil(),
            function_id: FunctionId::generate(),
            run_id: RunId::generate(),
            resumed_from_step_id: "wait".to_string(),
            kind: PauseKind::Event,
            event_name: Some(event.to_string()),
            expression: expression.map(str::to_string),
            timeout_at,
            bind_as: "wait".to_string(),
            invoke_correlation_id: None,
            extras: json!({}),
            created_at: Utc::now(),
        }
    }

    /// Behaviour shared by every store implementation.
    pub(crate) async fn exercise_store(store: &dyn PauseStore) {
        let now = Utc::now();
        let early = pause("order.paid", Some("event.data.id == 'A'"), now - Duration::seconds(5));
        let late = pause("order.paid", None, now + Duration::hours(1));
        let mut invoke = pause("other", None, now + Duration::hours(2));
        invoke.kind = PauseKind::Invoke;
        invoke.event_name = None;
        invoke.invoke_correlation_id = Some("child-run".to_string());
        invoke.run_id = late.run_id;

        for p in [&early, &late, &invoke] {
            assert_eq!(store.create(p).await.unwrap(), p.id);
        }

        let mut ids = store.by_event(Uuid::nil(), "order.paid").await.unwrap();
        ids.sort();
        let mut expected = vec![early.id, late.id];
        expected.sort();
        assert_eq!(ids, expected);
        assert_eq!(
            store.list_event_names(Uuid::nil()).await.unwrap(),
            vec!["order.paid".to_string()]
        );

        let due = store.by_timeout(now, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, early.id);

        assert_eq!(store.get(early.id).await.unwrap().unwrap(), early);
        assert_eq!(
            store.by_invoke_correlation("child-run").await.unwrap().unwrap().id,
            invoke.id
        );

        let consumed = store.consume(early.id).await.unwrap();
        assert_eq!(consumed.unwrap().id, early.id);
        assert!(store.consume(early.id).await.unwrap().is_none());
        assert!(store.by_timeout(now, 10).await.unwrap().is_empty());

        assert_eq!(store.by_run(late.run_id).await.unwrap().len(), 2);
        let mut deleted = store.delete_by_run(late.run_id).await.unwrap();
        deleted.sort();
        let mut expected = vec![late.id, invoke.id];
        expected.sort();
        assert_eq!(deleted, expected);
        assert!(store.all().await.unwrap().is_empty());
        assert!(!store.delete(late.id).await.unwrap());
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            PauseKind::Event,
            PauseKind::Invoke,
            PauseKind::Signal,
            PauseKind::Cancel,
        ] {
            assert_eq!(kind.as_str().parse::<PauseKind>().unwrap(), kind);
        }
    }
}
