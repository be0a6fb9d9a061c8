// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed state store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;

use super::{StateStore, run_not_found, run_terminal};
use crate::cancel::Cancellation;
use crate::error::{Component, CoreError, Result};
use crate::event::Event;
use crate::id::{CancellationId, EventId, PauseId, RunId};
use crate::opcode::OpcodeKind;
use crate::run::{Appended, Run, RunFilter, RunState, RunStatus, StackEntry, StatusUpdate};

const TERMINAL: &str = "('completed', 'failed', 'cancelled', 'skipped')";

/// Bounded retries when a concurrent writer took the next stack index.
const APPEND_RETRIES: usize = 5;

#[derive(Debug, sqlx::FromRow)]
struct RunRow {
    run_id: String,
    env_id: String,
    function_id: String,
    function_version: i64,
    trigger_event_ids: String,
    batch_id: Option<String>,
    original_run_id: Option<String>,
    cron: Option<String>,
    status: String,
    started_at: i64,
    ended_at: Option<i64>,
    output: Option<String>,
    error: Option<String>,
    invoked_by: Option<String>,
    priority: i64,
    singleton_key: Option<String>,
}

impl TryFrom<RunRow> for Run {
    type Error = CoreError;

    fn try_from(row: RunRow) -> Result<Self> {
        Ok(Run {
            run_id: row.run_id.parse()?,
            env_id: row.env_id.parse().map_err(|e| {
                CoreError::validation(Component::StateStore, format!("invalid env id: {e}"))
            })?,
            function_id: row.function_id.parse()?,
            function_version: row.function_version as u32,
            trigger_event_ids: serde_json::from_str(&row.trigger_event_ids)?,
            batch_id: row.batch_id.map(|s| s.parse()).transpose()?,
            original_run_id: row.original_run_id.map(|s| s.parse()).transpose()?,
            cron: row.cron,
            status: row.status.parse()?,
            started_at: from_millis(row.started_at),
            ended_at: row.ended_at.map(from_millis),
            output: row.output.map(|s| serde_json::from_str(&s)).transpose()?,
            error: row.error.map(|s| serde_json::from_str(&s)).transpose()?,
            invoked_by: row.invoked_by.map(|s| serde_json::from_str(&s)).transpose()?,
            priority: row.priority,
            singleton_key: row.singleton_key,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StackRow {
    idx: i64,
    step_id: String,
    opcode: String,
    data: Option<String>,
    attempt: i64,
}

impl TryFrom<StackRow> for StackEntry {
    type Error = CoreError;

    fn try_from(row: StackRow) -> Result<Self> {
        Ok(StackEntry {
            index: row.idx as u32,
            step_id: row.step_id,
            opcode: serde_json::from_value(Value::String(row.opcode))?,
            data: row.data.map(|s| serde_json::from_str(&s)).transpose()?,
            attempt: row.attempt as u32,
        })
    }
}

pub(crate) fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}

fn to_json<T: serde::Serialize>(value: &Option<T>) -> Result<Option<String>> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(CoreError::from)
}

/// SQLite-backed state store.
#[derive(Clone)]
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// Create a new store from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn stack_entry(&self, run_id: RunId, step_id: &str) -> Result<Option<StackEntry>> {
        let row = sqlx::query_as::<_, StackRow>(
            r#"
            SELECT idx, step_id, opcode, data, attempt
            FROM stack_entries
            WHERE run_id = ? AND step_id = ?
            "#,
        )
        .bind(run_id.to_string())
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(StackEntry::try_from).transpose()
    }

    async fn run_status(&self, run_id: RunId) -> Result<Option<RunStatus>> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM runs WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        status.map(|s| s.parse()).transpose()
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn create_run(&self, run: &Run) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runs (run_id, env_id, function_id, function_version, trigger_event_ids,
                              batch_id, original_run_id, cron, status, started_at, ended_at,
                              output, error, invoked_by, priority, singleton_key)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run.run_id.to_string())
        .bind(run.env_id.to_string())
        .bind(run.function_id.to_string())
        .bind(run.function_version as i64)
        .bind(serde_json::to_string(&run.trigger_event_ids)?)
        .bind(run.batch_id.map(|b| b.to_string()))
        .bind(run.original_run_id.map(|r| r.to_string()))
        .bind(&run.cron)
        .bind(run.status.as_str())
        .bind(millis(run.started_at))
        .bind(run.ended_at.map(millis))
        .bind(to_json(&run.output)?)
        .bind(to_json(&run.error)?)
        .bind(to_json(&run.invoked_by)?)
        .bind(run.priority)
        .bind(&run.singleton_key)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_run(&self, run_id: RunId) -> Result<Option<Run>> {
        let row = sqlx::query_as::<_, RunRow>("SELECT * FROM runs WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Run::try_from).transpose()
    }

    async fn load(&self, run_id: RunId) -> Result<RunState> {
        let run = self
            .load_run(run_id)
            .await?
            .ok_or_else(|| run_not_found(run_id))?;

        let stack = sqlx::query_as::<_, StackRow>(
            r#"
            SELECT idx, step_id, opcode, data, attempt
            FROM stack_entries
            WHERE run_id = ?
            ORDER BY idx ASC
            "#,
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(StackEntry::try_from)
        .collect::<Result<Vec<_>>>()?;

        let mut events = Vec::with_capacity(run.trigger_event_ids.len());
        for id in &run.trigger_event_ids {
            if let Some(event) = self.load_event(*id).await? {
                events.push(event);
            }
        }

        Ok(RunState { run, stack, events })
    }

    async fn append_stack(
        &self,
        run_id: RunId,
        step_id: &str,
        opcode: OpcodeKind,
        data: Option<Value>,
        attempt: u32,
    ) -> Result<Appended> {
        let data = to_json(&data)?;
        let query = format!(
            r#"
            INSERT INTO stack_entries (run_id, idx, step_id, opcode, data, attempt)
            SELECT ?1, (SELECT COUNT(*) FROM stack_entries WHERE run_id = ?1), ?2, ?3, ?4, ?5
            WHERE EXISTS (SELECT 1 FROM runs WHERE run_id = ?1 AND status NOT IN {TERMINAL})
            ON CONFLICT DO NOTHING
            "#
        );

        for _ in 0..APPEND_RETRIES {
            let result = sqlx::query(&query)
                .bind(run_id.to_string())
                .bind(step_id)
                .bind(opcode.as_str())
                .bind(&data)
                .bind(attempt as i64)
                .execute(&self.pool)
                .await?;

            if let Some(entry) = self.stack_entry(run_id, step_id).await? {
                return Ok(Appended {
                    index: entry.index,
                    inserted: result.rows_affected() == 1,
                    entry,
                });
            }

            match self.run_status(run_id).await? {
                None => return Err(run_not_found(run_id)),
                Some(status) if status.is_terminal() => {
                    return Err(run_terminal(run_id, status));
                }
                // Lost the index to a concurrent append; try the next one.
                Some(_) => continue,
            }
        }

        Err(CoreError::Contention {
            component: Component::StateStore,
            message: format!("append to run '{run_id}' kept conflicting"),
        })
    }

    async fn set_status(
        &self,
        run_id: RunId,
        status: RunStatus,
        update: StatusUpdate,
    ) -> Result<bool> {
        let query = format!(
            r#"
            UPDATE runs
            SET status = ?1,
                output = COALESCE(?2, output),
                error = COALESCE(?3, error),
                ended_at = COALESCE(?4, ended_at)
            WHERE run_id = ?5
              AND status NOT IN {TERMINAL}
            "#
        );
        let result = sqlx::query(&query)
            .bind(status.as_str())
            .bind(to_json(&update.output)?)
            .bind(to_json(&update.error)?)
            .bind(update.ended_at.map(millis))
            .bind(run_id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.run_status(run_id).await? {
            None => Err(run_not_found(run_id)),
            Some(_) => Ok(false),
        }
    }

    async fn get_step_output(&self, run_id: RunId, step_id: &str) -> Result<Option<Value>> {
        Ok(self
            .stack_entry(run_id, step_id)
            .await?
            .map(|e| e.data.unwrap_or(Value::Null)))
    }

    async fn save_pause_ref(&self, run_id: RunId, pause_id: PauseId) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO pause_refs (run_id, pause_id) VALUES (?, ?)")
            .bind(run_id.to_string())
            .bind(pause_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove_pause_ref(&self, run_id: RunId, pause_id: PauseId) -> Result<()> {
        sqlx::query("DELETE FROM pause_refs WHERE run_id = ? AND pause_id = ?")
            .bind(run_id.to_string())
            .bind(pause_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pause_refs(&self, run_id: RunId) -> Result<Vec<PauseId>> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT pause_id FROM pause_refs WHERE run_id = ? ORDER BY pause_id")
                .bind(run_id.to_string())
                .fetch_all(&self.pool)
                .await?;
        ids.iter().map(|s| s.parse()).collect()
    }

    async fn save_event(&self, event: &Event) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO events (internal_id, env_id, name, body)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(event.internal_id.to_string())
        .bind(event.env_id.to_string())
        .bind(&event.name)
        .bind(serde_json::to_string(event)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_event(&self, event_id: EventId) -> Result<Option<Event>> {
        let body: Option<String> =
            sqlx::query_scalar("SELECT body FROM events WHERE internal_id = ?")
                .bind(event_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        body.map(|b| serde_json::from_str(&b))
            .transpose()
            .map_err(CoreError::from)
    }

    async fn replace_trigger_event(&self, run_id: RunId, event_id: EventId) -> Result<()> {
        let result = sqlx::query("UPDATE runs SET trigger_event_ids = ? WHERE run_id = ?")
            .bind(serde_json::to_string(&[event_id])?)
            .bind(run_id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(run_not_found(run_id));
        }
        Ok(())
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        let mut sql = String::from("SELECT * FROM runs WHERE 1 = 1");
        if filter.function_id.is_some() {
            sql.push_str(" AND function_id = ?");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.active_only {
            sql.push_str(&format!(" AND status NOT IN {TERMINAL}"));
        }
        sql.push_str(" ORDER BY run_id ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut query = sqlx::query_as::<_, RunRow>(&sql);
        if let Some(function_id) = filter.function_id {
            query = query.bind(function_id.to_string());
        }
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        query
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Run::try_from)
            .collect()
    }

    async fn save_cancellation(&self, cancellation: &Cancellation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cancellations (id, env_id, function_id, body)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET body = excluded.body
            "#,
        )
        .bind(cancellation.id.to_string())
        .bind(cancellation.env_id.to_string())
        .bind(cancellation.function_id.to_string())
        .bind(serde_json::to_string(cancellation)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_cancellations(&self) -> Result<Vec<Cancellation>> {
        let bodies: Vec<String> = sqlx::query_scalar("SELECT body FROM cancellations ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(CoreError::from))
            .collect()
    }

    async fn delete_cancellation(&self, id: CancellationId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM cancellations WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::FunctionId;
    use crate::migrations::test_pool;
    use crate::opcode::StepFailure;
    use serde_json::json;
    use uuid::Uuid;

    fn run() -> Run {
        Run::new(FunctionId::generate(), 1, Uuid::nil(), vec![], Utc::now())
    }

    #[tokio::test]
    async fn test_create_and_load_run() {
        let store = SqliteStateStore::new(test_pool().await);
        let mut run = run();
        run.cron = Some("0 * * * *".to_string());
        run.priority = 30;
        store.create_run(&run).await.unwrap();

        let loaded = store.load_run(run.run_id).await.unwrap().unwrap();
        assert_eq!(loaded.run_id, run.run_id);
        assert_eq!(loaded.cron.as_deref(), Some("0 * * * *"));
        assert_eq!(loaded.priority, 30);
        assert_eq!(loaded.status, RunStatus::Queued);
        assert_eq!(
            loaded.started_at.timestamp_millis(),
            run.started_at.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_append_stack_dedupes_step_id() {
        let store = SqliteStateStore::new(test_pool().await);
        let run = run();
        store.create_run(&run).await.unwrap();

        let first = store
            .append_stack(run.run_id, "charge", OpcodeKind::Step, Some(json!({"ok": 1})), 2)
            .await
            .unwrap();
        let dup = store
            .append_stack(run.run_id, "charge", OpcodeKind::Step, Some(json!({"ok": 2})), 3)
            .await
            .unwrap();
        let next = store
            .append_stack(run.run_id, "email", OpcodeKind::StepRun, None, 0)
            .await
            .unwrap();

        assert!(first.inserted);
        assert!(!dup.inserted);
        assert_eq!(dup.entry.data, Some(json!({"ok": 1})));
        assert_eq!(dup.entry.attempt, 2);
        assert_eq!(next.index, 1);

        let state = store.load(run.run_id).await.unwrap();
        assert_eq!(state.stack.len(), 2);
        assert_eq!(state.stack[1].opcode, OpcodeKind::StepRun);
        assert_eq!(state.steps()["charge"], json!({"ok": 1}));
    }

    #[tokio::test]
    async fn test_set_status_is_conditional() {
        let store = SqliteStateStore::new(test_pool().await);
        let run = run();
        store.create_run(&run).await.unwrap();

        let update = StatusUpdate {
            error: Some(StepFailure::new("boom")),
            ended_at: Some(Utc::now()),
            ..StatusUpdate::default()
        };
        assert!(
            store
                .set_status(run.run_id, RunStatus::Failed, update)
                .await
                .unwrap()
        );
        assert!(
            !store
                .set_status(run.run_id, RunStatus::Completed, StatusUpdate::default())
                .await
                .unwrap()
        );

        let loaded = store.load_run(run.run_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Failed);
        assert_eq!(loaded.error.unwrap().message, "boom");
        assert!(loaded.ended_at.is_some());

        let err = store
            .append_stack(run.run_id, "late", OpcodeKind::Step, None, 0)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "RUN_TERMINAL");

        let err = store
            .set_status(RunId::generate(), RunStatus::Running, StatusUpdate::default())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_events_and_trigger_replacement() {
        let store = SqliteStateStore::new(test_pool().await);
        let now = Utc::now();
        let first = Event::internal(Uuid::nil(), "a", json!({"n": 1}), now);
        let second = Event::internal(Uuid::nil(), "a", json!({"n": 2}), now);
        store.save_event(&first).await.unwrap();
        store.save_event(&second).await.unwrap();

        let mut run = run();
        run.trigger_event_ids = vec![first.internal_id];
        store.create_run(&run).await.unwrap();
        store
            .replace_trigger_event(run.run_id, second.internal_id)
            .await
            .unwrap();

        let state = store.load(run.run_id).await.unwrap();
        assert_eq!(state.events.len(), 1);
        assert_eq!(state.trigger_event().unwrap().data["n"], 2);
    }

    #[tokio::test]
    async fn test_pause_refs_and_list_runs() {
        let store = SqliteStateStore::new(test_pool().await);
        let a = run();
        let b = run();
        store.create_run(&a).await.unwrap();
        store.create_run(&b).await.unwrap();
        store
            .set_status(b.run_id, RunStatus::Completed, StatusUpdate::default())
            .await
            .unwrap();

        let pause = PauseId::generate();
        store.save_pause_ref(a.run_id, pause).await.unwrap();
        store.save_pause_ref(a.run_id, pause).await.unwrap();
        assert_eq!(store.pause_refs(a.run_id).await.unwrap(), vec![pause]);
        store.remove_pause_ref(a.run_id, pause).await.unwrap();
        assert!(store.pause_refs(a.run_id).await.unwrap().is_empty());

        let active = store.list_runs(&RunFilter::active()).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].run_id, a.run_id);
    }
}
