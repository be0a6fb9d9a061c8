// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed pause store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::{Pause, PauseStore};
use crate::error::{CoreError, Result};
use crate::id::{EnvId, PauseId, RunId};
use crate::state::sqlite::millis;

fn decode(bodies: Vec<String>) -> Result<Vec<Pause>> {
    bodies
        .iter()
        .map(|b| serde_json::from_str(b).map_err(CoreError::from))
        .collect()
}

/// SQLite-backed pause store. Consumption is a single `DELETE ... RETURNING`,
/// so concurrent consumers cannot both win.
#[derive(Clone)]
pub struct SqlitePauseStore {
    pool: SqlitePool,
}

impl SqlitePauseStore {
    /// Create a new store from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PauseStore for SqlitePauseStore {
    async fn create(&self, pause: &Pause) -> Result<PauseId> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO pauses (pause_id, env_id, function_id, run_id, kind,
                                           event_name, timeout_at, invoke_correlation_id, body)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(pause.id.to_string())
        .bind(pause.env_id.to_string())
        .bind(pause.function_id.to_string())
        .bind(pause.run_id.to_string())
        .bind(pause.kind.as_str())
        .bind(&pause.event_name)
        .bind(millis(pause.timeout_at))
        .bind(&pause.invoke_correlation_id)
        .bind(serde_json::to_string(pause)?)
        .execute(&self.pool)
        .await?;

        Ok(pause.id)
    }

    async fn consume(&self, pause_id: PauseId) -> Result<Option<Pause>> {
        let body: Option<String> =
            sqlx::query_scalar("DELETE FROM pauses WHERE pause_id = ? RETURNING body")
                .bind(pause_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        body.map(|b| serde_json::from_str(&b))
            .transpose()
            .map_err(CoreError::from)
    }

    async fn by_timeout(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Pause>> {
        let bodies: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT body FROM pauses
            WHERE timeout_at <= ?
            ORDER BY timeout_at ASC, pause_id ASC
            LIMIT ?
            "#,
        )
        .bind(millis(now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        decode(bodies)
    }

    async fn by_event(&self, env_id: EnvId, event_name: &str) -> Result<Vec<PauseId>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT pause_id FROM pauses WHERE env_id = ? AND event_name = ? ORDER BY pause_id",
        )
        .bind(env_id.to_string())
        .bind(event_name)
        .fetch_all(&self.pool)
        .await?;
        ids.iter().map(|s| s.parse()).collect()
    }

    async fn get(&self, pause_id: PauseId) -> Result<Option<Pause>> {
        let body: Option<String> = sqlx::query_scalar("SELECT body FROM pauses WHERE pause_id = ?")
            .bind(pause_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        body.map(|b| serde_json::from_str(&b))
            .transpose()
            .map_err(CoreError::from)
    }

    async fn by_run(&self, run_id: RunId) -> Result<Vec<Pause>> {
        let bodies: Vec<String> =
            sqlx::query_scalar("SELECT body FROM pauses WHERE run_id = ? ORDER BY pause_id")
                .bind(run_id.to_string())
                .fetch_all(&self.pool)
                .await?;
        decode(bodies)
    }

    async fn by_invoke_correlation(&self, correlation_id: &str) -> Result<Option<Pause>> {
        let body: Option<String> = sqlx::query_scalar(
            "SELECT body FROM pauses WHERE invoke_correlation_id = ? ORDER BY pause_id LIMIT 1",
        )
        .bind(correlation_id)
        .fetch_optional(&self.pool)
        .await?;
        body.map(|b| serde_json::from_str(&b))
            .transpose()
            .map_err(CoreError::from)
    }

    async fn delete(&self, pause_id: PauseId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM pauses WHERE pause_id = ?")
            .bind(pause_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_by_run(&self, run_id: RunId) -> Result<Vec<PauseId>> {
        let ids: Vec<String> =
            sqlx::query_scalar("DELETE FROM pauses WHERE run_id = ? RETURNING pause_id")
                .bind(run_id.to_string())
                .fetch_all(&self.pool)
                .await?;
        ids.iter().map(|s| s.parse()).collect()
    }

    async fn all(&self) -> Result<Vec<Pause>> {
        let bodies: Vec<String> = sqlx::query_scalar("SELECT body FROM pauses ORDER BY pause_id")
            .fetch_all(&self.pool)
            .await?;
        decode(bodies)
    }

    async fn list_event_names(&self, env_id: EnvId) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT event_name FROM pauses
            WHERE env_id = ? AND event_name IS NOT NULL
            ORDER BY event_name
            "#,
        )
        .bind(env_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::test_pool;
    use crate::pause::tests::exercise_store;

    #[tokio::test]
    async fn test_sqlite_pause_store() {
        exercise_store(&SqlitePauseStore::new(test_pool().await)).await;
    }

    #[tokio::test]
    async fn test_consume_survives_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pauses.db");
        let pause = crate::pause::tests::pause("x", None, Utc::now());

        let store = SqlitePauseStore::new(crate::migrations::open_sqlite(&path).await.unwrap());
        store.create(&pause).await.unwrap();
        drop(store);

        let store = SqlitePauseStore::new(crate::migrations::open_sqlite(&path).await.unwrap());
        assert_eq!(store.consume(pause.id).await.unwrap().unwrap().id, pause.id);
        assert!(store.consume(pause.id).await.unwrap().is_none());
    }
}
