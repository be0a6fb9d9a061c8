// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations and connection setup for steadfast-core.
//!
//! ```ignore
//! let pool = steadfast_core::migrations::connect_sqlite("sqlite:.data/steadfast.db?mode=rwc").await?;
//! let state = SqliteStateStore::new(pool.clone());
//! let pauses = SqlitePauseStore::new(pool);
//! ```

use std::path::Path;

use sqlx::SqlitePool;
use sqlx::migrate::MigrateError;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::CoreError;

/// SQLite migrator with all core migrations embedded.
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Run SQLite migrations.
///
/// Applies all pending migrations to the database. Safe to call multiple times;
/// already-applied migrations are skipped.
pub async fn run_sqlite(pool: &SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}

/// Connect to `url` and apply migrations.
pub async fn connect_sqlite(url: &str) -> Result<SqlitePool, CoreError> {
    if let Some(path) = file_path(url)
        && let Some(parent) = Path::new(path).parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| CoreError::Database {
            operation: "create_dir".to_string(),
            details: format!("Failed to create directory {:?}: {}", parent, e),
        })?;
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(url)
        .await
        .map_err(|e| CoreError::Database {
            operation: "connect".to_string(),
            details: format!("Failed to connect to SQLite at {}: {}", url, e),
        })?;

    run_sqlite(&pool).await?;
    Ok(pool)
}

/// Open (creating if needed) the database file at `path`.
pub async fn open_sqlite(path: impl AsRef<Path>) -> Result<SqlitePool, CoreError> {
    let url = format!("sqlite:{}?mode=rwc", path.as_ref().to_string_lossy());
    connect_sqlite(&url).await
}

fn file_path(url: &str) -> Option<&str> {
    let rest = url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next()?;
    (!path.is_empty() && path != ":memory:").then_some(path)
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool");

    SQLITE.run(&pool).await.expect("Failed to run migrations");

    pool
}
