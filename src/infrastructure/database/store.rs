//! SQLite store bootstrap and embedded schema migrations.
//!
//! Each node owns one database file under its data directory. WAL
//! journaling with `synchronous = NORMAL` gives crash-safe commits without
//! an fsync per write, and a generous busy timeout rides out a CLI process
//! sharing the file with the daemon.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(3);

/// Ordered schema history. Append-only: a released version is never
/// edited, only superseded by the next entry.
const MIGRATIONS: &[(i64, &str, &str)] = &[(
    1,
    "initial schema",
    include_str!("../../../migrations/001_initial_schema.sql"),
)];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot prepare data directory {path}: {source}")]
    DataDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot open database {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("schema migration {version} failed: {source}")]
    Migration {
        version: i64,
        #[source]
        source: sqlx::Error,
    },
}

/// Open the store at `path`, creating the file and its parent directory on
/// first boot.
pub async fn open_store(path: &str, max_connections: u32) -> Result<SqlitePool, StoreError> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::DataDir {
                path: parent.display().to_string(),
                source,
            })?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT);

    SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect_with(options)
        .await
        .map_err(|source| StoreError::Open { path: path.to_string(), source })
}

/// Private in-memory store for tests. The single pinned connection means
/// every pool owns its own database, isolated from other pools in the
/// process.
pub async fn open_memory_store() -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::new()
        .filename(":memory:")
        .journal_mode(SqliteJournalMode::Memory)
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .map_err(|source| StoreError::Open { path: ":memory:".to_string(), source })
}

/// Bring the schema up to the latest version. Returns how many migrations
/// ran; zero means the store was already current.
pub async fn apply_migrations(pool: &SqlitePool) -> Result<usize, StoreError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            description TEXT,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .execute(pool)
    .await
    .map_err(|source| StoreError::Migration { version: 0, source })?;

    let (current,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")
        .fetch_one(pool)
        .await
        .map_err(|source| StoreError::Migration { version: 0, source })?;

    let mut applied = 0;
    for (version, description, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }
        sqlx::raw_sql(sql)
            .execute(pool)
            .await
            .map_err(|source| StoreError::Migration { version: *version, source })?;
        sqlx::query("INSERT INTO schema_migrations (version, description) VALUES (?, ?)")
            .bind(version)
            .bind(description)
            .execute(pool)
            .await
            .map_err(|source| StoreError::Migration { version: *version, source })?;
        info!(version = *version, description = *description, "schema migration applied");
        applied += 1;
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_run_once() {
        let pool = open_memory_store().await.unwrap();
        let first = apply_migrations(&pool).await.unwrap();
        assert!(first >= 1);
        assert_eq!(apply_migrations(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn migrated_store_has_the_swarm_tables() {
        let pool = open_memory_store().await.unwrap();
        apply_migrations(&pool).await.unwrap();
        for table in ["tasks", "task_dependencies", "agents", "nodes", "board_messages", "node_state"] {
            let (count,): (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
                    .bind(table)
                    .fetch_one(&pool)
                    .await
                    .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }

    #[tokio::test]
    async fn memory_stores_are_isolated() {
        let left = open_memory_store().await.unwrap();
        let right = open_memory_store().await.unwrap();
        apply_migrations(&left).await.unwrap();

        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'tasks'")
                .fetch_one(&right)
                .await
                .unwrap();
        assert_eq!(count, 0, "schema leaked between memory stores");
    }
}
