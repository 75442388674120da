//! SQLite implementation of the `BoardRepository`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{BoardMessage, NodeId};
use crate::domain::ports::BoardRepository;

#[derive(Clone)]
pub struct SqliteBoardRepository {
    pool: SqlitePool,
}

impl SqliteBoardRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BoardRepository for SqliteBoardRepository {
    async fn insert(&self, message: &BoardMessage) -> DomainResult<bool> {
        let result = sqlx::query(
            r#"INSERT OR IGNORE INTO board_messages (id, node_id, agent_name, topic, body, lamport_ts, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(message.id.to_string())
        .bind(message.node_id.as_str())
        .bind(&message.agent_name)
        .bind(&message.topic)
        .bind(&message.body)
        .bind(ts_to_i64(message.lamport_ts))
        .bind(message.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_recent(&self, limit: usize) -> DomainResult<Vec<BoardMessage>> {
        let rows: Vec<BoardRow> =
            sqlx::query_as("SELECT * FROM board_messages ORDER BY created_at DESC LIMIT ?")
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(BoardMessage::try_from).collect()
    }

    async fn since(&self, lamport_ts: u64) -> DomainResult<Vec<BoardMessage>> {
        let rows: Vec<BoardRow> =
            sqlx::query_as("SELECT * FROM board_messages WHERE lamport_ts > ? ORDER BY lamport_ts")
                .bind(ts_to_i64(lamport_ts))
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(BoardMessage::try_from).collect()
    }

    async fn max_lamport_ts(&self) -> DomainResult<u64> {
        let row: (i64,) = sqlx::query_as("SELECT COALESCE(MAX(lamport_ts), 0) FROM board_messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0.max(0).unsigned_abs())
    }
}

#[allow(clippy::cast_possible_wrap)]
fn ts_to_i64(ts: u64) -> i64 {
    ts as i64
}

#[derive(sqlx::FromRow)]
struct BoardRow {
    id: String,
    node_id: String,
    agent_name: String,
    topic: String,
    body: String,
    lamport_ts: i64,
    created_at: String,
}

impl TryFrom<BoardRow> for BoardMessage {
    type Error = DomainError;

    fn try_from(row: BoardRow) -> Result<Self, Self::Error> {
        Ok(BoardMessage {
            id: Uuid::parse_str(&row.id)
                .map_err(|_| DomainError::ValidationFailed(format!("invalid uuid: {}", row.id)))?,
            node_id: NodeId::from_string(row.node_id),
            agent_name: row.agent_name,
            topic: row.topic,
            body: row.body,
            lamport_ts: row.lamport_ts.max(0).unsigned_abs(),
            created_at: DateTime::parse_from_rfc3339(&row.created_at)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|_| DomainError::ValidationFailed("invalid timestamp".into()))?,
        })
    }
}
