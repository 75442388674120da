//! SQLite implementations of the node and node-state repositories.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Node, NodeId, NodeRole, NodeStatus};
use crate::domain::ports::{NodeRepository, NodeStateRepository};

#[derive(Clone)]
pub struct SqliteNodeRepository {
    pool: SqlitePool,
}

impl SqliteNodeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NodeRepository for SqliteNodeRepository {
    async fn upsert(&self, node: &Node) -> DomainResult<()> {
        let caps_json = serde_json::to_string(&node.capabilities)?;
        sqlx::query(
            r#"INSERT INTO nodes (node_id, role, http_host, http_port, p2p_port, capabilities,
               agent_count, active_task_count, status, last_heartbeat, lamport_ts, registered_at,
               uptime_seconds, memory_usage_bytes)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(node_id) DO UPDATE SET
                 role = excluded.role,
                 http_host = excluded.http_host,
                 http_port = excluded.http_port,
                 p2p_port = excluded.p2p_port,
                 capabilities = excluded.capabilities,
                 agent_count = excluded.agent_count,
                 active_task_count = excluded.active_task_count,
                 status = excluded.status,
                 last_heartbeat = excluded.last_heartbeat,
                 lamport_ts = excluded.lamport_ts,
                 uptime_seconds = excluded.uptime_seconds,
                 memory_usage_bytes = excluded.memory_usage_bytes"#,
        )
        .bind(node.node_id.as_str())
        .bind(node.role.as_str())
        .bind(&node.http_host)
        .bind(i64::from(node.http_port))
        .bind(i64::from(node.p2p_port))
        .bind(&caps_json)
        .bind(i64::from(node.agent_count))
        .bind(i64::from(node.active_task_count))
        .bind(node.status.as_str())
        .bind(node.last_heartbeat.to_rfc3339())
        .bind(ts_to_i64(node.lamport_ts))
        .bind(node.registered_at.to_rfc3339())
        .bind(ts_to_i64(node.uptime_seconds))
        .bind(ts_to_i64(node.memory_usage_bytes))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_replica(&self, node: &Node) -> DomainResult<bool> {
        let caps_json = serde_json::to_string(&node.capabilities)?;
        let result = sqlx::query(
            r#"INSERT INTO nodes (node_id, role, http_host, http_port, p2p_port, capabilities,
               agent_count, active_task_count, status, last_heartbeat, lamport_ts, registered_at,
               uptime_seconds, memory_usage_bytes)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(node_id) DO UPDATE SET
                 role = excluded.role,
                 http_host = excluded.http_host,
                 http_port = excluded.http_port,
                 p2p_port = excluded.p2p_port,
                 capabilities = excluded.capabilities,
                 agent_count = excluded.agent_count,
                 active_task_count = excluded.active_task_count,
                 status = excluded.status,
                 last_heartbeat = excluded.last_heartbeat,
                 lamport_ts = excluded.lamport_ts,
                 uptime_seconds = excluded.uptime_seconds,
                 memory_usage_bytes = excluded.memory_usage_bytes
               WHERE excluded.lamport_ts > nodes.lamport_ts"#,
        )
        .bind(node.node_id.as_str())
        .bind(node.role.as_str())
        .bind(&node.http_host)
        .bind(i64::from(node.http_port))
        .bind(i64::from(node.p2p_port))
        .bind(&caps_json)
        .bind(i64::from(node.agent_count))
        .bind(i64::from(node.active_task_count))
        .bind(node.status.as_str())
        .bind(node.last_heartbeat.to_rfc3339())
        .bind(ts_to_i64(node.lamport_ts))
        .bind(node.registered_at.to_rfc3339())
        .bind(ts_to_i64(node.uptime_seconds))
        .bind(ts_to_i64(node.memory_usage_bytes))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, node_id: &NodeId) -> DomainResult<Option<Node>> {
        let row: Option<NodeRow> = sqlx::query_as("SELECT * FROM nodes WHERE node_id = ?")
            .bind(node_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Node::try_from).transpose()
    }

    async fn list(&self) -> DomainResult<Vec<Node>> {
        let rows: Vec<NodeRow> = sqlx::query_as("SELECT * FROM nodes ORDER BY node_id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Node::try_from).collect()
    }

    async fn set_role(&self, node_id: &NodeId, role: NodeRole, lamport_ts: u64) -> DomainResult<()> {
        let result = sqlx::query("UPDATE nodes SET role = ?, lamport_ts = ? WHERE node_id = ?")
            .bind(role.as_str())
            .bind(ts_to_i64(lamport_ts))
            .bind(node_id.as_str())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DomainError::NodeNotFound(node_id.to_string()));
        }
        Ok(())
    }

    async fn mark_stale_offline(&self, cutoff: DateTime<Utc>) -> DomainResult<Vec<NodeId>> {
        let stale: Vec<(String,)> = sqlx::query_as(
            "SELECT node_id FROM nodes WHERE status = 'online' AND last_heartbeat < ?",
        )
        .bind(cutoff.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        if stale.is_empty() {
            return Ok(Vec::new());
        }

        sqlx::query("UPDATE nodes SET status = 'offline' WHERE status = 'online' AND last_heartbeat < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;

        Ok(stale.into_iter().map(|(id,)| NodeId::from_string(id)).collect())
    }

    async fn since(&self, lamport_ts: u64) -> DomainResult<Vec<Node>> {
        let rows: Vec<NodeRow> =
            sqlx::query_as("SELECT * FROM nodes WHERE lamport_ts > ? ORDER BY lamport_ts")
                .bind(ts_to_i64(lamport_ts))
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(Node::try_from).collect()
    }

    async fn max_lamport_ts(&self) -> DomainResult<u64> {
        let row: (i64,) = sqlx::query_as("SELECT COALESCE(MAX(lamport_ts), 0) FROM nodes")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0.max(0).unsigned_abs())
    }
}

/// Key-value store backing `node_state` (node id, flushed Lamport clock).
#[derive(Clone)]
pub struct SqliteNodeStateRepository {
    pool: SqlitePool,
}

impl SqliteNodeStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NodeStateRepository for SqliteNodeStateRepository {
    async fn get(&self, key: &str) -> DomainResult<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM node_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    async fn put(&self, key: &str, value: &str) -> DomainResult<()> {
        sqlx::query(
            "INSERT INTO node_state (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[allow(clippy::cast_possible_wrap)]
fn ts_to_i64(ts: u64) -> i64 {
    ts as i64
}

#[derive(sqlx::FromRow)]
struct NodeRow {
    node_id: String,
    role: String,
    http_host: String,
    http_port: i64,
    p2p_port: i64,
    capabilities: String,
    agent_count: i64,
    active_task_count: i64,
    status: String,
    last_heartbeat: String,
    lamport_ts: i64,
    registered_at: String,
    uptime_seconds: i64,
    memory_usage_bytes: i64,
}

impl TryFrom<NodeRow> for Node {
    type Error = DomainError;

    fn try_from(row: NodeRow) -> Result<Self, Self::Error> {
        Ok(Node {
            node_id: NodeId::from_string(row.node_id),
            role: NodeRole::parse_str(&row.role).unwrap_or_default(),
            http_host: row.http_host,
            http_port: u16::try_from(row.http_port.max(0)).unwrap_or(0),
            p2p_port: u16::try_from(row.p2p_port.max(0)).unwrap_or(0),
            capabilities: serde_json::from_str(&row.capabilities)?,
            agent_count: u32::try_from(row.agent_count.max(0)).unwrap_or(0),
            active_task_count: u32::try_from(row.active_task_count.max(0)).unwrap_or(0),
            status: NodeStatus::parse_str(&row.status).unwrap_or_default(),
            last_heartbeat: parse_datetime(&row.last_heartbeat)?,
            lamport_ts: row.lamport_ts.max(0).unsigned_abs(),
            registered_at: parse_datetime(&row.registered_at)?,
            uptime_seconds: row.uptime_seconds.max(0).unsigned_abs(),
            memory_usage_bytes: row.memory_usage_bytes.max(0).unsigned_abs(),
        })
    }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DomainError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| DomainError::ValidationFailed(format!("invalid timestamp: {s}")))
}
