//! SQLite implementation of the `AgentRepository`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Agent, AgentStatus, NodeId};
use crate::domain::ports::AgentRepository;

#[derive(Clone)]
pub struct SqliteAgentRepository {
    pool: SqlitePool,
}

impl SqliteAgentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AgentRepository for SqliteAgentRepository {
    async fn upsert(&self, agent: &Agent) -> DomainResult<()> {
        let caps_json = serde_json::to_string(&agent.capabilities)?;
        sqlx::query(
            r#"INSERT INTO agents (id, node_id, name, tool, model, capabilities, status,
               current_task_id, session_handle, project_path, max_concurrent_tasks,
               last_heartbeat, lamport_ts, registered_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 node_id = excluded.node_id,
                 name = excluded.name,
                 tool = excluded.tool,
                 model = excluded.model,
                 capabilities = excluded.capabilities,
                 status = excluded.status,
                 current_task_id = excluded.current_task_id,
                 session_handle = excluded.session_handle,
                 project_path = excluded.project_path,
                 max_concurrent_tasks = excluded.max_concurrent_tasks,
                 last_heartbeat = excluded.last_heartbeat,
                 lamport_ts = excluded.lamport_ts"#,
        )
        .bind(agent.id.to_string())
        .bind(agent.node_id.as_str())
        .bind(&agent.name)
        .bind(&agent.tool)
        .bind(&agent.model)
        .bind(&caps_json)
        .bind(agent.status.as_str())
        .bind(agent.current_task_id.map(|id| id.to_string()))
        .bind(&agent.session_handle)
        .bind(&agent.project_path)
        .bind(i64::from(agent.max_concurrent_tasks))
        .bind(agent.last_heartbeat.to_rfc3339())
        .bind(ts_to_i64(agent.lamport_ts))
        .bind(agent.registered_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_replica(&self, agent: &Agent) -> DomainResult<bool> {
        let caps_json = serde_json::to_string(&agent.capabilities)?;
        let result = sqlx::query(
            r#"INSERT INTO agents (id, node_id, name, tool, model, capabilities, status,
               current_task_id, session_handle, project_path, max_concurrent_tasks,
               last_heartbeat, lamport_ts, registered_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 node_id = excluded.node_id,
                 name = excluded.name,
                 tool = excluded.tool,
                 model = excluded.model,
                 capabilities = excluded.capabilities,
                 status = excluded.status,
                 current_task_id = excluded.current_task_id,
                 session_handle = excluded.session_handle,
                 project_path = excluded.project_path,
                 max_concurrent_tasks = excluded.max_concurrent_tasks,
                 last_heartbeat = excluded.last_heartbeat,
                 lamport_ts = excluded.lamport_ts
               WHERE excluded.lamport_ts > agents.lamport_ts
                  OR (excluded.lamport_ts = agents.lamport_ts
                      AND excluded.node_id > agents.node_id)"#,
        )
        .bind(agent.id.to_string())
        .bind(agent.node_id.as_str())
        .bind(&agent.name)
        .bind(&agent.tool)
        .bind(&agent.model)
        .bind(&caps_json)
        .bind(agent.status.as_str())
        .bind(agent.current_task_id.map(|id| id.to_string()))
        .bind(&agent.session_handle)
        .bind(&agent.project_path)
        .bind(i64::from(agent.max_concurrent_tasks))
        .bind(agent.last_heartbeat.to_rfc3339())
        .bind(ts_to_i64(agent.lamport_ts))
        .bind(agent.registered_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<Agent>> {
        let row: Option<AgentRow> = sqlx::query_as("SELECT * FROM agents WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Agent::try_from).transpose()
    }

    async fn get_by_name(&self, name: &str) -> DomainResult<Option<Agent>> {
        let row: Option<AgentRow> = sqlx::query_as("SELECT * FROM agents WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Agent::try_from).transpose()
    }

    async fn list(&self) -> DomainResult<Vec<Agent>> {
        let rows: Vec<AgentRow> = sqlx::query_as("SELECT * FROM agents ORDER BY registered_at")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Agent::try_from).collect()
    }

    async fn list_by_node(&self, node_id: &NodeId) -> DomainResult<Vec<Agent>> {
        let rows: Vec<AgentRow> =
            sqlx::query_as("SELECT * FROM agents WHERE node_id = ? ORDER BY registered_at")
                .bind(node_id.as_str())
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(Agent::try_from).collect()
    }

    async fn idle_agents(&self, node_id: &NodeId) -> DomainResult<Vec<Agent>> {
        let rows: Vec<AgentRow> = sqlx::query_as(
            "SELECT * FROM agents WHERE node_id = ? AND status = 'idle' ORDER BY registered_at",
        )
        .bind(node_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Agent::try_from).collect()
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: AgentStatus,
        current_task_id: Option<Uuid>,
        lamport_ts: u64,
    ) -> DomainResult<()> {
        let result = sqlx::query(
            r#"UPDATE agents SET status = ?, current_task_id = ?, lamport_ts = ?, last_heartbeat = ?
               WHERE id = ?"#,
        )
        .bind(status.as_str())
        .bind(current_task_id.map(|id| id.to_string()))
        .bind(ts_to_i64(lamport_ts))
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DomainError::AgentNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn since(&self, lamport_ts: u64) -> DomainResult<Vec<Agent>> {
        let rows: Vec<AgentRow> =
            sqlx::query_as("SELECT * FROM agents WHERE lamport_ts > ? ORDER BY lamport_ts")
                .bind(ts_to_i64(lamport_ts))
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(Agent::try_from).collect()
    }

    async fn max_lamport_ts(&self) -> DomainResult<u64> {
        let row: (i64,) = sqlx::query_as("SELECT COALESCE(MAX(lamport_ts), 0) FROM agents")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0.max(0).unsigned_abs())
    }

    async fn delete(&self, id: Uuid) -> DomainResult<()> {
        let result = sqlx::query("DELETE FROM agents WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DomainError::AgentNotFound(id.to_string()));
        }
        Ok(())
    }
}

#[allow(clippy::cast_possible_wrap)]
fn ts_to_i64(ts: u64) -> i64 {
    ts as i64
}

#[derive(sqlx::FromRow)]
struct AgentRow {
    id: String,
    node_id: String,
    name: String,
    tool: String,
    model: String,
    capabilities: String,
    status: String,
    current_task_id: Option<String>,
    session_handle: Option<String>,
    project_path: String,
    max_concurrent_tasks: i64,
    last_heartbeat: String,
    lamport_ts: i64,
    registered_at: String,
}

impl TryFrom<AgentRow> for Agent {
    type Error = DomainError;

    fn try_from(row: AgentRow) -> Result<Self, Self::Error> {
        let status = AgentStatus::parse_str(&row.status)
            .ok_or_else(|| DomainError::ValidationFailed(format!("unknown agent status: {}", row.status)))?;
        Ok(Agent {
            id: Uuid::parse_str(&row.id)
                .map_err(|_| DomainError::ValidationFailed(format!("invalid uuid: {}", row.id)))?,
            node_id: NodeId::from_string(row.node_id),
            name: row.name,
            tool: row.tool,
            model: row.model,
            capabilities: serde_json::from_str(&row.capabilities)?,
            status,
            current_task_id: row
                .current_task_id
                .as_deref()
                .map(Uuid::parse_str)
                .transpose()
                .map_err(|_| DomainError::ValidationFailed("invalid current_task_id".into()))?,
            session_handle: row.session_handle,
            project_path: row.project_path,
            max_concurrent_tasks: u32::try_from(row.max_concurrent_tasks.max(1)).unwrap_or(1),
            last_heartbeat: parse_datetime(&row.last_heartbeat)?,
            lamport_ts: row.lamport_ts.max(0).unsigned_abs(),
            registered_at: parse_datetime(&row.registered_at)?,
        })
    }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DomainError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| DomainError::ValidationFailed(format!("invalid timestamp: {s}")))
}
