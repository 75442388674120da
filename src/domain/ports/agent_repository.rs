//! Agent repository port.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Agent, AgentStatus, NodeId};

/// Repository interface for Agent persistence.
#[async_trait]
pub trait AgentRepository: Send + Sync {
    /// Insert or fully replace a locally-owned agent record.
    async fn upsert(&self, agent: &Agent) -> DomainResult<()>;

    /// Apply a replicated record last-writer-wins. Returns `true` when
    /// applied, `false` when stale.
    async fn upsert_replica(&self, agent: &Agent) -> DomainResult<bool>;

    async fn get(&self, id: Uuid) -> DomainResult<Option<Agent>>;

    async fn get_by_name(&self, name: &str) -> DomainResult<Option<Agent>>;

    async fn list(&self) -> DomainResult<Vec<Agent>>;

    /// Agents hosted by one node.
    async fn list_by_node(&self, node_id: &NodeId) -> DomainResult<Vec<Agent>>;

    /// Idle agents on the given node, registration order.
    async fn idle_agents(&self, node_id: &NodeId) -> DomainResult<Vec<Agent>>;

    /// Update just the status/current-task fields of an agent.
    async fn set_status(
        &self,
        id: Uuid,
        status: AgentStatus,
        current_task_id: Option<Uuid>,
        lamport_ts: u64,
    ) -> DomainResult<()>;

    /// Records with `lamport_ts` strictly greater than the watermark.
    async fn since(&self, lamport_ts: u64) -> DomainResult<Vec<Agent>>;

    async fn max_lamport_ts(&self) -> DomainResult<u64>;

    async fn delete(&self, id: Uuid) -> DomainResult<()>;
}
