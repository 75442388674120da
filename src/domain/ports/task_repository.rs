//! Task repository port.

use async_trait::async_trait;
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{NodeId, Task, TaskStatus};

/// Filter criteria for listing tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub parent_id: Option<Uuid>,
    pub assigned_to: Option<Uuid>,
    pub include_archived: bool,
    pub limit: Option<usize>,
}

/// Repository interface for Task persistence.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Create a new task (with its dependency edges).
    async fn create(&self, task: &Task) -> DomainResult<()>;

    /// Get a task by ID.
    async fn get(&self, id: Uuid) -> DomainResult<Option<Task>>;

    /// Update an existing task.
    async fn update(&self, task: &Task) -> DomainResult<()>;

    /// Apply a replicated record last-writer-wins. Returns `true` when the
    /// incoming `(lamport_ts, origin_node)` is newer than the stored row and
    /// was applied; `false` when the record was stale or identical.
    async fn upsert_replica(&self, task: &Task) -> DomainResult<bool>;

    /// Atomically claim a pending/blocked task for an agent. Returns `true`
    /// only when this call performed the `pending -> claimed` flip.
    async fn try_claim(
        &self,
        task_id: Uuid,
        agent_id: Uuid,
        node_id: &NodeId,
        lamport_ts: u64,
    ) -> DomainResult<bool>;

    /// List tasks with optional filters, newest first.
    async fn list(&self, filter: TaskFilter) -> DomainResult<Vec<Task>>;

    /// Subtasks of a parent task.
    async fn subtasks(&self, parent_id: Uuid) -> DomainResult<Vec<Task>>;

    /// Pending, unarchived subtasks in dispatch order: priority descending,
    /// then `created_at` ascending, then id.
    async fn list_dispatchable(&self, limit: usize) -> DomainResult<Vec<Task>>;

    /// Tasks currently assigned to the given agent in an active status.
    async fn active_for_agent(&self, agent_id: Uuid) -> DomainResult<Vec<Task>>;

    /// Add a dependency edge.
    async fn add_dependency(&self, task_id: Uuid, depends_on: Uuid) -> DomainResult<()>;

    /// Direct dependencies of a task.
    async fn dependencies(&self, task_id: Uuid) -> DomainResult<Vec<Task>>;

    /// Tasks that directly depend on the given task.
    async fn dependents(&self, task_id: Uuid) -> DomainResult<Vec<Task>>;

    /// Records with `lamport_ts` strictly greater than the watermark.
    async fn since(&self, lamport_ts: u64) -> DomainResult<Vec<Task>>;

    /// Highest Lamport timestamp stored, 0 when empty.
    async fn max_lamport_ts(&self) -> DomainResult<u64>;

    /// Count tasks by status.
    async fn count_by_status(&self) -> DomainResult<HashMap<TaskStatus, u64>>;

    /// Soft-delete a task.
    async fn archive(&self, id: Uuid) -> DomainResult<()>;
}
