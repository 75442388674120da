//! Task lifecycle service.
//!
//! Every local mutation follows the same discipline: advance the Lamport
//! clock, persist, gossip the matching wire message, and emit a queue event
//! for the dispatcher and orchestrator. Remote mutations arrive through the
//! replication ingest path instead.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    Agent, AgentStatus, NodeId, ReviewStatus, Task, TaskStatus, MAX_MERGE_ATTEMPTS,
};
use crate::domain::ports::{AgentRepository, TaskRepository};
use crate::mesh::wire::{
    AgentGossip, Message, TaskCancel, TaskClaim, TaskComplete, TaskCreate, TaskFail, TaskUpdate,
};
use crate::mesh::{GossipEngine, LamportClock};

/// Emitted after a local mutation lands.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Submitted { task_id: Uuid, parent_id: Option<Uuid> },
    StatusChanged { task_id: Uuid, status: TaskStatus },
}

pub struct TaskQueue {
    node_id: NodeId,
    clock: Arc<LamportClock>,
    tasks: Arc<dyn TaskRepository>,
    agents: Arc<dyn AgentRepository>,
    gossip: Arc<GossipEngine>,
    events_tx: broadcast::Sender<QueueEvent>,
}

impl TaskQueue {
    pub fn new(
        node_id: NodeId,
        clock: Arc<LamportClock>,
        tasks: Arc<dyn TaskRepository>,
        agents: Arc<dyn AgentRepository>,
        gossip: Arc<GossipEngine>,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self { node_id, clock, tasks, agents, gossip, events_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events_tx.subscribe()
    }

    pub fn tasks(&self) -> &Arc<dyn TaskRepository> {
        &self.tasks
    }

    /// Submit a new task (or subtask) originating on this node.
    pub async fn submit(&self, mut task: Task) -> DomainResult<Task> {
        task.validate().map_err(DomainError::ValidationFailed)?;
        task.origin_node = self.node_id.clone();
        task.lamport_ts = self.clock.tick();
        self.tasks.create(&task).await?;

        info!(task_id = %task.id, title = %task.title, "task submitted");
        self.gossip
            .publish(Message::TaskCreate(TaskCreate {
                message_id: Uuid::new_v4(),
                task: task.clone(),
            }))
            .await;
        let _ = self.events_tx.send(QueueEvent::Submitted {
            task_id: task.id,
            parent_id: task.parent_id,
        });
        Ok(task)
    }

    async fn load(&self, task_id: Uuid) -> DomainResult<Task> {
        self.tasks
            .get(task_id)
            .await?
            .ok_or(DomainError::TaskNotFound(task_id))
    }

    fn stamp(&self, task: &mut Task) {
        task.origin_node = self.node_id.clone();
        task.lamport_ts = self.clock.tick();
    }

    /// Transition a task locally: state machine check, stamp, persist,
    /// gossip, notify.
    async fn transition(
        &self,
        task_id: Uuid,
        to: TaskStatus,
        mutate: impl FnOnce(&mut Task),
    ) -> DomainResult<Task> {
        let mut task = self.load(task_id).await?;
        let from = task.status;
        mutate(&mut task);
        task.transition_to(to).map_err(|_| DomainError::InvalidStateTransition {
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        })?;
        self.stamp(&mut task);
        self.tasks.update(&task).await?;

        debug!(task_id = %task.id, from = from.as_str(), to = to.as_str(), "task transitioned");
        self.gossip.publish(self.wire_for(&task, to)).await;
        let _ = self.events_tx.send(QueueEvent::StatusChanged { task_id: task.id, status: to });
        Ok(task)
    }

    /// The TASK_* message a transition gossips.
    fn wire_for(&self, task: &Task, to: TaskStatus) -> Message {
        let message_id = Uuid::new_v4();
        match to {
            TaskStatus::PendingReview => Message::TaskComplete(TaskComplete {
                message_id,
                task_id: task.id,
                result: task.result.clone(),
                lamport_ts: task.lamport_ts,
                task: task.clone(),
            }),
            TaskStatus::Failed => Message::TaskFail(TaskFail {
                message_id,
                task_id: task.id,
                error: task.error.clone().unwrap_or_default(),
                lamport_ts: task.lamport_ts,
                task: task.clone(),
            }),
            TaskStatus::Cancelled => Message::TaskCancel(TaskCancel {
                message_id,
                task_id: task.id,
                task: task.clone(),
            }),
            _ => Message::TaskUpdate(TaskUpdate {
                message_id,
                task_id: task.id,
                progress: task.progress.clone(),
                lamport_ts: task.lamport_ts,
                task: task.clone(),
            }),
        }
    }

    /// Atomic local claim: the compare-and-set flips `pending -> claimed`
    /// exactly once; the winning ticket is gossiped for the resolver on
    /// every other node.
    pub async fn claim(&self, task: &Task, agent: &Agent) -> DomainResult<bool> {
        let ts = self.clock.tick();
        let won = self
            .tasks
            .try_claim(task.id, agent.id, &self.node_id, ts)
            .await?;
        if !won {
            return Ok(false);
        }

        self.agents
            .set_status(agent.id, AgentStatus::Busy, Some(task.id), self.clock.tick())
            .await?;

        info!(task_id = %task.id, agent = %agent.name, ts, "task claimed");
        self.gossip
            .publish(Message::TaskClaim(TaskClaim {
                message_id: Uuid::new_v4(),
                task_id: task.id,
                agent_id: agent.id,
                node_id: self.node_id.clone(),
                lamport_ts: ts,
            }))
            .await;
        if let Ok(Some(updated)) = self.agents.get(agent.id).await {
            self.gossip
                .publish(Message::AgentHeartbeat(AgentGossip {
                    message_id: Uuid::new_v4(),
                    agent: updated,
                }))
                .await;
        }
        let _ = self.events_tx.send(QueueEvent::StatusChanged {
            task_id: task.id,
            status: TaskStatus::Claimed,
        });
        Ok(true)
    }

    /// Prompt delivered; the agent is working.
    pub async fn start(&self, task_id: Uuid) -> DomainResult<Task> {
        self.transition(task_id, TaskStatus::InProgress, |_| {}).await
    }

    /// MCP `task_complete`: work done, awaiting review. A fresh completion
    /// supersedes any earlier failed verdict.
    pub async fn complete(&self, task_id: Uuid, result: Option<String>) -> DomainResult<Task> {
        let task = self
            .transition(task_id, TaskStatus::PendingReview, |t| {
                t.result = result;
                t.review_status = None;
            })
            .await?;
        Ok(task)
    }

    /// MCP `task_failed` (or monitor-detected failure).
    pub async fn fail(&self, task_id: Uuid, error: impl Into<String>) -> DomainResult<Task> {
        let error = error.into();
        let previous = self.load(task_id).await?;
        let task = self
            .transition(task_id, TaskStatus::Failed, |t| t.error = Some(error.clone()))
            .await?;
        self.release_agent(previous.assigned_to).await;
        Ok(task)
    }

    /// MCP `task_progress`: no status change, just the progress note.
    pub async fn progress(&self, task_id: Uuid, progress: impl Into<String>) -> DomainResult<Task> {
        let mut task = self.load(task_id).await?;
        task.progress = Some(progress.into());
        task.updated_at = chrono::Utc::now();
        self.stamp(&mut task);
        self.tasks.update(&task).await?;
        self.gossip
            .publish(Message::TaskUpdate(TaskUpdate {
                message_id: Uuid::new_v4(),
                task_id: task.id,
                progress: task.progress.clone(),
                lamport_ts: task.lamport_ts,
                task: task.clone(),
            }))
            .await;
        Ok(task)
    }

    /// MCP `task_needs_input`.
    pub async fn needs_input(&self, task_id: Uuid, question: Option<String>) -> DomainResult<Task> {
        self.transition(task_id, TaskStatus::WaitingInput, |t| {
            if let Some(q) = question {
                t.progress = Some(q);
            }
        })
        .await
    }

    /// Human answered; back to work.
    pub async fn resume(&self, task_id: Uuid) -> DomainResult<Task> {
        self.transition(task_id, TaskStatus::InProgress, |_| {}).await
    }

    /// Operator cancel. Valid from any non-terminal status.
    pub async fn cancel(&self, task_id: Uuid) -> DomainResult<Task> {
        let previous = self.load(task_id).await?;
        let task = self.transition(task_id, TaskStatus::Cancelled, |_| {}).await?;
        self.release_agent(previous.assigned_to).await;
        Ok(task)
    }

    /// Requeue a task to `pending`, carrying feedback for the next attempt.
    pub async fn requeue(
        &self,
        task_id: Uuid,
        feedback: Option<String>,
        review_status: Option<ReviewStatus>,
    ) -> DomainResult<Task> {
        let previous = self.load(task_id).await?;
        let task = self
            .transition(task_id, TaskStatus::Pending, |t| {
                t.review_feedback = feedback;
                t.review_status = review_status;
                t.result = None;
                t.progress = None;
                t.completed_at = None;
            })
            .await?;
        self.release_agent(previous.assigned_to).await;
        Ok(task)
    }

    /// Review passed for a subtask.
    pub async fn approve(&self, task_id: Uuid, feedback: Option<String>) -> DomainResult<Task> {
        let previous = self.load(task_id).await?;
        let task = self
            .transition(task_id, TaskStatus::Completed, |t| {
                t.review_status = Some(ReviewStatus::Pass);
                t.review_feedback = feedback;
            })
            .await?;
        self.release_agent(previous.assigned_to).await;
        Ok(task)
    }

    /// Dependencies unsatisfied; park the subtask.
    pub async fn mark_blocked(&self, task_id: Uuid) -> DomainResult<Task> {
        self.transition(task_id, TaskStatus::Blocked, |_| {}).await
    }

    /// Dependencies now satisfied; make it claimable again.
    pub async fn unblock(&self, task_id: Uuid) -> DomainResult<Task> {
        self.transition(task_id, TaskStatus::Pending, |_| {}).await
    }

    /// Count a merge/review round against the parent's retry budget.
    /// Returns the new attempt count.
    pub async fn record_merge_attempt(&self, parent_id: Uuid) -> DomainResult<u32> {
        let mut task = self.load(parent_id).await?;
        task.merge_attempts = (task.merge_attempts + 1).min(MAX_MERGE_ATTEMPTS);
        task.updated_at = chrono::Utc::now();
        self.stamp(&mut task);
        self.tasks.update(&task).await?;
        self.gossip
            .publish(Message::TaskUpdate(TaskUpdate {
                message_id: Uuid::new_v4(),
                task_id: task.id,
                progress: None,
                lamport_ts: task.lamport_ts,
                task: task.clone(),
            }))
            .await;
        warn!(task_id = %parent_id, attempts = task.merge_attempts, "merge attempt recorded");
        Ok(task.merge_attempts)
    }

    /// Generic stamped transition used by the orchestrator/merge pipeline
    /// for parent bookkeeping (branch names, PR URLs, review fields).
    pub async fn transition_with(
        &self,
        task_id: Uuid,
        to: TaskStatus,
        mutate: impl FnOnce(&mut Task),
    ) -> DomainResult<Task> {
        self.transition(task_id, to, mutate).await
    }

    /// Are all of a task's dependencies complete and not review-failed?
    /// `pending_review` counts: the work is done the moment the agent
    /// reports completion, and a later failed review re-blocks dependents
    /// through the requeue.
    pub async fn dependencies_satisfied(&self, task_id: Uuid) -> DomainResult<bool> {
        let deps = self.tasks.dependencies(task_id).await?;
        Ok(deps.iter().all(|d| {
            matches!(d.status, TaskStatus::Completed | TaskStatus::PendingReview)
                && d.review_status != Some(ReviewStatus::Fail)
        }))
    }

    /// A task completed: unblock any dependents whose edges are now all
    /// satisfied.
    pub async fn unblock_dependents(&self, task_id: Uuid) -> DomainResult<Vec<Uuid>> {
        let mut unblocked = Vec::new();
        for dependent in self.tasks.dependents(task_id).await? {
            if dependent.status == TaskStatus::Blocked
                && self.dependencies_satisfied(dependent.id).await?
            {
                self.unblock(dependent.id).await?;
                unblocked.push(dependent.id);
            }
        }
        Ok(unblocked)
    }

    /// Losing claims and terminal transitions hand the agent back.
    async fn release_agent(&self, agent_id: Option<Uuid>) {
        let Some(agent_id) = agent_id else { return };
        let Ok(Some(agent)) = self.agents.get(agent_id).await else { return };
        if agent.node_id != self.node_id {
            return;
        }
        if self
            .agents
            .set_status(agent.id, AgentStatus::Idle, None, self.clock.tick())
            .await
            .is_ok()
        {
            if let Ok(Some(updated)) = self.agents.get(agent.id).await {
                self.gossip
                    .publish(Message::AgentHeartbeat(AgentGossip {
                        message_id: Uuid::new_v4(),
                        agent: updated,
                    }))
                    .await;
            }
        }
    }
}
