//! Top-level coordinator.
//!
//! Wires the planner, dispatcher, reviewer, and merge pipeline together.
//! Only the emperor drives planning, review, and merging; workers run the
//! same loop but skip those steps until an election promotes them.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    AgentStatus, NodeId, NodeRole, ReviewStatus, Task, TaskStatus, MAX_MERGE_ATTEMPTS,
    RETRY_EXHAUSTED,
};
use crate::domain::ports::{AgentRepository, Planner, Reviewer, SubtaskPlan, TaskRepository};

use super::dispatcher::DispatchHandle;
use super::merge_pipeline::MergePipeline;
use super::replication::ReplicaEvent;
use super::task_queue::{QueueEvent, TaskQueue};

pub struct Orchestrator {
    node_id: NodeId,
    queue: Arc<TaskQueue>,
    tasks: Arc<dyn TaskRepository>,
    agents: Arc<dyn AgentRepository>,
    planner: Arc<dyn Planner>,
    reviewer: Arc<dyn Reviewer>,
    merge: Arc<MergePipeline>,
    dispatch: DispatchHandle,
    role_rx: watch::Receiver<NodeRole>,
    /// Review rounds per parent; the merge pipeline tracks its own budget
    /// in the task record.
    review_attempts: Mutex<HashMap<Uuid, u32>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: NodeId,
        queue: Arc<TaskQueue>,
        tasks: Arc<dyn TaskRepository>,
        agents: Arc<dyn AgentRepository>,
        planner: Arc<dyn Planner>,
        reviewer: Arc<dyn Reviewer>,
        merge: Arc<MergePipeline>,
        dispatch: DispatchHandle,
        role_rx: watch::Receiver<NodeRole>,
    ) -> Self {
        Self {
            node_id,
            queue,
            tasks,
            agents,
            planner,
            reviewer,
            merge,
            dispatch,
            role_rx,
            review_attempts: Mutex::new(HashMap::new()),
        }
    }

    fn is_emperor(&self) -> bool {
        *self.role_rx.borrow() == NodeRole::Emperor
    }

    /// Event loop: reacts to local queue events and replicated changes.
    pub async fn run(
        &self,
        mut queue_events: broadcast::Receiver<QueueEvent>,
        mut replica_events: broadcast::Receiver<ReplicaEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let task_id = tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                event = queue_events.recv() => match event {
                    Ok(QueueEvent::Submitted { task_id, .. })
                    | Ok(QueueEvent::StatusChanged { task_id, .. }) => Some(task_id),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "orchestrator lagged behind queue events");
                        None
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                event = replica_events.recv() => match event {
                    Ok(ReplicaEvent::TaskApplied(task_id)) => Some(task_id),
                    Ok(_) => None,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "orchestrator lagged behind replica events");
                        None
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };

            let Some(task_id) = task_id else { continue };
            if let Err(err) = self.advance(task_id).await {
                error!(task_id = %task_id, error = %err, "orchestration step failed");
            }
        }
        debug!("orchestrator stopped");
    }

    /// Drive whatever the task's current state calls for.
    pub async fn advance(&self, task_id: Uuid) -> DomainResult<()> {
        if !self.is_emperor() {
            return Ok(());
        }
        let Some(task) = self.tasks.get(task_id).await? else {
            return Ok(());
        };

        if task.parent_id.is_none() {
            self.advance_parent(task).await
        } else {
            self.advance_subtask(task).await
        }
    }

    async fn advance_parent(&self, parent: Task) -> DomainResult<()> {
        match parent.status {
            TaskStatus::Pending => {
                let subtasks = self.tasks.subtasks(parent.id).await?;
                if subtasks.is_empty() {
                    self.plan(parent).await
                } else {
                    // A requeued parent (merge or review retry) re-enters
                    // the running state without replanning.
                    self.queue
                        .transition_with(parent.id, TaskStatus::Planning, |_| {})
                        .await?;
                    self.queue
                        .transition_with(parent.id, TaskStatus::InProgress, |_| {})
                        .await?;
                    self.dispatch.task_ready();
                    self.maybe_review(parent.id).await
                }
            }
            TaskStatus::InProgress => self.maybe_review(parent.id).await,
            _ => Ok(()),
        }
    }

    async fn advance_subtask(&self, subtask: Task) -> DomainResult<()> {
        let parent_id = subtask.parent_id.unwrap_or_default();
        match subtask.status {
            TaskStatus::PendingReview => {
                self.queue.unblock_dependents(subtask.id).await?;
                self.dispatch.task_ready();
                self.maybe_review(parent_id).await
            }
            TaskStatus::Completed => {
                self.queue.unblock_dependents(subtask.id).await?;
                self.dispatch.task_ready();
                self.maybe_review(parent_id).await
            }
            TaskStatus::Failed => {
                // A terminally failed subtask sinks the parent.
                if let Some(parent) = self.tasks.get(parent_id).await? {
                    if !parent.is_terminal() && parent.can_transition_to(TaskStatus::Failed) {
                        warn!(parent_id = %parent_id, subtask = %subtask.id, "subtask failed, failing parent");
                        self.queue
                            .transition_with(parent_id, TaskStatus::Failed, |t| {
                                t.error = Some(format!("subtask {} failed", subtask.id));
                            })
                            .await?;
                    }
                }
                Ok(())
            }
            TaskStatus::Pending | TaskStatus::Blocked => {
                self.dispatch.task_ready();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Decompose a fresh parent task into subtasks.
    async fn plan(&self, parent: Task) -> DomainResult<()> {
        info!(task_id = %parent.id, title = %parent.title, "planning task");
        let parent = self
            .queue
            .transition_with(parent.id, TaskStatus::Planning, |_| {})
            .await?;

        let plans = match self.planner.decompose(&parent).await {
            Ok(plans) if !plans.is_empty() => plans,
            Ok(_) => {
                warn!(task_id = %parent.id, "planner returned no subtasks");
                self.queue
                    .transition_with(parent.id, TaskStatus::Failed, |t| {
                        t.error = Some("planner produced an empty plan".to_string());
                    })
                    .await?;
                return Ok(());
            }
            Err(err) => {
                error!(task_id = %parent.id, error = %err, "planner failed");
                self.queue
                    .transition_with(parent.id, TaskStatus::Failed, |t| {
                        t.error = Some(format!("planning failed: {err}"));
                    })
                    .await?;
                return Ok(());
            }
        };

        validate_plan(&plans)?;
        let mut ids: Vec<Uuid> = Vec::with_capacity(plans.len());
        for (index, plan) in plans.iter().enumerate() {
            let mut subtask = Task::new(plan.title.clone(), plan.description.clone(), self.node_id.clone())
                .with_parent(parent.id)
                .with_priority(parent.priority)
                .with_capabilities(plan.required_capabilities.clone())
                .with_complexity(plan.complexity)
                .with_instructions(plan.work_instructions.clone(), plan.acceptance_criteria.clone());
            subtask.project_path = parent.project_path.clone();
            subtask.git_branch = Some(subtask_branch(&parent, index, &plan.title));
            for dep_index in &plan.depends_on {
                subtask = subtask.with_dependency(ids[*dep_index]);
            }
            let subtask = self.queue.submit(subtask).await?;
            ids.push(subtask.id);
        }

        self.queue
            .transition_with(parent.id, TaskStatus::InProgress, |_| {})
            .await?;
        self.dispatch.task_ready();
        info!(task_id = %parent.id, subtasks = ids.len(), "task decomposed");
        Ok(())
    }

    /// Run the review once every subtask has finished its work.
    async fn maybe_review(&self, parent_id: Uuid) -> DomainResult<()> {
        let Some(parent) = self.tasks.get(parent_id).await? else {
            return Ok(());
        };
        if parent.status != TaskStatus::InProgress {
            return Ok(());
        }
        let subtasks = self.tasks.subtasks(parent_id).await?;
        if subtasks.is_empty() {
            return Ok(());
        }
        let all_done = subtasks
            .iter()
            .all(|t| matches!(t.status, TaskStatus::PendingReview | TaskStatus::Completed));
        if !all_done {
            return Ok(());
        }

        let parent = self
            .queue
            .transition_with(parent_id, TaskStatus::PendingReview, |_| {})
            .await?;
        self.review(parent, subtasks).await
    }

    async fn review(&self, parent: Task, subtasks: Vec<Task>) -> DomainResult<()> {
        info!(task_id = %parent.id, "reviewing task output");
        let verdict = match self.reviewer.evaluate(&parent, &subtasks).await {
            Ok(verdict) => verdict,
            Err(err) => {
                // A broken reviewer must not wedge the task in
                // pending_review; requeue the round and try again later.
                error!(task_id = %parent.id, error = %err, "reviewer failed");
                self.queue
                    .transition_with(parent.id, TaskStatus::Pending, |_| {})
                    .await?;
                return Ok(());
            }
        };

        if verdict.passed {
            for subtask in &subtasks {
                if subtask.status == TaskStatus::PendingReview {
                    self.queue.approve(subtask.id, Some(verdict.feedback.clone())).await?;
                }
            }
            self.queue
                .transition_with(parent.id, TaskStatus::Merging, |t| {
                    t.review_status = Some(ReviewStatus::Pass);
                    t.review_feedback = Some(verdict.feedback.clone());
                })
                .await?;
            let round = self.merge.integrate(parent.id).await?;
            info!(task_id = %parent.id, ?round, "merge round finished");
            return Ok(());
        }

        let attempts = {
            let mut map = self.review_attempts.lock().await;
            let entry = map.entry(parent.id).or_insert(0);
            *entry += 1;
            *entry
        };

        if attempts >= MAX_MERGE_ATTEMPTS {
            warn!(task_id = %parent.id, attempts, "review retries exhausted, failing parent");
            self.queue
                .transition_with(parent.id, TaskStatus::Failed, |t| {
                    t.error = Some(RETRY_EXHAUSTED.to_string());
                    t.review_status = Some(ReviewStatus::Fail);
                    t.review_feedback = Some(verdict.feedback.clone());
                })
                .await?;
            return Ok(());
        }

        info!(task_id = %parent.id, attempts, "review failed, requeueing subtasks with feedback");
        for subtask in &subtasks {
            if matches!(subtask.status, TaskStatus::PendingReview | TaskStatus::Completed) {
                self.queue
                    .requeue(subtask.id, Some(verdict.feedback.clone()), Some(ReviewStatus::Fail))
                    .await?;
            }
        }
        self.queue
            .transition_with(parent.id, TaskStatus::Pending, |t| {
                t.review_status = Some(ReviewStatus::Fail);
                t.review_feedback = Some(verdict.feedback.clone());
            })
            .await?;
        self.dispatch.task_ready();
        Ok(())
    }

    /// Startup reconciliation: tasks still assigned to agents that no
    /// longer exist (or are offline) go back to pending.
    pub async fn reconcile_on_startup(&self) -> DomainResult<usize> {
        let mut requeued = 0;
        for status in [TaskStatus::Claimed, TaskStatus::InProgress, TaskStatus::WaitingInput] {
            let stranded = self
                .tasks
                .list(crate::domain::ports::TaskFilter {
                    status: Some(status),
                    ..Default::default()
                })
                .await?;
            for task in stranded {
                let Some(agent_id) = task.assigned_to else { continue };
                let agent = self.agents.get(agent_id).await?;
                let gone = match agent {
                    None => true,
                    Some(a) => a.node_id == self.node_id && a.status == AgentStatus::Offline,
                };
                if gone {
                    warn!(task_id = %task.id, "reconciling stranded task back to pending");
                    self.queue
                        .requeue(task.id, Some("assigned agent lost".to_string()), task.review_status)
                        .await?;
                    requeued += 1;
                }
            }
        }
        Ok(requeued)
    }
}

/// Reject plans whose dependency indices are self- or forward-references;
/// index-ordered edges make the DAG property structural.
fn validate_plan(plans: &[SubtaskPlan]) -> DomainResult<()> {
    for (index, plan) in plans.iter().enumerate() {
        for dep in &plan.depends_on {
            if *dep >= index {
                return Err(DomainError::ValidationFailed(format!(
                    "subtask {index} depends on {dep}, which is not an earlier subtask"
                )));
            }
        }
    }
    Ok(())
}

fn subtask_branch(parent: &Task, index: usize, title: &str) -> String {
    let short = &parent.id.to_string()[..8];
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .take(4)
        .collect::<Vec<_>>()
        .join("-");
    format!("task/{short}/{index}-{slug}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Complexity;

    fn plan(deps: Vec<usize>) -> SubtaskPlan {
        SubtaskPlan {
            title: "s".into(),
            description: "d".into(),
            work_instructions: "w".into(),
            acceptance_criteria: "a".into(),
            required_capabilities: vec![],
            complexity: Complexity::Small,
            depends_on: deps,
        }
    }

    #[test]
    fn forward_dependency_rejected() {
        assert!(validate_plan(&[plan(vec![]), plan(vec![0])]).is_ok());
        assert!(validate_plan(&[plan(vec![1]), plan(vec![])]).is_err());
        assert!(validate_plan(&[plan(vec![0])]).is_err());
    }

    #[test]
    fn branch_names_are_slugged() {
        let parent = Task::new("Parent", "d", NodeId::from_string("aaaa"));
        let branch = subtask_branch(&parent, 2, "Fix the HTTP/2 handler!");
        assert!(branch.starts_with("task/"));
        assert!(branch.ends_with("2-fix-the-http-2"));
        assert!(!branch.contains(' '));
    }
}
