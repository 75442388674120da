//! Merge/test/retry integration loop.
//!
//! When a parent's subtasks have all passed review, their branches merge
//! sequentially into a fresh integration worktree. Conflicting branches are
//! skipped and their subtasks requeued with the conflict as feedback; a
//! failing test run requeues every subtask with the captured output. Both
//! paths burn one of the parent's three merge attempts; exhausting the
//! budget fails the parent for good.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{ReviewStatus, Task, TaskStatus, MAX_MERGE_ATTEMPTS, RETRY_EXHAUSTED};
use crate::domain::ports::{GitWorkspace, MergeOutcome, TaskRepository};

use super::task_queue::TaskQueue;

/// What one integration round did.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeRound {
    /// Everything merged, tests passed, PR opened.
    Completed { pr_url: String },
    /// One or more branches conflicted; those subtasks were requeued.
    ConflictsRequeued { conflicting: Vec<Uuid>, attempts: u32 },
    /// Tests failed; every subtask was requeued with the output.
    TestsFailedRequeued { attempts: u32 },
    /// The retry budget ran out; the parent is failed.
    RetryExhausted,
}

pub struct MergePipeline {
    git: Arc<dyn GitWorkspace>,
    tasks: Arc<dyn TaskRepository>,
    queue: Arc<TaskQueue>,
}

impl MergePipeline {
    pub fn new(
        git: Arc<dyn GitWorkspace>,
        tasks: Arc<dyn TaskRepository>,
        queue: Arc<TaskQueue>,
    ) -> Self {
        Self { git, tasks, queue }
    }

    /// Integrate a parent whose subtasks are complete and review-passed.
    /// The parent must already be in `merging`.
    pub async fn integrate(&self, parent_id: Uuid) -> DomainResult<MergeRound> {
        let parent = self
            .tasks
            .get(parent_id)
            .await?
            .ok_or(DomainError::TaskNotFound(parent_id))?;
        if parent.status != TaskStatus::Merging {
            return Err(DomainError::InvalidStateTransition {
                from: parent.status.as_str().to_string(),
                to: TaskStatus::Merging.as_str().to_string(),
            });
        }

        let subtasks: Vec<Task> = self
            .tasks
            .subtasks(parent_id)
            .await?
            .into_iter()
            .filter(|t| t.status == TaskStatus::Completed && t.git_branch.is_some())
            .collect();

        let base = self.git.default_branch().await?;
        let integration_branch = integration_branch_name(&parent);
        let worktree = self
            .git
            .prepare_integration_worktree(&integration_branch, &base)
            .await?;

        // Merge branches one at a time; a conflict aborts that merge only
        // and the remaining branches still get their chance.
        let mut conflicts: Vec<(Uuid, String)> = Vec::new();
        for subtask in &subtasks {
            let branch = subtask.git_branch.as_deref().unwrap_or_default();
            match self.git.merge_branch(&worktree, branch).await? {
                MergeOutcome::Merged => {
                    info!(task_id = %subtask.id, branch, "subtask branch merged");
                }
                MergeOutcome::Conflict { detail } => {
                    warn!(task_id = %subtask.id, branch, "subtask branch conflicted");
                    conflicts.push((subtask.id, detail));
                }
            }
        }

        if !conflicts.is_empty() {
            let attempts = self.queue.record_merge_attempt(parent_id).await?;
            if attempts >= MAX_MERGE_ATTEMPTS {
                self.fail_exhausted(parent_id).await?;
                return Ok(MergeRound::RetryExhausted);
            }
            let mut conflicting = Vec::new();
            for (subtask_id, detail) in conflicts {
                self.queue
                    .requeue(
                        subtask_id,
                        Some(format!("merge conflict while integrating:\n{detail}")),
                        None,
                    )
                    .await?;
                conflicting.push(subtask_id);
            }
            self.queue
                .transition_with(parent_id, TaskStatus::Pending, |_| {})
                .await?;
            return Ok(MergeRound::ConflictsRequeued { conflicting, attempts });
        }

        if let Some(test_command) = parent.test_command.clone() {
            let outcome = self.git.run_tests(&worktree, &test_command).await?;
            if !outcome.success {
                let attempts = self.queue.record_merge_attempt(parent_id).await?;
                if attempts >= MAX_MERGE_ATTEMPTS {
                    self.fail_exhausted(parent_id).await?;
                    return Ok(MergeRound::RetryExhausted);
                }
                warn!(task_id = %parent_id, "integration tests failed, requeueing all subtasks");
                for subtask in &subtasks {
                    self.queue
                        .requeue(
                            subtask.id,
                            Some(format!("integration tests failed:\n{}", outcome.output)),
                            None,
                        )
                        .await?;
                }
                self.queue
                    .transition_with(parent_id, TaskStatus::Pending, |_| {})
                    .await?;
                return Ok(MergeRound::TestsFailedRequeued { attempts });
            }
        }

        self.git.push_branch(&worktree, &integration_branch).await?;
        let pr_url = self
            .git
            .create_pull_request(
                &integration_branch,
                &parent.title,
                &pr_body(&parent, &subtasks),
            )
            .await?;
        self.git.remove_worktree(&worktree).await?;

        let url = pr_url.clone();
        self.queue
            .transition_with(parent_id, TaskStatus::Completed, move |t| {
                t.pr_url = Some(url);
                t.git_branch = Some(integration_branch);
                t.review_status = Some(ReviewStatus::Pass);
            })
            .await?;
        info!(task_id = %parent_id, pr = %pr_url, "parent task integrated");
        Ok(MergeRound::Completed { pr_url })
    }

    async fn fail_exhausted(&self, parent_id: Uuid) -> DomainResult<()> {
        warn!(task_id = %parent_id, "merge retry budget exhausted, failing parent");
        self.queue
            .transition_with(parent_id, TaskStatus::Failed, |t| {
                t.error = Some(RETRY_EXHAUSTED.to_string());
            })
            .await?;
        Ok(())
    }
}

fn integration_branch_name(parent: &Task) -> String {
    let short = &parent.id.to_string()[..8];
    format!("integration/{short}")
}

fn pr_body(parent: &Task, subtasks: &[Task]) -> String {
    let mut body = format!("{}\n\n## Subtasks\n", parent.description);
    for subtask in subtasks {
        body.push_str(&format!(
            "- {} (`{}`)\n",
            subtask.title,
            subtask.git_branch.as_deref().unwrap_or("-")
        ));
    }
    body
}
