//! Task domain model.
//!
//! Tasks are user-level units of work. Subtasks reference their parent via
//! `parent_id` and form a dependency DAG. Every record carries the Lamport
//! timestamp and origin node of its last mutation so replicas can merge
//! last-writer-wins.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::node::NodeId;

/// Upper bound on merge/review retry rounds for a parent task.
pub const MAX_MERGE_ATTEMPTS: u32 = 3;

/// Failure reason recorded when the retry budget is exhausted.
pub const RETRY_EXHAUSTED: &str = "retry-exhausted";

/// Status of a task in its lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Defined, not yet picked up.
    Pending,
    /// Parent task is being decomposed by the planner.
    Planning,
    /// Dependencies not yet satisfied.
    Blocked,
    /// An agent won the claim but has not started yet.
    Claimed,
    /// An agent is working on it (or, for a parent, subtasks are running).
    InProgress,
    /// Agent is blocked on human input.
    WaitingInput,
    /// Work finished, awaiting review verdict.
    PendingReview,
    /// Parent task: branches are being merged and tested.
    Merging,
    /// Done.
    Completed,
    /// Gave up.
    Failed,
    /// Operator cancelled.
    Cancelled,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Planning => "planning",
            Self::Blocked => "blocked",
            Self::Claimed => "claimed",
            Self::InProgress => "in_progress",
            Self::WaitingInput => "waiting_input",
            Self::PendingReview => "pending_review",
            Self::Merging => "merging",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "planning" => Some(Self::Planning),
            "blocked" => Some(Self::Blocked),
            "claimed" => Some(Self::Claimed),
            "in_progress" => Some(Self::InProgress),
            "waiting_input" => Some(Self::WaitingInput),
            "pending_review" => Some(Self::PendingReview),
            "merging" => Some(Self::Merging),
            "completed" | "complete" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a task in this status must have an assignee.
    pub fn requires_assignee(&self) -> bool {
        matches!(self, Self::Claimed | Self::InProgress | Self::WaitingInput | Self::PendingReview)
    }

    /// Valid transitions from this status.
    pub fn valid_transitions(&self) -> &'static [TaskStatus] {
        match self {
            Self::Pending => &[Self::Planning, Self::Blocked, Self::Claimed, Self::Cancelled],
            Self::Planning => &[Self::InProgress, Self::Failed, Self::Cancelled],
            Self::Blocked => &[Self::Pending, Self::Claimed, Self::Cancelled],
            Self::Claimed => &[Self::InProgress, Self::Pending, Self::Cancelled],
            Self::InProgress => &[
                Self::PendingReview,
                Self::WaitingInput,
                Self::Pending,
                Self::Failed,
                Self::Cancelled,
            ],
            Self::WaitingInput => &[Self::InProgress, Self::Pending, Self::Failed, Self::Cancelled],
            Self::PendingReview => &[
                Self::Merging,
                Self::Completed,
                Self::Pending,
                Self::Failed,
                Self::Cancelled,
            ],
            Self::Merging => &[Self::Completed, Self::Pending, Self::Failed, Self::Cancelled],
            // Completed is terminal in the normal flow; the single re-entry
            // is a merge-round requeue pulling a subtask back for rework.
            Self::Completed => &[Self::Pending],
            Self::Failed => &[],
            Self::Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

/// Review verdict on a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pass,
    Fail,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pass" => Some(Self::Pass),
            "fail" => Some(Self::Fail),
            _ => None,
        }
    }
}

/// Size classification produced by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Small,
    Medium,
    Large,
    Xl,
}

impl Default for Complexity {
    fn default() -> Self {
        Self::Medium
    }
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
            Self::Xl => "xl",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "small" => Some(Self::Small),
            "medium" => Some(Self::Medium),
            "large" => Some(Self::Large),
            "xl" => Some(Self::Xl),
            _ => None,
        }
    }
}

/// A user-level unit of work, or a subtask of one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    /// Parent task for subtasks.
    pub parent_id: Option<Uuid>,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    /// Higher dispatches first.
    pub priority: i64,
    pub complexity: Complexity,
    pub required_capabilities: Vec<String>,
    /// Agent currently responsible, when status requires one.
    pub assigned_to: Option<Uuid>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub progress: Option<String>,
    pub project_path: Option<String>,
    pub context: Option<String>,
    pub work_instructions: Option<String>,
    pub acceptance_criteria: Option<String>,
    pub review_status: Option<ReviewStatus>,
    pub review_feedback: Option<String>,
    pub archived: bool,
    pub git_branch: Option<String>,
    pub merge_attempts: u32,
    pub test_command: Option<String>,
    /// Task IDs this task depends on. Must form a DAG.
    pub depends_on: Vec<Uuid>,
    pub auto_merge: bool,
    pub pr_url: Option<String>,
    /// Node that last mutated this record.
    pub origin_node: NodeId,
    pub lamport_ts: u64,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(title: impl Into<String>, description: impl Into<String>, origin_node: NodeId) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            parent_id: None,
            title: title.into(),
            description: description.into(),
            status: TaskStatus::default(),
            priority: 0,
            complexity: Complexity::default(),
            required_capabilities: Vec::new(),
            assigned_to: None,
            result: None,
            error: None,
            progress: None,
            project_path: None,
            context: None,
            work_instructions: None,
            acceptance_criteria: None,
            review_status: None,
            review_feedback: None,
            archived: false,
            git_branch: None,
            merge_attempts: 0,
            test_command: None,
            depends_on: Vec::new(),
            auto_merge: true,
            pr_url: None,
            origin_node,
            lamport_ts: 0,
            claimed_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependency(mut self, task_id: Uuid) -> Self {
        if !self.depends_on.contains(&task_id) && task_id != self.id {
            self.depends_on.push(task_id);
        }
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.required_capabilities = capabilities;
        self
    }

    pub fn with_project_path(mut self, path: impl Into<String>) -> Self {
        self.project_path = Some(path.into());
        self
    }

    pub fn with_instructions(mut self, work: impl Into<String>, acceptance: impl Into<String>) -> Self {
        self.work_instructions = Some(work.into());
        self.acceptance_criteria = Some(acceptance.into());
        self
    }

    pub fn with_test_command(mut self, cmd: impl Into<String>) -> Self {
        self.test_command = Some(cmd.into());
        self
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    /// Whether this is a subtask.
    pub fn is_subtask(&self) -> bool {
        self.parent_id.is_some()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn can_transition_to(&self, new_status: TaskStatus) -> bool {
        self.status.can_transition_to(new_status)
    }

    /// Transition to a new status, maintaining the assignment invariant and
    /// the claimed/completed timestamps.
    pub fn transition_to(&mut self, new_status: TaskStatus) -> Result<(), String> {
        if !self.can_transition_to(new_status) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.status.as_str(),
                new_status.as_str()
            ));
        }

        self.status = new_status;
        self.updated_at = Utc::now();

        match new_status {
            TaskStatus::Claimed => self.claimed_at = Some(Utc::now()),
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                self.completed_at = Some(Utc::now());
            }
            _ => {}
        }
        if !new_status.requires_assignee() && !matches!(new_status, TaskStatus::Merging) {
            self.assigned_to = None;
        }

        Ok(())
    }

    /// Force a status, bypassing the state machine. Reserved for crash
    /// recovery and startup reconciliation; every call is logged.
    pub fn force_status(&mut self, new_status: TaskStatus, reason: &str) {
        tracing::warn!(
            task_id = %self.id,
            from = %self.status.as_str(),
            to = %new_status.as_str(),
            reason = reason,
            "Forcing task status transition (bypassing state machine)"
        );
        self.status = new_status;
        self.updated_at = Utc::now();
        if !new_status.requires_assignee() && !matches!(new_status, TaskStatus::Merging) {
            self.assigned_to = None;
        }
    }

    /// Whether another merge/review round is allowed.
    pub fn can_retry_merge(&self) -> bool {
        self.merge_attempts < MAX_MERGE_ATTEMPTS
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.title.is_empty() {
            return Err("Task title cannot be empty".to_string());
        }
        if self.depends_on.contains(&self.id) {
            return Err("Task cannot depend on itself".to_string());
        }
        if self.is_subtask() && self.status.requires_assignee() && self.assigned_to.is_none() {
            return Err(format!("Status {} requires an assignee", self.status.as_str()));
        }
        if self.merge_attempts > MAX_MERGE_ATTEMPTS {
            return Err(format!("merge_attempts exceeds cap of {MAX_MERGE_ATTEMPTS}"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new("x", "do x", NodeId::from_string("aaaa"))
    }

    #[test]
    fn default_status_is_pending() {
        assert_eq!(task().status, TaskStatus::Pending);
    }

    #[test]
    fn self_dependency_rejected() {
        let mut t = task();
        t.depends_on.push(t.id);
        assert!(t.validate().is_err());
    }

    #[test]
    fn with_dependency_ignores_self() {
        let t = task();
        let id = t.id;
        let t = t.with_dependency(id);
        assert!(t.depends_on.is_empty());
    }

    #[test]
    fn happy_path_transitions() {
        let mut t = task().with_parent(Uuid::new_v4());
        t.assigned_to = Some(Uuid::new_v4());
        assert!(t.transition_to(TaskStatus::Claimed).is_ok());
        assert!(t.claimed_at.is_some());
        assert!(t.transition_to(TaskStatus::InProgress).is_ok());
        assert!(t.transition_to(TaskStatus::PendingReview).is_ok());
        assert!(t.transition_to(TaskStatus::Completed).is_ok());
        assert!(t.completed_at.is_some());
        assert!(t.is_terminal());
    }

    #[test]
    fn terminal_states_reject_transitions() {
        let mut t = task();
        t.transition_to(TaskStatus::Cancelled).unwrap();
        assert!(t.transition_to(TaskStatus::Pending).is_err());
    }

    #[test]
    fn requeue_clears_assignee() {
        let mut t = task();
        t.assigned_to = Some(Uuid::new_v4());
        t.transition_to(TaskStatus::Claimed).unwrap();
        t.transition_to(TaskStatus::Pending).unwrap();
        assert!(t.assigned_to.is_none());
    }

    #[test]
    fn merge_retry_budget() {
        let mut t = task();
        t.merge_attempts = MAX_MERGE_ATTEMPTS - 1;
        assert!(t.can_retry_merge());
        t.merge_attempts = MAX_MERGE_ATTEMPTS;
        assert!(!t.can_retry_merge());
    }
}
