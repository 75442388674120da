//! Default stand-ins for the external collaborator ports.
//!
//! A node is useful before any LLM provider or agent runtime is attached:
//! the passthrough planner turns a task into a single subtask, the
//! approving reviewer waves results through, and the marker detector does
//! plain-text classification of captured output. Real deployments inject
//! their own implementations through `SwarmOptions`.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Agent, Complexity, Task};
use crate::domain::ports::{
    AgentActivity, AgentBridge, AgentSession, Planner, Reviewer, ReviewVerdict, StatusDetector,
    SubtaskPlan,
};

/// Plans every task as exactly one subtask mirroring the parent.
pub struct PassthroughPlanner;

#[async_trait]
impl Planner for PassthroughPlanner {
    async fn decompose(&self, task: &Task) -> DomainResult<Vec<SubtaskPlan>> {
        Ok(vec![SubtaskPlan {
            title: task.title.clone(),
            description: task.description.clone(),
            work_instructions: task
                .work_instructions
                .clone()
                .unwrap_or_else(|| task.description.clone()),
            acceptance_criteria: task
                .acceptance_criteria
                .clone()
                .unwrap_or_else(|| "work is complete and tests pass".to_string()),
            required_capabilities: task.required_capabilities.clone(),
            complexity: Complexity::Medium,
            depends_on: Vec::new(),
        }])
    }
}

/// Accepts every result.
pub struct ApprovingReviewer;

#[async_trait]
impl Reviewer for ApprovingReviewer {
    async fn evaluate(&self, _task: &Task, _subtasks: &[Task]) -> DomainResult<ReviewVerdict> {
        Ok(ReviewVerdict { passed: true, feedback: "auto-approved".to_string() })
    }
}

/// No agent runtime attached: no sessions exist and delivery fails loudly.
pub struct NullAgentBridge;

#[async_trait]
impl AgentBridge for NullAgentBridge {
    async fn session(&self, _agent: &Agent) -> DomainResult<Option<Box<dyn AgentSession>>> {
        Ok(None)
    }

    async fn deliver(&self, agent: &Agent, _task: &Task) -> DomainResult<()> {
        Err(DomainError::SessionFailed(format!(
            "no agent runtime attached for {}",
            agent.name
        )))
    }

    async fn respond(&self, agent: &Agent, _task_id: Uuid, _response: &str) -> DomainResult<()> {
        Err(DomainError::SessionFailed(format!(
            "no agent runtime attached for {}",
            agent.name
        )))
    }
}

/// Plain-text status classification of captured session output.
///
/// Order matters: error markers dominate, then input prompts, then busy
/// markers; a quiet tail reads as idle.
pub struct MarkerStatusDetector;

const ERROR_MARKERS: &[&str] = &[
    "traceback (most recent call last)",
    "panicked at",
    "fatal:",
    "command not found",
];
const WAITING_MARKERS: &[&str] = &[
    "[y/n]",
    "(y/n)",
    "do you want",
    "please provide",
    "waiting for input",
    "press enter",
];
const BUSY_MARKERS: &[&str] = &["working", "thinking", "running", "compiling", "installing", "..."];

impl StatusDetector for MarkerStatusDetector {
    fn classify(&self, output: &str) -> AgentActivity {
        let tail: String = output
            .lines()
            .rev()
            .take(15)
            .collect::<Vec<_>>()
            .join("\n")
            .to_lowercase();

        if ERROR_MARKERS.iter().any(|m| tail.contains(m)) {
            return AgentActivity::Error;
        }
        if WAITING_MARKERS.iter().any(|m| tail.contains(m)) {
            return AgentActivity::Waiting;
        }
        if BUSY_MARKERS.iter().any(|m| tail.contains(m)) {
            return AgentActivity::Busy;
        }
        AgentActivity::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_markers_win() {
        let detector = MarkerStatusDetector;
        let output = "running tests\nthread 'main' panicked at src/lib.rs:10\n";
        assert_eq!(detector.classify(output), AgentActivity::Error);
    }

    #[test]
    fn prompt_looks_like_waiting() {
        let detector = MarkerStatusDetector;
        assert_eq!(detector.classify("Overwrite existing file? [y/N]\n"), AgentActivity::Waiting);
    }

    #[test]
    fn spinner_looks_busy() {
        let detector = MarkerStatusDetector;
        assert_eq!(detector.classify("Compiling voidlux v0.1.0\n"), AgentActivity::Busy);
    }

    #[test]
    fn quiet_tail_is_idle() {
        let detector = MarkerStatusDetector;
        assert_eq!(detector.classify("done\n$ \n"), AgentActivity::Idle);
    }
}
