//! Agent runtime ports.
//!
//! The concrete agent runtime (tmux panes, PTY wrappers, ...) lives outside
//! the core. The swarm only needs to deliver prompt text, capture output,
//! and classify what it sees.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Agent, Task};

/// What an agent session appears to be doing, judged from captured output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentActivity {
    Idle,
    Busy,
    Waiting,
    Error,
}

/// A live handle onto one agent session.
#[async_trait]
pub trait AgentSession: Send + Sync {
    /// Opaque handle (e.g. a tmux pane id).
    fn handle(&self) -> &str;

    /// Whether the underlying session still exists.
    async fn is_alive(&self) -> bool;

    /// Send prompt text into the session.
    async fn send_prompt(&self, prompt: &str) -> DomainResult<()>;

    /// Capture the visible tail of the session's output.
    async fn capture_output(&self) -> DomainResult<String>;
}

/// Creates and looks up sessions, and delivers claimed tasks to them.
#[async_trait]
pub trait AgentBridge: Send + Sync {
    /// Session for an agent, if one exists.
    async fn session(&self, agent: &Agent) -> DomainResult<Option<Box<dyn AgentSession>>>;

    /// Deliver a claimed task's prompt to the agent. Success moves the task
    /// `claimed -> in_progress`.
    async fn deliver(&self, agent: &Agent, task: &Task) -> DomainResult<()>;

    /// Forward a human response to a session waiting on input.
    async fn respond(&self, agent: &Agent, task_id: Uuid, response: &str) -> DomainResult<()>;
}

/// Classifies captured output into an activity.
pub trait StatusDetector: Send + Sync {
    fn classify(&self, output: &str) -> AgentActivity;
}
