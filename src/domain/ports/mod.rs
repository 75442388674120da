//! Ports: trait seams between the core and its collaborators.

pub mod agent_repository;
pub mod agent_session;
pub mod board_repository;
pub mod git_workspace;
pub mod node_repository;
pub mod planner;
pub mod task_repository;

pub use agent_repository::AgentRepository;
pub use agent_session::{AgentActivity, AgentBridge, AgentSession, StatusDetector};
pub use board_repository::BoardRepository;
pub use git_workspace::{GitWorkspace, MergeOutcome, TestOutcome};
pub use node_repository::{state_keys, NodeRepository, NodeStateRepository};
pub use planner::{Planner, Reviewer, ReviewVerdict, SubtaskPlan};
pub use task_repository::{TaskFilter, TaskRepository};
