//! Planner and reviewer ports.
//!
//! The LLM provider behind these traits is an external collaborator; the
//! orchestrator only sees `decompose` and `evaluate`.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Complexity, Task};

/// One planned subtask. `depends_on` holds indices into the returned plan
/// vector; the orchestrator translates them into task ids at insertion.
#[derive(Debug, Clone)]
pub struct SubtaskPlan {
    pub title: String,
    pub description: String,
    pub work_instructions: String,
    pub acceptance_criteria: String,
    pub required_capabilities: Vec<String>,
    pub complexity: Complexity,
    pub depends_on: Vec<usize>,
}

/// Decomposes a parent task into subtasks with dependency edges.
///
/// Contract: the returned plan must be a DAG over its indices; forward or
/// self references are rejected by the orchestrator.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn decompose(&self, task: &Task) -> DomainResult<Vec<SubtaskPlan>>;
}

/// Verdict returned by the reviewer.
#[derive(Debug, Clone)]
pub struct ReviewVerdict {
    pub passed: bool,
    pub feedback: String,
}

/// Evaluates finished subtask output against the parent's acceptance
/// criteria.
#[async_trait]
pub trait Reviewer: Send + Sync {
    async fn evaluate(&self, task: &Task, subtasks: &[Task]) -> DomainResult<ReviewVerdict>;
}
