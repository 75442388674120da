//! Agent session monitor.
//!
//! Polls every local agent session on a five-second cycle, classifies the
//! captured output, and converts observed transitions into task events.
//! This is also the orphan-recovery path: when an agent finished without
//! reporting through MCP, the monitor emits the completion itself.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::domain::errors::DomainResult;
use crate::domain::models::{Agent, AgentStatus, NodeId, TaskStatus};
use crate::domain::ports::{AgentActivity, AgentBridge, AgentRepository, StatusDetector, TaskRepository};

use super::agent_registry::AgentRegistry;
use super::task_queue::TaskQueue;

const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

/// How many trailing output lines become the recovered result.
const RESULT_TAIL_LINES: usize = 10;

pub struct AgentMonitor {
    node_id: NodeId,
    agents: Arc<dyn AgentRepository>,
    tasks: Arc<dyn TaskRepository>,
    queue: Arc<TaskQueue>,
    registry: Arc<AgentRegistry>,
    bridge: Arc<dyn AgentBridge>,
    detector: Arc<dyn StatusDetector>,
}

impl AgentMonitor {
    pub fn new(
        node_id: NodeId,
        agents: Arc<dyn AgentRepository>,
        tasks: Arc<dyn TaskRepository>,
        queue: Arc<TaskQueue>,
        registry: Arc<AgentRegistry>,
        bridge: Arc<dyn AgentBridge>,
        detector: Arc<dyn StatusDetector>,
    ) -> Self {
        Self { node_id, agents, tasks, queue, registry, bridge, detector }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(err) = self.poll_pass().await {
                        warn!(error = %err, "monitor pass failed");
                    }
                }
            }
        }
        debug!("agent monitor stopped");
    }

    /// One poll cycle over all local agents.
    pub async fn poll_pass(&self) -> DomainResult<usize> {
        let mut observed = 0;
        for agent in self.agents.list_by_node(&self.node_id).await? {
            if agent.status == AgentStatus::Offline {
                continue;
            }
            if let Err(err) = self.poll_agent(&agent).await {
                warn!(agent = %agent.name, error = %err, "agent poll failed");
            } else {
                observed += 1;
            }
        }
        Ok(observed)
    }

    async fn poll_agent(&self, agent: &Agent) -> DomainResult<()> {
        let session = self.bridge.session(agent).await?;
        let Some(session) = session else {
            return self.session_lost(agent).await;
        };
        if !session.is_alive().await {
            return self.session_lost(agent).await;
        }

        let output = session.capture_output().await?;
        let activity = self.detector.classify(&output);

        match (agent.status, activity) {
            (AgentStatus::Busy, AgentActivity::Idle) => {
                // The agent finished without an MCP report; recover the
                // result from the last meaningful output lines.
                if let Some(task_id) = agent.current_task_id {
                    if let Some(task) = self.tasks.get(task_id).await? {
                        match task.status {
                            // Delivery still in flight; judge it next poll.
                            TaskStatus::Claimed => return Ok(()),
                            TaskStatus::InProgress => {
                                info!(agent = %agent.name, task_id = %task_id, "recovering unreported completion");
                                let result = meaningful_tail(&output, RESULT_TAIL_LINES);
                                self.queue.complete(task_id, Some(result)).await?;
                            }
                            _ => {}
                        }
                    }
                }
                self.registry.set_status(agent.id, AgentStatus::Idle, None).await?;
            }
            (AgentStatus::Busy, AgentActivity::Error) => {
                if let Some(task_id) = agent.current_task_id {
                    if let Some(task) = self.tasks.get(task_id).await? {
                        if matches!(task.status, TaskStatus::InProgress | TaskStatus::WaitingInput) {
                            self.queue.fail(task_id, "agent session reported an error").await?;
                        }
                    }
                }
                self.registry.set_status(agent.id, AgentStatus::Error, None).await?;
            }
            (AgentStatus::Busy, AgentActivity::Waiting) => {
                if let Some(task_id) = agent.current_task_id {
                    if let Some(task) = self.tasks.get(task_id).await? {
                        if task.status == TaskStatus::InProgress {
                            self.queue
                                .needs_input(task_id, Some(meaningful_tail(&output, 3)))
                                .await?;
                        }
                    }
                }
                self.registry
                    .set_status(agent.id, AgentStatus::Waiting, agent.current_task_id)
                    .await?;
            }
            (AgentStatus::Waiting, AgentActivity::Busy) => {
                if let Some(task_id) = agent.current_task_id {
                    if let Some(task) = self.tasks.get(task_id).await? {
                        if task.status == TaskStatus::WaitingInput {
                            self.queue.resume(task_id).await?;
                        }
                    }
                }
                self.registry
                    .set_status(agent.id, AgentStatus::Busy, agent.current_task_id)
                    .await?;
            }
            (AgentStatus::Starting, AgentActivity::Idle) => {
                self.registry.set_status(agent.id, AgentStatus::Idle, None).await?;
            }
            (AgentStatus::Idle, AgentActivity::Busy) => {
                self.registry
                    .set_status(agent.id, AgentStatus::Busy, agent.current_task_id)
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// The session vanished: agent offline, current task back to pending.
    async fn session_lost(&self, agent: &Agent) -> DomainResult<()> {
        warn!(agent = %agent.name, "agent session missing, marking offline");
        self.registry.set_status(agent.id, AgentStatus::Offline, None).await?;
        if let Some(task_id) = agent.current_task_id {
            if let Some(task) = self.tasks.get(task_id).await? {
                if matches!(
                    task.status,
                    TaskStatus::Claimed | TaskStatus::InProgress | TaskStatus::WaitingInput
                ) {
                    self.queue
                        .requeue(task_id, Some("agent session lost".to_string()), task.review_status)
                        .await?;
                }
            }
        }
        Ok(())
    }
}

/// Last `n` non-empty lines of captured output, joined.
pub fn meaningful_tail(output: &str, n: usize) -> String {
    let lines: Vec<&str> = output
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty())
        .collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_last_meaningful_lines() {
        let output = "one\n\ntwo\n   \nthree\nfour\n";
        assert_eq!(meaningful_tail(output, 2), "three\nfour");
    }

    #[test]
    fn tail_of_short_output_is_everything() {
        assert_eq!(meaningful_tail("only line\n", 10), "only line");
    }

    #[test]
    fn tail_of_empty_output_is_empty() {
        assert_eq!(meaningful_tail("\n\n  \n", 10), "");
    }
}
