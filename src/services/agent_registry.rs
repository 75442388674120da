//! Agent lifecycle: registration, heartbeat gossip, offline detection.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    Agent, AgentStatus, NodeId, NodeRole, TaskStatus, AGENT_OFFLINE_AFTER_SECS,
};
use crate::domain::ports::{AgentRepository, TaskRepository};
use crate::mesh::wire::{AgentGossip, Message};
use crate::mesh::{GossipEngine, LamportClock};

use super::dispatcher::DispatchHandle;
use super::task_queue::TaskQueue;

const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(15);

pub struct AgentRegistry {
    node_id: NodeId,
    clock: Arc<LamportClock>,
    agents: Arc<dyn AgentRepository>,
    tasks: Arc<dyn TaskRepository>,
    queue: Arc<TaskQueue>,
    gossip: Arc<GossipEngine>,
    dispatch: DispatchHandle,
    role_rx: Mutex<watch::Receiver<NodeRole>>,
}

impl AgentRegistry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: NodeId,
        clock: Arc<LamportClock>,
        agents: Arc<dyn AgentRepository>,
        tasks: Arc<dyn TaskRepository>,
        queue: Arc<TaskQueue>,
        gossip: Arc<GossipEngine>,
        dispatch: DispatchHandle,
        role_rx: watch::Receiver<NodeRole>,
    ) -> Self {
        Self {
            node_id,
            clock,
            agents,
            tasks,
            queue,
            gossip,
            dispatch,
            role_rx: Mutex::new(role_rx),
        }
    }

    /// Register a local agent. Starts in `starting`; the MCP `agent_ready`
    /// call (or the monitor seeing an idle session) flips it to `idle`.
    pub async fn register(&self, mut agent: Agent) -> DomainResult<Agent> {
        agent.validate().map_err(DomainError::ValidationFailed)?;
        if agent.node_id != self.node_id {
            return Err(DomainError::ValidationFailed(
                "agents can only be registered on their owning node".to_string(),
            ));
        }
        agent.lamport_ts = self.clock.tick();
        self.agents.upsert(&agent).await?;
        info!(agent = %agent.name, "agent registered");
        self.gossip
            .publish(Message::AgentRegister(AgentGossip {
                message_id: Uuid::new_v4(),
                agent: agent.clone(),
            }))
            .await;
        Ok(agent)
    }

    /// Remove a local agent and announce it.
    pub async fn deregister(&self, agent_id: Uuid) -> DomainResult<()> {
        let Some(agent) = self.agents.get(agent_id).await? else {
            return Err(DomainError::AgentNotFound(agent_id.to_string()));
        };
        self.agents.delete(agent_id).await?;
        let mut gone = agent;
        gone.status = AgentStatus::Offline;
        gone.lamport_ts = self.clock.tick();
        self.gossip
            .publish(Message::AgentDeregister(AgentGossip {
                message_id: Uuid::new_v4(),
                agent: gone,
            }))
            .await;
        Ok(())
    }

    /// Status change for a local agent; gossips immediately rather than
    /// waiting for the heartbeat tick.
    pub async fn set_status(
        &self,
        agent_id: Uuid,
        status: AgentStatus,
        current_task_id: Option<Uuid>,
    ) -> DomainResult<()> {
        self.agents
            .set_status(agent_id, status, current_task_id, self.clock.tick())
            .await?;
        if let Some(agent) = self.agents.get(agent_id).await? {
            self.gossip
                .publish(Message::AgentHeartbeat(AgentGossip {
                    message_id: Uuid::new_v4(),
                    agent,
                }))
                .await;
        }
        if status == AgentStatus::Idle {
            self.dispatch.agent_idle();
        }
        Ok(())
    }

    /// MCP `agent_ready`: session is up and idle.
    pub async fn mark_ready(&self, agent_name: &str) -> DomainResult<Agent> {
        let Some(agent) = self.agents.get_by_name(agent_name).await? else {
            return Err(DomainError::AgentNotFound(agent_name.to_string()));
        };
        self.set_status(agent.id, AgentStatus::Idle, None).await?;
        self.agents
            .get(agent.id)
            .await?
            .ok_or_else(|| DomainError::AgentNotFound(agent_name.to_string()))
    }

    /// Periodic heartbeat for every local agent.
    async fn heartbeat_pass(&self) -> DomainResult<()> {
        for mut agent in self.agents.list_by_node(&self.node_id).await? {
            agent.last_heartbeat = Utc::now();
            agent.lamport_ts = self.clock.tick();
            self.agents.upsert(&agent).await?;
            self.gossip
                .publish(Message::AgentHeartbeat(AgentGossip {
                    message_id: Uuid::new_v4(),
                    agent,
                }))
                .await;
        }
        Ok(())
    }

    /// Mark agents whose heartbeat lapsed offline and requeue their work.
    ///
    /// Local agents are always our responsibility. Remote agents are swept
    /// only by the emperor, so a dead node's tasks still find their way
    /// back to `pending`; the requeue converges via last-writer-wins even
    /// if two sweeps overlap.
    async fn stale_pass(&self) -> DomainResult<()> {
        let is_emperor = { *self.role_rx.lock().await.borrow() == NodeRole::Emperor };
        let now = Utc::now();
        let cutoff = now - ChronoDuration::seconds(AGENT_OFFLINE_AFTER_SECS);

        for agent in self.agents.list().await? {
            if agent.status == AgentStatus::Offline || agent.last_heartbeat >= cutoff {
                continue;
            }
            let local = agent.node_id == self.node_id;
            if !local && !is_emperor {
                continue;
            }
            warn!(agent = %agent.name, "agent heartbeat lapsed, marking offline");
            self.agents
                .set_status(agent.id, AgentStatus::Offline, None, self.clock.tick())
                .await?;
            if local {
                if let Some(updated) = self.agents.get(agent.id).await? {
                    self.gossip
                        .publish(Message::AgentHeartbeat(AgentGossip {
                            message_id: Uuid::new_v4(),
                            agent: updated,
                        }))
                        .await;
                }
            }
            self.requeue_orphans(agent.id).await?;
        }
        Ok(())
    }

    /// Requeue every active task assigned to a gone agent.
    pub async fn requeue_orphans(&self, agent_id: Uuid) -> DomainResult<usize> {
        let mut requeued = 0;
        for task in self.tasks.active_for_agent(agent_id).await? {
            if matches!(
                task.status,
                TaskStatus::Claimed | TaskStatus::InProgress | TaskStatus::WaitingInput
            ) {
                self.queue
                    .requeue(task.id, Some("agent went offline".to_string()), task.review_status)
                    .await?;
                requeued += 1;
            }
        }
        if requeued > 0 {
            self.dispatch.task_ready();
        }
        Ok(requeued)
    }

    /// Spawn the heartbeat + stale-detection loop.
    pub fn spawn_loops(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        if let Err(err) = registry.heartbeat_pass().await {
                            warn!(error = %err, "agent heartbeat pass failed");
                        }
                        if let Err(err) = registry.stale_pass().await {
                            warn!(error = %err, "agent stale pass failed");
                        }
                    }
                }
            }
        });
    }
}
