//! Replication ingest path.
//!
//! Both gossip pushes and anti-entropy pulls funnel through this service:
//! witness the Lamport timestamp, merge the record last-writer-wins, and
//! notify observers when something actually changed. Local mutations never
//! pass through here; they tick the clock and gossip outward instead.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Agent, BoardMessage, Node, NodeId, Task};
use crate::domain::ports::{AgentRepository, BoardRepository, NodeRepository, TaskRepository};
use crate::mesh::wire::SyncRsp;
use crate::mesh::{LamportClock, SyncWatermark};

/// Something in the local replica changed because of a remote record.
#[derive(Debug, Clone)]
pub enum ReplicaEvent {
    TaskApplied(Uuid),
    AgentApplied(Uuid),
    AgentRemoved(Uuid),
    NodeApplied(NodeId),
    BoardApplied(Uuid),
}

pub struct Replicator {
    clock: Arc<LamportClock>,
    tasks: Arc<dyn TaskRepository>,
    agents: Arc<dyn AgentRepository>,
    nodes: Arc<dyn NodeRepository>,
    board: Arc<dyn BoardRepository>,
    events_tx: broadcast::Sender<ReplicaEvent>,
}

impl Replicator {
    pub fn new(
        clock: Arc<LamportClock>,
        tasks: Arc<dyn TaskRepository>,
        agents: Arc<dyn AgentRepository>,
        nodes: Arc<dyn NodeRepository>,
        board: Arc<dyn BoardRepository>,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self { clock, tasks, agents, nodes, board, events_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReplicaEvent> {
        self.events_tx.subscribe()
    }

    /// Apply a replicated task. Returns `true` when the record was newer
    /// than the local row and was stored.
    pub async fn apply_task(&self, task: &Task) -> DomainResult<bool> {
        self.clock.witness(task.lamport_ts);
        let applied = self.tasks.upsert_replica(task).await?;
        if applied {
            debug!(task_id = %task.id, ts = task.lamport_ts, "applied replicated task");
            let _ = self.events_tx.send(ReplicaEvent::TaskApplied(task.id));
        }
        Ok(applied)
    }

    pub async fn apply_agent(&self, agent: &Agent) -> DomainResult<bool> {
        self.clock.witness(agent.lamport_ts);
        let applied = self.agents.upsert_replica(agent).await?;
        if applied {
            let _ = self.events_tx.send(ReplicaEvent::AgentApplied(agent.id));
        }
        Ok(applied)
    }

    /// A peer deregistered one of its agents.
    pub async fn remove_agent(&self, agent: &Agent) -> DomainResult<()> {
        self.clock.witness(agent.lamport_ts);
        if self.agents.delete(agent.id).await.is_ok() {
            let _ = self.events_tx.send(ReplicaEvent::AgentRemoved(agent.id));
        }
        Ok(())
    }

    pub async fn apply_node(&self, node: &Node) -> DomainResult<bool> {
        self.clock.witness(node.lamport_ts);
        let applied = self.nodes.upsert_replica(node).await?;
        if applied {
            let _ = self.events_tx.send(ReplicaEvent::NodeApplied(node.node_id.clone()));
        }
        Ok(applied)
    }

    pub async fn apply_board(&self, message: &BoardMessage) -> DomainResult<bool> {
        self.clock.witness(message.lamport_ts);
        let applied = self.board.insert(message).await?;
        if applied {
            let _ = self.events_tx.send(ReplicaEvent::BoardApplied(message.id));
        }
        Ok(applied)
    }

    /// Everything newer than the watermark, for a SYNC_RSP.
    pub async fn collect_since(&self, since: u64) -> DomainResult<SyncRsp> {
        Ok(SyncRsp {
            tasks: self.tasks.since(since).await?,
            agents: self.agents.since(since).await?,
            nodes: self.nodes.since(since).await?,
            board_messages: self.board.since(since).await?,
        })
    }

    /// Apply a SYNC_RSP through the same merge rules as push gossip.
    /// Returns how many records were applied.
    pub async fn apply_sync(&self, rsp: &SyncRsp) -> DomainResult<usize> {
        let mut applied = 0;
        for task in &rsp.tasks {
            if self.apply_task(task).await? {
                applied += 1;
            }
        }
        for agent in &rsp.agents {
            if self.apply_agent(agent).await? {
                applied += 1;
            }
        }
        for node in &rsp.nodes {
            if self.apply_node(node).await? {
                applied += 1;
            }
        }
        for message in &rsp.board_messages {
            if self.apply_board(message).await? {
                applied += 1;
            }
        }
        Ok(applied)
    }
}

#[async_trait]
impl SyncWatermark for Replicator {
    async fn watermark(&self) -> u64 {
        let tasks = self.tasks.max_lamport_ts().await.unwrap_or(0);
        let agents = self.agents.max_lamport_ts().await.unwrap_or(0);
        let nodes = self.nodes.max_lamport_ts().await.unwrap_or(0);
        let board = self.board.max_lamport_ts().await.unwrap_or(0);
        tasks.max(agents).max(nodes).max(board)
    }
}
