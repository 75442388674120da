//! Deterministic resolution of concurrent task claims.
//!
//! Claims race: two nodes can claim the same pending task before either
//! hears about the other. Every node applies the same total order to the
//! claim tickets it sees (lowest Lamport timestamp first, then smallest
//! node id), so all replicas converge on one winner without coordination.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, info};

use crate::domain::errors::DomainResult;
use crate::domain::models::{AgentStatus, NodeId, TaskStatus};
use crate::domain::ports::{AgentRepository, TaskRepository};
use crate::mesh::wire::TaskClaim;
use crate::mesh::LamportClock;

/// Order two claim tickets; `Less` wins.
pub fn compare_claims(a_ts: u64, a_node: &NodeId, b_ts: u64, b_node: &NodeId) -> Ordering {
    a_ts.cmp(&b_ts).then_with(|| a_node.cmp(b_node))
}

/// What a remote claim did to the local replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimDecision {
    /// The claim won and was materialized.
    Applied,
    /// The claim lost to an already-materialized better claim.
    Lost,
    /// Replay or irrelevant (task already past claiming, or unknown).
    Ignored,
}

pub struct ClaimResolver {
    node_id: NodeId,
    clock: Arc<LamportClock>,
    tasks: Arc<dyn TaskRepository>,
    agents: Arc<dyn AgentRepository>,
}

impl ClaimResolver {
    pub fn new(
        node_id: NodeId,
        clock: Arc<LamportClock>,
        tasks: Arc<dyn TaskRepository>,
        agents: Arc<dyn AgentRepository>,
    ) -> Self {
        Self { node_id, clock, tasks, agents }
    }

    /// Apply a remote claim ticket. Idempotent: replaying a winning or a
    /// losing claim is a no-op.
    pub async fn handle_remote_claim(&self, claim: &TaskClaim) -> DomainResult<ClaimDecision> {
        self.clock.witness(claim.lamport_ts);

        let Some(task) = self.tasks.get(claim.task_id).await? else {
            // The record has not replicated here yet; anti-entropy will
            // bring the materialized claim along with it.
            debug!(task_id = %claim.task_id, "claim for unknown task ignored");
            return Ok(ClaimDecision::Ignored);
        };

        match task.status {
            TaskStatus::Pending | TaskStatus::Blocked => {
                // No competing claim materialized here; take it as-is. The
                // record keeps the claimant's stamp so all replicas stay
                // byte-identical.
                let mut task = task;
                task.status = TaskStatus::Claimed;
                task.assigned_to = Some(claim.agent_id);
                task.origin_node = claim.node_id.clone();
                task.lamport_ts = claim.lamport_ts;
                task.claimed_at = Some(chrono::Utc::now());
                task.updated_at = chrono::Utc::now();
                self.tasks.update(&task).await?;
                debug!(task_id = %task.id, node = %claim.node_id, "remote claim applied");
                Ok(ClaimDecision::Applied)
            }
            TaskStatus::Claimed => {
                if task.assigned_to == Some(claim.agent_id) {
                    return Ok(ClaimDecision::Ignored);
                }
                match compare_claims(claim.lamport_ts, &claim.node_id, task.lamport_ts, &task.origin_node) {
                    Ordering::Less => {
                        // The incoming ticket outranks the one we had
                        // materialized; switch the assignment and hand the
                        // losing agent back.
                        let loser = task.assigned_to;
                        let mut task = task;
                        task.assigned_to = Some(claim.agent_id);
                        task.origin_node = claim.node_id.clone();
                        task.lamport_ts = claim.lamport_ts;
                        task.updated_at = chrono::Utc::now();
                        self.tasks.update(&task).await?;
                        self.revert_losing_agent(loser).await?;
                        info!(task_id = %task.id, winner = %claim.node_id, "claim race resolved to remote claimant");
                        Ok(ClaimDecision::Applied)
                    }
                    Ordering::Greater | Ordering::Equal => {
                        debug!(task_id = %task.id, "remote claim lost the race");
                        Ok(ClaimDecision::Lost)
                    }
                }
            }
            // Past claiming: the winner has been established and moved on.
            _ => Ok(ClaimDecision::Ignored),
        }
    }

    async fn revert_losing_agent(&self, agent_id: Option<uuid::Uuid>) -> DomainResult<()> {
        let Some(agent_id) = agent_id else { return Ok(()) };
        let Some(agent) = self.agents.get(agent_id).await? else { return Ok(()) };
        // Only the owning node mutates its agents; remote losers revert
        // themselves when this same claim reaches them.
        if agent.node_id == self.node_id && agent.status == AgentStatus::Busy {
            self.agents
                .set_status(agent.id, AgentStatus::Idle, None, self.clock.tick())
                .await?;
        }
        Ok(())
    }
}
