mod common;

use std::sync::Arc;

use uuid::Uuid;
use voidlux::domain::models::{NodeId, TaskStatus};
use voidlux::domain::ports::{AgentRepository, TaskRepository};
use voidlux::infrastructure::database::{SqliteAgentRepository, SqliteTaskRepository};
use voidlux::mesh::wire::TaskClaim;
use voidlux::mesh::LamportClock;
use voidlux::services::{ClaimDecision, ClaimResolver};

use common::{setup_test_db, test_task};

struct Node {
    node_id: NodeId,
    tasks: Arc<SqliteTaskRepository>,
    agents: Arc<SqliteAgentRepository>,
    resolver: ClaimResolver,
}

async fn node(id: &str) -> Node {
    let pool = setup_test_db().await;
    let node_id = NodeId::from_string(id);
    let tasks = Arc::new(SqliteTaskRepository::new(pool.clone()));
    let agents = Arc::new(SqliteAgentRepository::new(pool));
    let resolver = ClaimResolver::new(
        node_id.clone(),
        Arc::new(LamportClock::new(0)),
        tasks.clone(),
        agents.clone(),
    );
    Node { node_id, tasks, agents, resolver }
}

fn claim(task_id: Uuid, agent_id: Uuid, node: &str, ts: u64) -> TaskClaim {
    TaskClaim {
        message_id: Uuid::new_v4(),
        task_id,
        agent_id,
        node_id: NodeId::from_string(node),
        lamport_ts: ts,
    }
}

/// Simultaneous claims at the same Lamport timestamp: the smaller node id
/// wins on every replica.
#[tokio::test]
async fn concurrent_claims_converge_to_smallest_node_id() {
    let a = node("aaaa").await;
    let b = node("bbbb").await;

    // The same pending task is replicated on both nodes.
    let task = test_task("contested", "aaaa");
    a.tasks.create(&task).await.unwrap();
    b.tasks.create(&task).await.unwrap();

    let agent_on_a = common::test_agent(&a.node_id, "worker");
    let agent_on_b = common::test_agent(&b.node_id, "worker");
    a.agents.upsert(&agent_on_a).await.unwrap();
    b.agents.upsert(&agent_on_b).await.unwrap();

    // Each side claims locally at ts=5 before hearing from the other.
    assert!(a.tasks.try_claim(task.id, agent_on_a.id, &a.node_id, 5).await.unwrap());
    assert!(b.tasks.try_claim(task.id, agent_on_b.id, &b.node_id, 5).await.unwrap());
    a.agents
        .set_status(agent_on_a.id, voidlux::domain::models::AgentStatus::Busy, Some(task.id), 6)
        .await
        .unwrap();
    b.agents
        .set_status(agent_on_b.id, voidlux::domain::models::AgentStatus::Busy, Some(task.id), 6)
        .await
        .unwrap();

    // Cross-deliver the claim tickets.
    let claim_from_a = claim(task.id, agent_on_a.id, "aaaa", 5);
    let claim_from_b = claim(task.id, agent_on_b.id, "bbbb", 5);

    // B sees A's claim: aaaa < bbbb, so A's agent takes the task.
    let decision = b.resolver.handle_remote_claim(&claim_from_a).await.unwrap();
    assert_eq!(decision, ClaimDecision::Applied);

    // A sees B's claim: it loses.
    let decision = a.resolver.handle_remote_claim(&claim_from_b).await.unwrap();
    assert_eq!(decision, ClaimDecision::Lost);

    // Both replicas agree on the winner.
    let on_a = a.tasks.get(task.id).await.unwrap().unwrap();
    let on_b = b.tasks.get(task.id).await.unwrap().unwrap();
    assert_eq!(on_a.assigned_to, Some(agent_on_a.id));
    assert_eq!(on_b.assigned_to, Some(agent_on_a.id));
    assert_eq!(on_a.origin_node, on_b.origin_node);

    // B's losing agent reverted to idle.
    let loser = b.agents.get(agent_on_b.id).await.unwrap().unwrap();
    assert_eq!(loser.status.as_str(), "idle");
}

#[tokio::test]
async fn lower_timestamp_beats_smaller_node_id() {
    let b = node("bbbb").await;
    let task = test_task("contested", "bbbb");
    b.tasks.create(&task).await.unwrap();

    let early_agent = Uuid::new_v4();
    let late_agent = Uuid::new_v4();

    // A later claim from a smaller node id arrives first...
    assert_eq!(
        b.resolver.handle_remote_claim(&claim(task.id, late_agent, "aaaa", 9)).await.unwrap(),
        ClaimDecision::Applied
    );
    // ...then the earlier claim shows up and supersedes it.
    assert_eq!(
        b.resolver.handle_remote_claim(&claim(task.id, early_agent, "cccc", 3)).await.unwrap(),
        ClaimDecision::Applied
    );

    let loaded = b.tasks.get(task.id).await.unwrap().unwrap();
    assert_eq!(loaded.assigned_to, Some(early_agent));
    assert_eq!(loaded.lamport_ts, 3);
}

#[tokio::test]
async fn replaying_claims_is_idempotent() {
    let b = node("bbbb").await;
    let task = test_task("contested", "bbbb");
    b.tasks.create(&task).await.unwrap();

    let agent = Uuid::new_v4();
    let ticket = claim(task.id, agent, "aaaa", 5);

    assert_eq!(b.resolver.handle_remote_claim(&ticket).await.unwrap(), ClaimDecision::Applied);
    let first = b.tasks.get(task.id).await.unwrap().unwrap();

    // Winning replay: no-op.
    assert_eq!(b.resolver.handle_remote_claim(&ticket).await.unwrap(), ClaimDecision::Ignored);
    let second = b.tasks.get(task.id).await.unwrap().unwrap();
    assert_eq!(first.assigned_to, second.assigned_to);
    assert_eq!(first.lamport_ts, second.lamport_ts);
    assert_eq!(first.status, second.status);

    // Losing replay: also a no-op.
    let loser = claim(task.id, Uuid::new_v4(), "zzzz", 5);
    assert_eq!(b.resolver.handle_remote_claim(&loser).await.unwrap(), ClaimDecision::Lost);
    assert_eq!(b.tasks.get(task.id).await.unwrap().unwrap().assigned_to, Some(agent));
}

#[tokio::test]
async fn stale_claim_after_task_progressed_is_ignored() {
    let b = node("bbbb").await;
    let mut task = test_task("moving", "bbbb");
    task.assigned_to = Some(Uuid::new_v4());
    task.status = TaskStatus::InProgress;
    task.lamport_ts = 20;
    b.tasks.create(&task).await.unwrap();

    let late = claim(task.id, Uuid::new_v4(), "aaaa", 2);
    assert_eq!(b.resolver.handle_remote_claim(&late).await.unwrap(), ClaimDecision::Ignored);
    let loaded = b.tasks.get(task.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, TaskStatus::InProgress);
    assert_eq!(loaded.assigned_to, task.assigned_to);
}

#[tokio::test]
async fn claim_for_unknown_task_is_ignored() {
    let b = node("bbbb").await;
    let ticket = claim(Uuid::new_v4(), Uuid::new_v4(), "aaaa", 1);
    assert_eq!(b.resolver.handle_remote_claim(&ticket).await.unwrap(), ClaimDecision::Ignored);
}
