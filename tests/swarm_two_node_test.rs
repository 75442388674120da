mod common;

use std::time::Duration;

use voidlux::domain::models::NodeRole;
use voidlux::domain::ports::{NodeRepository, TaskRepository};
use voidlux::mesh::wire::{Message, SyncReq};

use common::{start_worker, test_task, wait_for};

/// Scenario: node A creates a task; node B holds an identical replica
/// within two seconds.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn task_disseminates_between_two_nodes() {
    let a = start_worker(Vec::new()).await;
    let seed = format!("127.0.0.1:{}", a.handle.p2p_port);
    let b = start_worker(vec![seed]).await;

    let connected = wait_for(
        || async { a.handle.mesh.peer_count().await == 1 && b.handle.mesh.peer_count().await == 1 },
        Duration::from_secs(10),
    )
    .await;
    assert!(connected, "nodes never connected");

    let task = test_task("x", a.handle.node_id.as_str());
    let submitted = a.handle.queue.submit(task).await.unwrap();

    let task_id = submitted.id;
    let replicated = wait_for(
        || async { b.handle.tasks.get(task_id).await.unwrap().is_some() },
        Duration::from_secs(2),
    )
    .await;
    assert!(replicated, "task did not replicate within two seconds");

    let on_a = a.handle.tasks.get(task_id).await.unwrap().unwrap();
    let on_b = b.handle.tasks.get(task_id).await.unwrap().unwrap();
    assert_eq!(on_a.id, on_b.id);
    assert_eq!(on_a.title, on_b.title);
    assert_eq!(on_a.lamport_ts, on_b.lamport_ts);
    assert_eq!(on_a.origin_node, on_b.origin_node);

    a.handle.shutdown().await;
    b.handle.shutdown().await;
}

/// Scenario: a node that joins late pulls the full backlog through one
/// sync exchange.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_joiner_heals_through_sync() {
    let a = start_worker(Vec::new()).await;

    // Seed 20 tasks while nobody is listening.
    let mut expected = Vec::new();
    for n in 0..20 {
        let task = test_task(&format!("backlog-{n}"), a.handle.node_id.as_str());
        expected.push(a.handle.queue.submit(task).await.unwrap().id);
    }

    let seed = format!("127.0.0.1:{}", a.handle.p2p_port);
    let c = start_worker(vec![seed]).await;
    let connected = wait_for(
        || async { c.handle.mesh.peer_count().await == 1 },
        Duration::from_secs(10),
    )
    .await;
    assert!(connected, "joiner never connected");

    // Trigger the pull rather than waiting out the anti-entropy interval.
    c.handle
        .mesh
        .send_to(
            &a.handle.node_id,
            Message::SyncReq(SyncReq {
                node_id: c.handle.node_id.clone(),
                since_lamport_ts: 0,
            }),
        )
        .await
        .unwrap();

    let healed = wait_for(
        || async {
            let mut have = 0;
            for id in &expected {
                if c.handle.tasks.get(*id).await.unwrap().is_some() {
                    have += 1;
                }
            }
            have == expected.len()
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(healed, "joiner did not receive the backlog");

    a.handle.shutdown().await;
    c.handle.shutdown().await;
}

/// An emperor-configured node announces itself; peers record exactly one
/// emperor.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn emperor_role_is_visible_to_peers() {
    let a = common::start_node(
        "emperor",
        Vec::new(),
        std::sync::Arc::new(common::ScriptedPlanner { plans: Vec::new() }),
        std::sync::Arc::new(common::ScriptedReviewer::passing()),
        std::sync::Arc::new(common::RecordingBridge::new("$ ")),
        std::sync::Arc::new(common::AlwaysIdleDetector),
        std::sync::Arc::new(common::MockGit::clean()),
    )
    .await;
    let seed = format!("127.0.0.1:{}", a.handle.p2p_port);
    let b = start_worker(vec![seed]).await;

    let seen = wait_for(
        || async {
            let nodes = b.handle.nodes.list().await.unwrap();
            nodes
                .iter()
                .filter(|n| n.role == NodeRole::Emperor)
                .any(|n| n.node_id == a.handle.node_id)
        },
        Duration::from_secs(10),
    )
    .await;
    assert!(seen, "peer never recorded the emperor");

    let emperors = b
        .handle
        .nodes
        .list()
        .await
        .unwrap()
        .into_iter()
        .filter(|n| n.role == NodeRole::Emperor)
        .count();
    assert_eq!(emperors, 1);

    a.handle.shutdown().await;
    b.handle.shutdown().await;
}
