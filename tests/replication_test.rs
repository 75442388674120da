mod common;

use std::sync::Arc;

use voidlux::domain::models::NodeId;
use voidlux::domain::ports::{AgentRepository, BoardRepository, NodeRepository, TaskRepository};
use voidlux::infrastructure::database::{
    SqliteAgentRepository, SqliteBoardRepository, SqliteNodeRepository, SqliteTaskRepository,
};
use voidlux::mesh::{LamportClock, SyncWatermark};
use voidlux::services::Replicator;

use common::{setup_test_db, test_task};

struct Replica {
    clock: Arc<LamportClock>,
    tasks: Arc<SqliteTaskRepository>,
    replicator: Replicator,
}

async fn replica() -> Replica {
    let pool = setup_test_db().await;
    let clock = Arc::new(LamportClock::new(0));
    let tasks = Arc::new(SqliteTaskRepository::new(pool.clone()));
    let agents = Arc::new(SqliteAgentRepository::new(pool.clone()));
    let nodes = Arc::new(SqliteNodeRepository::new(pool.clone()));
    let board = Arc::new(SqliteBoardRepository::new(pool));
    let replicator = Replicator::new(
        clock.clone(),
        tasks.clone() as Arc<dyn TaskRepository>,
        agents as Arc<dyn AgentRepository>,
        nodes as Arc<dyn NodeRepository>,
        board as Arc<dyn BoardRepository>,
    );
    Replica { clock, tasks, replicator }
}

/// A fresh joiner pulls everything above its watermark and ends up with an
/// identical record set.
#[tokio::test]
async fn sync_brings_new_joiner_up_to_date() {
    let seeded = replica().await;
    let joiner = replica().await;

    for n in 1..=100u64 {
        let mut task = test_task(&format!("task-{n}"), "aaaa");
        task.lamport_ts = n;
        seeded.tasks.create(&task).await.unwrap();
    }

    assert_eq!(joiner.replicator.watermark().await, 0);
    let rsp = seeded.replicator.collect_since(0).await.unwrap();
    assert_eq!(rsp.tasks.len(), 100);

    let applied = joiner.replicator.apply_sync(&rsp).await.unwrap();
    assert_eq!(applied, 100);
    assert_eq!(joiner.replicator.watermark().await, 100);

    // Re-applying the same response is a no-op.
    let applied = joiner.replicator.apply_sync(&rsp).await.unwrap();
    assert_eq!(applied, 0);

    // The joiner's clock witnessed every record.
    assert!(joiner.clock.current() > 100);
}

/// An incremental pull only carries records above the watermark.
#[tokio::test]
async fn incremental_sync_respects_watermark() {
    let seeded = replica().await;
    for n in 1..=10u64 {
        let mut task = test_task(&format!("task-{n}"), "aaaa");
        task.lamport_ts = n;
        seeded.tasks.create(&task).await.unwrap();
    }

    let rsp = seeded.replicator.collect_since(7).await.unwrap();
    assert_eq!(rsp.tasks.len(), 3);
    assert!(rsp.tasks.iter().all(|t| t.lamport_ts > 7));
}

/// Concurrent updates to the same task converge to the same winner on
/// every replica regardless of delivery order.
#[tokio::test]
async fn conflicting_updates_converge_both_orders() {
    let left = replica().await;
    let right = replica().await;

    let base = test_task("shared", "aaaa");
    let mut v1 = base.clone();
    v1.lamport_ts = 5;
    v1.origin_node = NodeId::from_string("aaaa");
    v1.title = "from-a".to_string();
    let mut v2 = base.clone();
    v2.lamport_ts = 5;
    v2.origin_node = NodeId::from_string("bbbb");
    v2.title = "from-b".to_string();

    // Left sees v1 then v2; right sees v2 then v1.
    left.replicator.apply_task(&v1).await.unwrap();
    left.replicator.apply_task(&v2).await.unwrap();
    right.replicator.apply_task(&v2).await.unwrap();
    right.replicator.apply_task(&v1).await.unwrap();

    let on_left = left.tasks.get(base.id).await.unwrap().unwrap();
    let on_right = right.tasks.get(base.id).await.unwrap().unwrap();
    assert_eq!(on_left.title, on_right.title);
    assert_eq!(on_left.title, "from-b");
    assert_eq!(on_left.origin_node, on_right.origin_node);
}
