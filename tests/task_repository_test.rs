mod common;

use std::sync::Arc;

use voidlux::domain::models::{NodeId, TaskStatus};
use voidlux::domain::ports::{TaskFilter, TaskRepository};
use voidlux::infrastructure::database::SqliteTaskRepository;
use uuid::Uuid;

use common::{setup_test_db, test_task};

#[tokio::test]
async fn insert_and_get_round_trips() {
    let pool = setup_test_db().await;
    let repo = SqliteTaskRepository::new(pool);

    let dep = test_task("dep", "aaaa");
    repo.create(&dep).await.unwrap();

    let mut task = test_task("main", "aaaa").with_dependency(dep.id);
    task.required_capabilities = vec!["rust".to_string()];
    task.priority = 7;
    repo.create(&task).await.unwrap();

    let loaded = repo.get(task.id).await.unwrap().expect("task should exist");
    assert_eq!(loaded.id, task.id);
    assert_eq!(loaded.title, "main");
    assert_eq!(loaded.status, TaskStatus::Pending);
    assert_eq!(loaded.priority, 7);
    assert_eq!(loaded.required_capabilities, vec!["rust".to_string()]);
    assert_eq!(loaded.depends_on, vec![dep.id]);
}

#[tokio::test]
async fn get_missing_task_is_none() {
    let pool = setup_test_db().await;
    let repo = SqliteTaskRepository::new(pool);
    assert!(repo.get(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn claim_is_compare_and_set() {
    let pool = setup_test_db().await;
    let repo = SqliteTaskRepository::new(pool);
    let node = NodeId::from_string("aaaa");

    let task = test_task("claimable", "aaaa");
    repo.create(&task).await.unwrap();

    let agent_a = Uuid::new_v4();
    let agent_b = Uuid::new_v4();

    assert!(repo.try_claim(task.id, agent_a, &node, 5).await.unwrap());
    // Second claim must lose: the task is no longer pending.
    assert!(!repo.try_claim(task.id, agent_b, &node, 6).await.unwrap());

    let loaded = repo.get(task.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, TaskStatus::Claimed);
    assert_eq!(loaded.assigned_to, Some(agent_a));
    assert_eq!(loaded.lamport_ts, 5);
    assert!(loaded.claimed_at.is_some());
}

#[tokio::test]
async fn replica_upsert_is_last_writer_wins() {
    let pool = setup_test_db().await;
    let repo = SqliteTaskRepository::new(pool);

    let mut task = test_task("replicated", "aaaa");
    task.lamport_ts = 10;
    assert!(repo.upsert_replica(&task).await.unwrap());

    // Replay: identical record is a no-op.
    assert!(!repo.upsert_replica(&task).await.unwrap());

    // Older write loses.
    let mut stale = task.clone();
    stale.lamport_ts = 4;
    stale.title = "stale".to_string();
    assert!(!repo.upsert_replica(&stale).await.unwrap());
    assert_eq!(repo.get(task.id).await.unwrap().unwrap().title, "replicated");

    // Newer write wins.
    let mut newer = task.clone();
    newer.lamport_ts = 11;
    newer.title = "fresher".to_string();
    assert!(repo.upsert_replica(&newer).await.unwrap());
    assert_eq!(repo.get(task.id).await.unwrap().unwrap().title, "fresher");
}

#[tokio::test]
async fn replica_tie_breaks_on_node_id() {
    let pool = setup_test_db().await;
    let repo = SqliteTaskRepository::new(pool);

    let mut from_a = test_task("from-a", "aaaa");
    from_a.lamport_ts = 7;
    assert!(repo.upsert_replica(&from_a).await.unwrap());

    // Same timestamp from a lexicographically larger node wins the tie.
    let mut from_b = from_a.clone();
    from_b.origin_node = NodeId::from_string("bbbb");
    from_b.title = "from-b".to_string();
    assert!(repo.upsert_replica(&from_b).await.unwrap());
    assert_eq!(repo.get(from_a.id).await.unwrap().unwrap().title, "from-b");

    // And the reverse direction is stale.
    assert!(!repo.upsert_replica(&from_a).await.unwrap());
}

#[tokio::test]
async fn dispatch_order_is_priority_then_age() {
    let pool = setup_test_db().await;
    let repo = SqliteTaskRepository::new(pool);
    let parent = Uuid::new_v4();

    let mut low = test_task("low", "aaaa").with_parent(parent);
    low.priority = 1;
    let mut high = test_task("high", "aaaa").with_parent(parent);
    high.priority = 9;
    repo.create(&low).await.unwrap();
    repo.create(&high).await.unwrap();

    let order: Vec<String> = repo
        .list_dispatchable(10)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.title)
        .collect();
    assert_eq!(order, vec!["high".to_string(), "low".to_string()]);

    // Top-level tasks are not dispatchable; only subtasks are.
    let top_level = test_task("parent", "aaaa");
    repo.create(&top_level).await.unwrap();
    assert!(repo
        .list_dispatchable(10)
        .await
        .unwrap()
        .iter()
        .all(|t| t.parent_id.is_some()));
}

#[tokio::test]
async fn since_and_watermark_track_lamport() {
    let pool = setup_test_db().await;
    let repo = SqliteTaskRepository::new(pool);

    for ts in 1..=5u64 {
        let mut task = test_task(&format!("t{ts}"), "aaaa");
        task.lamport_ts = ts;
        repo.create(&task).await.unwrap();
    }

    assert_eq!(repo.max_lamport_ts().await.unwrap(), 5);
    let newer = repo.since(3).await.unwrap();
    assert_eq!(newer.len(), 2);
    assert!(newer.iter().all(|t| t.lamport_ts > 3));
}

#[tokio::test]
async fn self_dependency_is_rejected() {
    let pool = setup_test_db().await;
    let repo = SqliteTaskRepository::new(pool);
    let task = test_task("loop", "aaaa");
    repo.create(&task).await.unwrap();
    assert!(repo.add_dependency(task.id, task.id).await.is_err());
}

#[tokio::test]
async fn archive_hides_from_listing() {
    let pool = setup_test_db().await;
    let repo = SqliteTaskRepository::new(pool);
    let task = test_task("old", "aaaa");
    repo.create(&task).await.unwrap();
    repo.archive(task.id).await.unwrap();

    let listed = repo.list(TaskFilter::default()).await.unwrap();
    assert!(listed.is_empty());
    let listed = repo
        .list(TaskFilter { include_archived: true, ..Default::default() })
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn count_by_status_groups_correctly() {
    let pool = setup_test_db().await;
    let repo: Arc<SqliteTaskRepository> = Arc::new(SqliteTaskRepository::new(pool));

    repo.create(&test_task("a", "aaaa")).await.unwrap();
    repo.create(&test_task("b", "aaaa")).await.unwrap();
    let mut done = test_task("c", "aaaa");
    done.status = TaskStatus::Completed;
    repo.create(&done).await.unwrap();

    let counts = repo.count_by_status().await.unwrap();
    assert_eq!(counts.get(&TaskStatus::Pending), Some(&2));
    assert_eq!(counts.get(&TaskStatus::Completed), Some(&1));
}
