mod common;

use std::sync::Arc;
use std::time::Duration;

use voidlux::domain::models::{Complexity, TaskStatus};
use voidlux::domain::ports::{SubtaskPlan, TaskRepository};

use common::{
    start_node, test_agent, test_task, wait_for, AlwaysIdleDetector, MockGit, RecordingBridge,
    ScriptedPlanner, ScriptedReviewer,
};

fn plan(title: &str, deps: Vec<usize>) -> SubtaskPlan {
    SubtaskPlan {
        title: title.to_string(),
        description: format!("{title} work"),
        work_instructions: format!("do {title}"),
        acceptance_criteria: "it works".to_string(),
        required_capabilities: Vec::new(),
        complexity: Complexity::Small,
        depends_on: deps,
    }
}

/// Full single-node flow: plan, dispatch in dependency order, auto-recover
/// completions through the monitor, review, merge, and open a PR.
///
/// The scripted session always reads as idle, so the monitor treats every
/// delivered task as finished on its next poll; with `second` depending on
/// `first`, dispatch order is forced.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parent_task_flows_to_merged_pr() {
    let bridge = Arc::new(RecordingBridge::new("$ done\n"));
    let git = Arc::new(MockGit::clean());
    let node = start_node(
        "emperor",
        Vec::new(),
        Arc::new(ScriptedPlanner { plans: vec![plan("first", vec![]), plan("second", vec![0])] }),
        Arc::new(ScriptedReviewer::passing()),
        bridge.clone(),
        Arc::new(AlwaysIdleDetector),
        git.clone(),
    )
    .await;

    // One idle agent serves both subtasks sequentially.
    let agent = test_agent(&node.handle.node_id, "coder");
    let agent = node.handle.registry.register(agent).await.unwrap();
    node.handle.registry.mark_ready(&agent.name).await.unwrap();

    let parent = node
        .handle
        .queue
        .submit(test_task("build the feature", node.handle.node_id.as_str()))
        .await
        .unwrap();

    let done = wait_for(
        || async {
            node.handle
                .tasks
                .get(parent.id)
                .await
                .unwrap()
                .is_some_and(|t| t.status == TaskStatus::Completed)
        },
        Duration::from_secs(30),
    )
    .await;
    assert!(done, "parent task never completed");

    let parent = node.handle.tasks.get(parent.id).await.unwrap().unwrap();
    assert_eq!(parent.pr_url.as_deref(), Some("https://example.com/pr/1"));

    let subtasks = node.handle.tasks.subtasks(parent.id).await.unwrap();
    assert_eq!(subtasks.len(), 2);
    assert!(subtasks.iter().all(|t| t.status == TaskStatus::Completed));

    // Dependency order held: `first` was delivered before `second`.
    let delivered = bridge.delivered.lock().await.clone();
    assert_eq!(delivered.len(), 2);
    let first = subtasks.iter().find(|t| t.title == "first").unwrap();
    let second = subtasks.iter().find(|t| t.title == "second").unwrap();
    assert_eq!(delivered[0], first.id);
    assert_eq!(delivered[1], second.id);

    // Both branches merged, in order.
    let merged = git.merged.lock().await.clone();
    assert_eq!(merged.len(), 2);
    assert_eq!(merged[0], first.git_branch.clone().unwrap());
    assert_eq!(merged[1], second.git_branch.clone().unwrap());

    node.handle.shutdown().await;
}

/// A dependent subtask stays blocked until its dependency finishes.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dependent_subtask_waits_for_dependency() {
    let bridge = Arc::new(RecordingBridge::new("$ done\n"));
    let node = start_node(
        "emperor",
        Vec::new(),
        Arc::new(ScriptedPlanner { plans: vec![plan("first", vec![]), plan("second", vec![0])] }),
        Arc::new(ScriptedReviewer::passing()),
        bridge.clone(),
        Arc::new(AlwaysIdleDetector),
        Arc::new(MockGit::clean()),
    )
    .await;

    // No agents yet: planning happens, dispatch cannot.
    let parent = node
        .handle
        .queue
        .submit(test_task("feature", node.handle.node_id.as_str()))
        .await
        .unwrap();

    let planned = wait_for(
        || async { node.handle.tasks.subtasks(parent.id).await.unwrap().len() == 2 },
        Duration::from_secs(10),
    )
    .await;
    assert!(planned, "parent was never decomposed");

    // The dependent subtask parks in blocked while its dependency is open.
    let parked = wait_for(
        || async {
            node.handle
                .tasks
                .subtasks(parent.id)
                .await
                .unwrap()
                .iter()
                .any(|t| t.title == "second" && t.status == TaskStatus::Blocked)
        },
        Duration::from_secs(10),
    )
    .await;
    assert!(parked, "dependent subtask never blocked");

    let first = node
        .handle
        .tasks
        .subtasks(parent.id)
        .await
        .unwrap()
        .into_iter()
        .find(|t| t.title == "first")
        .unwrap();
    assert_eq!(first.status, TaskStatus::Pending);

    node.handle.shutdown().await;
}
