//! Shared fixtures and scripted port implementations for integration tests.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tempfile::TempDir;
use tokio::sync::Mutex;
use uuid::Uuid;

use voidlux::domain::errors::DomainResult;
use voidlux::domain::models::{Agent, Config, NodeId, Task};
use voidlux::domain::ports::{
    AgentBridge, AgentSession, GitWorkspace, MergeOutcome, Planner, Reviewer, ReviewVerdict,
    StatusDetector, SubtaskPlan, TestOutcome,
};
use voidlux::infrastructure::database::{apply_migrations, open_memory_store};
use voidlux::services::{SwarmHandle, SwarmOptions};

/// In-memory database with the full schema applied.
pub async fn setup_test_db() -> SqlitePool {
    let pool = open_memory_store().await.expect("failed to create test pool");
    apply_migrations(&pool).await.expect("failed to migrate test db");
    pool
}

/// Poll a predicate until it holds or the timeout elapses.
pub async fn wait_for<F, Fut>(mut predicate: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

pub fn test_task(title: &str, node: &str) -> Task {
    Task::new(title, format!("{title} description"), NodeId::from_string(node))
}

pub fn test_agent(node: &NodeId, name: &str) -> Agent {
    Agent::new(node.clone(), name, "fake-tool")
}

/// A planner that returns a fixed plan.
pub struct ScriptedPlanner {
    pub plans: Vec<SubtaskPlan>,
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn decompose(&self, _task: &Task) -> DomainResult<Vec<SubtaskPlan>> {
        Ok(self.plans.clone())
    }
}

/// A reviewer that pops scripted verdicts, defaulting to pass.
pub struct ScriptedReviewer {
    pub verdicts: Mutex<VecDeque<ReviewVerdict>>,
}

impl ScriptedReviewer {
    pub fn passing() -> Self {
        Self { verdicts: Mutex::new(VecDeque::new()) }
    }

    pub fn with_verdicts(verdicts: Vec<ReviewVerdict>) -> Self {
        Self { verdicts: Mutex::new(verdicts.into()) }
    }
}

#[async_trait]
impl Reviewer for ScriptedReviewer {
    async fn evaluate(&self, _task: &Task, _subtasks: &[Task]) -> DomainResult<ReviewVerdict> {
        let mut verdicts = self.verdicts.lock().await;
        Ok(verdicts
            .pop_front()
            .unwrap_or(ReviewVerdict { passed: true, feedback: "looks good".to_string() }))
    }
}

/// A live-looking session that replays a fixed output capture.
pub struct FakeSession {
    pub output: String,
}

#[async_trait]
impl AgentSession for FakeSession {
    fn handle(&self) -> &str {
        "fake-session"
    }

    async fn is_alive(&self) -> bool {
        true
    }

    async fn send_prompt(&self, _prompt: &str) -> DomainResult<()> {
        Ok(())
    }

    async fn capture_output(&self) -> DomainResult<String> {
        Ok(self.output.clone())
    }
}

/// Records deliveries and presents a fixed session capture.
pub struct RecordingBridge {
    pub session_output: Mutex<String>,
    pub delivered: Mutex<Vec<Uuid>>,
}

impl RecordingBridge {
    pub fn new(session_output: &str) -> Self {
        Self {
            session_output: Mutex::new(session_output.to_string()),
            delivered: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl AgentBridge for RecordingBridge {
    async fn session(&self, _agent: &Agent) -> DomainResult<Option<Box<dyn AgentSession>>> {
        let output = self.session_output.lock().await.clone();
        Ok(Some(Box::new(FakeSession { output })))
    }

    async fn deliver(&self, _agent: &Agent, task: &Task) -> DomainResult<()> {
        self.delivered.lock().await.push(task.id);
        Ok(())
    }

    async fn respond(&self, _agent: &Agent, _task_id: Uuid, _response: &str) -> DomainResult<()> {
        Ok(())
    }
}

/// Classifies everything as idle; paired with RecordingBridge this makes
/// the monitor auto-complete whatever the agents run.
pub struct AlwaysIdleDetector;

impl StatusDetector for AlwaysIdleDetector {
    fn classify(&self, _output: &str) -> voidlux::domain::ports::AgentActivity {
        voidlux::domain::ports::AgentActivity::Idle
    }
}

/// Scripted git backend: conflicts and test failures on demand.
pub struct MockGit {
    pub conflict_branches: Mutex<HashSet<String>>,
    pub fail_tests: Mutex<bool>,
    pub merged: Mutex<Vec<String>>,
    pub pr_url: String,
}

impl MockGit {
    pub fn clean() -> Self {
        Self {
            conflict_branches: Mutex::new(HashSet::new()),
            fail_tests: Mutex::new(false),
            merged: Mutex::new(Vec::new()),
            pr_url: "https://example.com/pr/1".to_string(),
        }
    }

    pub async fn conflict_on(&self, branch: &str) {
        self.conflict_branches.lock().await.insert(branch.to_string());
    }

    pub async fn clear_conflicts(&self) {
        self.conflict_branches.lock().await.clear();
    }
}

#[async_trait]
impl GitWorkspace for MockGit {
    async fn default_branch(&self) -> DomainResult<String> {
        Ok("main".to_string())
    }

    async fn add_worktree(&self, branch: &str, _base: &str) -> DomainResult<PathBuf> {
        Ok(PathBuf::from(format!("/tmp/fake-worktrees/{branch}")))
    }

    async fn prepare_integration_worktree(&self, branch: &str, _base: &str) -> DomainResult<PathBuf> {
        Ok(PathBuf::from(format!("/tmp/fake-worktrees/{branch}")))
    }

    async fn merge_branch(&self, _worktree: &std::path::Path, branch: &str) -> DomainResult<MergeOutcome> {
        if self.conflict_branches.lock().await.contains(branch) {
            return Ok(MergeOutcome::Conflict { detail: format!("CONFLICT in {branch}") });
        }
        self.merged.lock().await.push(branch.to_string());
        Ok(MergeOutcome::Merged)
    }

    async fn run_tests(&self, _worktree: &std::path::Path, _command: &str) -> DomainResult<TestOutcome> {
        let fail = *self.fail_tests.lock().await;
        Ok(TestOutcome {
            success: !fail,
            output: if fail { "1 test failed".to_string() } else { "all tests passed".to_string() },
        })
    }

    async fn push_branch(&self, _worktree: &std::path::Path, _branch: &str) -> DomainResult<()> {
        Ok(())
    }

    async fn create_pull_request(&self, _branch: &str, _title: &str, _body: &str) -> DomainResult<String> {
        Ok(self.pr_url.clone())
    }

    async fn remove_worktree(&self, _path: &std::path::Path) -> DomainResult<()> {
        Ok(())
    }
}

/// A running node over a temp data directory.
pub struct TestNode {
    pub handle: SwarmHandle,
    pub dir: TempDir,
}

/// Base config for an in-process node: ephemeral ports, discovery off,
/// data under a fresh temp directory.
pub fn test_config() -> (Config, TempDir) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let mut config = Config::default();
    config.node.data_dir = dir.path().to_string_lossy().to_string();
    config.node.http_port = 0;
    config.mesh.p2p_port = 0;
    config.mesh.disable_discovery = true;
    (config, dir)
}

/// Start a node from an explicit config with the given externals.
pub async fn start_configured(
    config: Config,
    dir: TempDir,
    planner: Arc<dyn Planner>,
    reviewer: Arc<dyn Reviewer>,
    bridge: Arc<dyn AgentBridge>,
    detector: Arc<dyn StatusDetector>,
    git: Arc<dyn GitWorkspace>,
) -> TestNode {
    let handle = voidlux::services::start(SwarmOptions {
        config,
        planner,
        reviewer,
        bridge,
        detector,
        git,
    })
    .await
    .expect("failed to start test node");

    TestNode { handle, dir }
}

/// Start a node from an explicit config with inert externals (no
/// planning, no agents, scripted git).
pub async fn start_inert(config: Config, dir: TempDir) -> TestNode {
    start_configured(
        config,
        dir,
        Arc::new(ScriptedPlanner { plans: Vec::new() }),
        Arc::new(ScriptedReviewer::passing()),
        Arc::new(RecordingBridge::new("$ ")),
        Arc::new(AlwaysIdleDetector),
        Arc::new(MockGit::clean()),
    )
    .await
}

/// Start a node on ephemeral ports with discovery off.
pub async fn start_node(
    role: &str,
    seeds: Vec<String>,
    planner: Arc<dyn Planner>,
    reviewer: Arc<dyn Reviewer>,
    bridge: Arc<dyn AgentBridge>,
    detector: Arc<dyn StatusDetector>,
    git: Arc<dyn GitWorkspace>,
) -> TestNode {
    let (mut config, dir) = test_config();
    config.node.role = role.to_string();
    config.mesh.seeds = seeds;
    start_configured(config, dir, planner, reviewer, bridge, detector, git).await
}

/// A worker node with inert externals (no planning, no agents).
pub async fn start_worker(seeds: Vec<String>) -> TestNode {
    let (mut config, dir) = test_config();
    config.mesh.seeds = seeds;
    start_inert(config, dir).await
}
