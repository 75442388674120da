//! Event-driven matching of idle agents to ready subtasks.
//!
//! A bounded channel carries wake-ups (`AgentIdle`, `TaskReady`) plus a
//! liveness tick every two seconds. Each pass walks the idle local agents
//! against dispatchable subtasks in priority order, flips blocked/pending
//! bookkeeping, and emits atomic claims.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::interval;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{NodeId, TaskStatus};
use crate::domain::ports::{AgentBridge, AgentRepository, TaskRepository};

use super::task_queue::TaskQueue;

const DISPATCH_TICK: std::time::Duration = std::time::Duration::from_secs(2);
const SCAN_LIMIT: usize = 100;

/// Wake-up reasons for the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchEvent {
    AgentIdle,
    TaskReady,
    Tick,
}

/// Cloneable nudge handle.
#[derive(Clone)]
pub struct DispatchHandle {
    tx: mpsc::Sender<DispatchEvent>,
}

impl DispatchHandle {
    pub fn agent_idle(&self) {
        let _ = self.tx.try_send(DispatchEvent::AgentIdle);
    }

    pub fn task_ready(&self) {
        let _ = self.tx.try_send(DispatchEvent::TaskReady);
    }
}

pub struct TaskDispatcher {
    node_id: NodeId,
    tasks: Arc<dyn TaskRepository>,
    agents: Arc<dyn AgentRepository>,
    queue: Arc<TaskQueue>,
    bridge: Arc<dyn AgentBridge>,
    rx: Mutex<mpsc::Receiver<DispatchEvent>>,
    tx: mpsc::Sender<DispatchEvent>,
}

impl TaskDispatcher {
    pub fn new(
        node_id: NodeId,
        tasks: Arc<dyn TaskRepository>,
        agents: Arc<dyn AgentRepository>,
        queue: Arc<TaskQueue>,
        bridge: Arc<dyn AgentBridge>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(64);
        Self { node_id, tasks, agents, queue, bridge, rx: Mutex::new(rx), tx }
    }

    pub fn handle(&self) -> DispatchHandle {
        DispatchHandle { tx: self.tx.clone() }
    }

    /// The dispatch loop. Storage hiccups are logged and retried on the
    /// next tick; they never kill the loop.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut rx = self.rx.lock().await;
        let mut tick = interval(DISPATCH_TICK);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tick.tick() => {
                    if let Err(err) = self.scan().await {
                        warn!(error = %err, "dispatch pass failed, retrying next tick");
                    }
                }
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    debug!(?event, "dispatch wake-up");
                    if let Err(err) = self.scan().await {
                        warn!(error = %err, "dispatch pass failed, retrying next tick");
                    }
                }
            }
        }
        debug!("dispatcher stopped");
    }

    /// One dispatch pass.
    pub async fn scan(&self) -> DomainResult<usize> {
        let candidates = self.tasks.list_dispatchable(SCAN_LIMIT).await?;

        // Blocked/pending bookkeeping first so freshly unblocked work is
        // claimable in this same pass.
        let mut ready = Vec::new();
        for task in candidates {
            let satisfied = self.queue.dependencies_satisfied(task.id).await?;
            match (task.status, satisfied) {
                (TaskStatus::Pending, false) => {
                    self.queue.mark_blocked(task.id).await?;
                }
                (TaskStatus::Blocked, true) => {
                    let task = self.queue.unblock(task.id).await?;
                    ready.push(task);
                }
                (TaskStatus::Pending, true) => ready.push(task),
                _ => {}
            }
        }

        let idle = self.agents.idle_agents(&self.node_id).await?;
        if idle.is_empty() || ready.is_empty() {
            return Ok(0);
        }

        let mut dispatched = 0;
        let mut taken: HashSet<Uuid> = HashSet::new();
        for agent in idle {
            // `ready` is already in dispatch order: priority descending,
            // then created_at, then id.
            let chosen = ready
                .iter()
                .find(|t| !taken.contains(&t.id) && agent.has_capabilities(&t.required_capabilities));
            let Some(task) = chosen else { continue };

            if !self.queue.claim(task, &agent).await? {
                // Lost a local race; leave it for the next pass.
                continue;
            }
            taken.insert(task.id);

            match self.bridge.deliver(&agent, task).await {
                Ok(()) => {
                    self.queue.start(task.id).await?;
                    dispatched += 1;
                }
                Err(err) => {
                    warn!(task_id = %task.id, agent = %agent.name, error = %err, "prompt delivery failed, requeueing");
                    self.queue.requeue(task.id, None, task.review_status).await?;
                }
            }
        }
        Ok(dispatched)
    }
}
