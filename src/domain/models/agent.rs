//! Agent domain model.
//!
//! Agents are controllable AI coding sessions hosted by a node. The record
//! is created by local registration and replicated to every peer; only the
//! owning node mutates it, everyone else applies gossip.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::node::NodeId;

/// Seconds without a heartbeat before an agent is considered offline.
pub const AGENT_OFFLINE_AFTER_SECS: i64 = 45;

/// Observable status of an agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Session is being created.
    Starting,
    /// Ready for a task.
    Idle,
    /// Working on `current_task_id`.
    Busy,
    /// Blocked on human input.
    Waiting,
    /// Session reported an error.
    Error,
    /// Heartbeat lapsed or session is gone.
    Offline,
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self::Starting
    }
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Waiting => "waiting",
            Self::Error => "error",
            Self::Offline => "offline",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "starting" => Some(Self::Starting),
            "idle" => Some(Self::Idle),
            "busy" => Some(Self::Busy),
            "waiting" => Some(Self::Waiting),
            "error" => Some(Self::Error),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }

    /// Whether the agent can accept a new task.
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

/// A controllable AI session registered with the swarm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    /// Node that owns this session.
    pub node_id: NodeId,
    /// Swarm-wide unique name, prefixed with the owning node's short id.
    pub name: String,
    /// Opaque identifier of the agent tool (e.g. a CLI name).
    pub tool: String,
    pub model: String,
    pub capabilities: Vec<String>,
    pub status: AgentStatus,
    pub current_task_id: Option<Uuid>,
    /// Opaque handle into the external session runtime.
    pub session_handle: Option<String>,
    pub project_path: String,
    pub max_concurrent_tasks: u32,
    pub last_heartbeat: DateTime<Utc>,
    pub lamport_ts: u64,
    pub registered_at: DateTime<Utc>,
}

impl Agent {
    /// Register a new agent on `node_id`. The given name is prefixed with
    /// the node's 6-char short id so names never collide across the swarm.
    pub fn new(node_id: NodeId, name: impl Into<String>, tool: impl Into<String>) -> Self {
        let now = Utc::now();
        let name = format!("{}-{}", node_id.short(), name.into());
        Self {
            id: Uuid::new_v4(),
            node_id,
            name,
            tool: tool.into(),
            model: String::new(),
            capabilities: Vec::new(),
            status: AgentStatus::Starting,
            current_task_id: None,
            session_handle: None,
            project_path: String::new(),
            max_concurrent_tasks: 1,
            last_heartbeat: now,
            lamport_ts: 0,
            registered_at: now,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_project_path(mut self, path: impl Into<String>) -> Self {
        self.project_path = path.into();
        self
    }

    pub fn with_session_handle(mut self, handle: impl Into<String>) -> Self {
        self.session_handle = Some(handle.into());
        self
    }

    /// Whether this agent satisfies a task's capability requirements.
    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }

    /// Whether the heartbeat is stale relative to `now`.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        (now - self.last_heartbeat).num_seconds() > AGENT_OFFLINE_AFTER_SECS
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("Agent name cannot be empty".to_string());
        }
        if self.max_concurrent_tasks < 1 {
            return Err("max_concurrent_tasks must be at least 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_is_prefixed_with_node_short_id() {
        let node = NodeId::from_string("aabbccddeeff00112233445566778899");
        let agent = Agent::new(node, "coder", "tmux");
        assert_eq!(agent.name, "aabbcc-coder");
    }

    #[test]
    fn capability_subset_check() {
        let agent = Agent::new(NodeId::generate(), "coder", "tmux")
            .with_capabilities(vec!["rust".into(), "git".into()]);
        assert!(agent.has_capabilities(&["rust".to_string()]));
        assert!(agent.has_capabilities(&[]));
        assert!(!agent.has_capabilities(&["python".to_string()]));
    }

    #[test]
    fn stale_after_forty_five_seconds() {
        let mut agent = Agent::new(NodeId::generate(), "coder", "tmux");
        let now = Utc::now();
        agent.last_heartbeat = now - chrono::Duration::seconds(46);
        assert!(agent.is_stale(now));
    }
}
