//! Node domain model.
//!
//! A node is one swarm process. Its identity is a 128-bit random hex string
//! generated on first boot and persisted, so it survives restarts. Node
//! records are replicated to every peer and updated by heartbeats.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Seconds without a heartbeat before a node is considered offline.
pub const NODE_OFFLINE_AFTER_SECS: i64 = 30;

/// Stable identity of a swarm node: 32 lowercase hex characters.
///
/// Ordering is lexicographic, which the claim resolver and the bully
/// election rely on for deterministic tie-breaking.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Generate a fresh random node id.
    pub fn generate() -> Self {
        Self(format!("{:032x}", rand::random::<u128>()))
    }

    /// Wrap an already-validated id (e.g. loaded from storage).
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First six characters, used to prefix agent names for swarm-wide
    /// uniqueness.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(6);
        &self.0[..end]
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role a node plays in the swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Owns planning, review, and merging.
    Emperor,
    /// Hosts agents and executes subtasks.
    Worker,
    /// Standby coordinator; behaves as a worker until elected.
    Seneschal,
}

impl Default for NodeRole {
    fn default() -> Self {
        Self::Worker
    }
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Emperor => "emperor",
            Self::Worker => "worker",
            Self::Seneschal => "seneschal",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "emperor" => Some(Self::Emperor),
            "worker" => Some(Self::Worker),
            "seneschal" => Some(Self::Seneschal),
            _ => None,
        }
    }
}

/// Liveness of a node as seen by the local replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Offline,
}

impl Default for NodeStatus {
    fn default() -> Self {
        Self::Online
    }
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

/// Replicated record describing one swarm process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: NodeId,
    pub role: NodeRole,
    pub http_host: String,
    pub http_port: u16,
    pub p2p_port: u16,
    pub capabilities: Vec<String>,
    pub agent_count: u32,
    pub active_task_count: u32,
    pub status: NodeStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub lamport_ts: u64,
    pub registered_at: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub memory_usage_bytes: u64,
}

impl Node {
    pub fn new(node_id: NodeId, role: NodeRole, http_host: impl Into<String>, http_port: u16, p2p_port: u16) -> Self {
        let now = Utc::now();
        Self {
            node_id,
            role,
            http_host: http_host.into(),
            http_port,
            p2p_port,
            capabilities: Vec::new(),
            agent_count: 0,
            active_task_count: 0,
            status: NodeStatus::Online,
            last_heartbeat: now,
            lamport_ts: 0,
            registered_at: now,
            uptime_seconds: 0,
            memory_usage_bytes: 0,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Whether the heartbeat is stale relative to `now`.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        (now - self.last_heartbeat).num_seconds() > NODE_OFFLINE_AFTER_SECS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_32_hex_chars() {
        let id = NodeId::generate();
        assert_eq!(id.as_str().len(), 32);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn short_prefix_is_six_chars() {
        let id = NodeId::from_string("aabbccddeeff00112233445566778899");
        assert_eq!(id.short(), "aabbcc");
    }

    #[test]
    fn node_ids_order_lexicographically() {
        let a = NodeId::from_string("aaaa");
        let b = NodeId::from_string("bbbb");
        assert!(a < b);
    }

    #[test]
    fn stale_after_thirty_seconds() {
        let mut node = Node::new(NodeId::generate(), NodeRole::Worker, "127.0.0.1", 8080, 9000);
        let now = Utc::now();
        node.last_heartbeat = now - chrono::Duration::seconds(31);
        assert!(node.is_stale(now));
        node.last_heartbeat = now - chrono::Duration::seconds(29);
        assert!(!node.is_stale(now));
    }
}
