//! Node repository and node-local state ports.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::errors::DomainResult;
use crate::domain::models::{Node, NodeId, NodeRole};

/// Repository interface for replicated Node records.
#[async_trait]
pub trait NodeRepository: Send + Sync {
    /// Insert or fully replace the local node's record.
    async fn upsert(&self, node: &Node) -> DomainResult<()>;

    /// Apply a replicated record last-writer-wins. Returns `true` when
    /// applied, `false` when stale.
    async fn upsert_replica(&self, node: &Node) -> DomainResult<bool>;

    async fn get(&self, node_id: &NodeId) -> DomainResult<Option<Node>>;

    async fn list(&self) -> DomainResult<Vec<Node>>;

    /// Update a node's role in place.
    async fn set_role(&self, node_id: &NodeId, role: NodeRole, lamport_ts: u64) -> DomainResult<()>;

    /// Mark nodes whose heartbeat is older than `cutoff` offline. Returns
    /// the ids that flipped.
    async fn mark_stale_offline(&self, cutoff: DateTime<Utc>) -> DomainResult<Vec<NodeId>>;

    /// Records with `lamport_ts` strictly greater than the watermark.
    async fn since(&self, lamport_ts: u64) -> DomainResult<Vec<Node>>;

    async fn max_lamport_ts(&self) -> DomainResult<u64>;
}

/// Small key-value store for node-local durable state: the node id and the
/// last flushed Lamport clock.
#[async_trait]
pub trait NodeStateRepository: Send + Sync {
    async fn get(&self, key: &str) -> DomainResult<Option<String>>;
    async fn put(&self, key: &str, value: &str) -> DomainResult<()>;
}

/// Well-known `node_state` keys.
pub mod state_keys {
    pub const NODE_ID: &str = "node_id";
    pub const LAMPORT_CLOCK: &str = "lamport_clock";
}
