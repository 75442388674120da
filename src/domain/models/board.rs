//! Message-board domain model.
//!
//! Board messages are append-only posts agents use to talk to each other.
//! They replicate with the same gossip discipline as tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::node::NodeId;

/// A gossiped message-board post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardMessage {
    pub id: Uuid,
    /// Node the post originated on.
    pub node_id: NodeId,
    pub agent_name: String,
    pub topic: String,
    pub body: String,
    pub lamport_ts: u64,
    pub created_at: DateTime<Utc>,
}

impl BoardMessage {
    pub fn new(
        node_id: NodeId,
        agent_name: impl Into<String>,
        topic: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            node_id,
            agent_name: agent_name.into(),
            topic: topic.into(),
            body: body.into(),
            lamport_ts: 0,
            created_at: Utc::now(),
        }
    }
}
