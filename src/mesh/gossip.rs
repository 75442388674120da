//! Gossip engine: push dissemination with UUID dedup.
//!
//! Locally originated records broadcast to every established peer. On
//! receipt, a bounded LRU of message ids decides freshness; fresh messages
//! are delivered locally and forwarded to all peers except the sender.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use uuid::Uuid;

use crate::domain::models::NodeId;

use super::tcp_mesh::TcpMesh;
use super::wire::Message;
use super::constants;

pub struct GossipEngine {
    mesh: TcpMesh,
    seen: Mutex<LruCache<Uuid, ()>>,
}

impl GossipEngine {
    pub fn new(mesh: TcpMesh) -> Self {
        let capacity = NonZeroUsize::new(constants::SEEN_CACHE_CAPACITY)
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            mesh,
            seen: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Broadcast a locally originated message to every established peer.
    /// Its message id is recorded so an echoed copy is not re-applied.
    pub async fn publish(&self, message: Message) -> usize {
        if let Some(id) = message.message_id() {
            self.mark_seen(id);
        }
        self.mesh.broadcast(message).await
    }

    /// First sighting of a message id? Records it either way.
    pub fn observe(&self, message_id: Uuid) -> bool {
        if let Ok(mut seen) = self.seen.lock() {
            seen.put(message_id, ()).is_none()
        } else {
            true
        }
    }

    fn mark_seen(&self, message_id: Uuid) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.put(message_id, ());
        }
    }

    /// Epidemic forwarding: everyone except the peer we got it from.
    pub async fn forward(&self, message: Message, sender: &NodeId) -> usize {
        self.mesh.broadcast_except(message, Some(sender)).await
    }

    #[cfg(test)]
    pub fn seen_len(&self) -> usize {
        self.seen.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::NodeRole;
    use crate::mesh::tcp_mesh::MeshIdentity;

    fn engine() -> GossipEngine {
        let identity = MeshIdentity {
            node_id: NodeId::from_string("aaaa"),
            http_port: 0,
            role: NodeRole::Worker,
        };
        let (mesh, _events) = TcpMesh::new(identity, None, 20);
        GossipEngine::new(mesh)
    }

    #[test]
    fn first_observation_is_fresh_second_is_not() {
        let gossip = engine();
        let id = Uuid::new_v4();
        assert!(gossip.observe(id));
        assert!(!gossip.observe(id));
    }

    #[test]
    fn cache_is_bounded() {
        let gossip = engine();
        for _ in 0..(constants::SEEN_CACHE_CAPACITY + 100) {
            gossip.observe(Uuid::new_v4());
        }
        assert!(gossip.seen_len() <= constants::SEEN_CACHE_CAPACITY);
    }
}
