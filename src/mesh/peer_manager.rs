//! Peer bookkeeping: known addresses, reconnect loop, PING/PONG keepalive,
//! and PEX address exchange.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::domain::models::NodeId;

use super::connection::ConnectionId;
use super::tcp_mesh::TcpMesh;
use super::wire::{Message, Pex, Ping};
use super::constants;

#[derive(Debug, Default, Clone)]
struct PeerEntry {
    last_dial: Option<Instant>,
}

#[derive(Debug, Default)]
struct KeepaliveState {
    /// Unanswered pings per connection.
    missed: HashMap<ConnectionId, u32>,
}

/// Tracks known peer addresses and keeps connections healthy.
pub struct PeerManager {
    mesh: TcpMesh,
    known: Mutex<HashMap<String, PeerEntry>>,
    keepalive: Mutex<KeepaliveState>,
    max_connections: usize,
}

impl PeerManager {
    pub fn new(mesh: TcpMesh, max_connections: usize) -> Arc<Self> {
        Arc::new(Self {
            mesh,
            known: Mutex::new(HashMap::new()),
            keepalive: Mutex::new(KeepaliveState::default()),
            max_connections,
        })
    }

    /// Remember an address. Returns `true` when it was new.
    pub async fn add_address(&self, addr: impl Into<String>) -> bool {
        let addr = addr.into();
        if addr.is_empty() {
            return false;
        }
        let mut known = self.known.lock().await;
        if known.contains_key(&addr) {
            false
        } else {
            debug!(%addr, "learned peer address");
            known.insert(addr, PeerEntry::default());
            true
        }
    }

    /// Merge a PEX payload.
    pub async fn merge_addresses(&self, peers: Vec<String>) {
        for addr in peers.into_iter().take(constants::PEX_MAX_PEERS) {
            self.add_address(addr).await;
        }
    }

    /// Snapshot of known addresses, bounded for PEX.
    pub async fn addresses(&self) -> Vec<String> {
        let known = self.known.lock().await;
        known.keys().take(constants::PEX_MAX_PEERS).cloned().collect()
    }

    pub async fn known_count(&self) -> usize {
        self.known.lock().await.len()
    }

    /// A PONG arrived on this connection; reset its missed counter.
    pub async fn on_pong(&self, conn_id: ConnectionId) {
        self.keepalive.lock().await.missed.remove(&conn_id);
    }

    /// Dial every known-but-unconnected address, rate-limited per address.
    async fn reconnect_pass(&self) {
        let candidates: Vec<String> = {
            let known = self.known.lock().await;
            known
                .iter()
                .filter(|(_, entry)| {
                    entry
                        .last_dial
                        .is_none_or(|at| at.elapsed() >= constants::REDIAL_BACKOFF)
                })
                .map(|(addr, _)| addr.clone())
                .collect()
        };

        for addr in candidates {
            if self.mesh.connection_count().await >= self.max_connections {
                break;
            }
            if self.mesh.is_dialed(&addr).await {
                continue;
            }
            {
                let mut known = self.known.lock().await;
                if let Some(entry) = known.get_mut(&addr) {
                    entry.last_dial = Some(Instant::now());
                }
            }
            match self.mesh.dial(&addr).await {
                Ok(()) => info!(%addr, "reconnected to peer"),
                Err(err) => debug!(%addr, error = %err, "dial failed"),
            }
        }
    }

    /// Ping every connection; close links that missed three pongs.
    async fn keepalive_pass(&self) {
        let connections = self.mesh.connections().await;
        let mut keepalive = self.keepalive.lock().await;

        // Forget counters for connections that no longer exist.
        let live: std::collections::HashSet<ConnectionId> =
            connections.iter().map(|c| c.id).collect();
        keepalive.missed.retain(|id, _| live.contains(id));

        for conn in connections {
            let missed = keepalive.missed.entry(conn.id).or_insert(0);
            if *missed >= constants::MAX_MISSED_PONGS {
                warn!(conn = conn.id, addr = %conn.addr, "no pong after {} pings, closing", constants::MAX_MISSED_PONGS);
                conn.close();
                continue;
            }
            *missed += 1;
            let ping = Message::Ping(Ping {
                node_id: self.mesh.local_node_id().clone(),
                timestamp: Utc::now().timestamp(),
            });
            if conn.send(ping).await.is_err() {
                conn.close();
            }
        }
    }

    /// Broadcast our known-address union.
    async fn pex_pass(&self) {
        let peers = self.addresses().await;
        if peers.is_empty() {
            return;
        }
        self.mesh.broadcast(Message::Pex(Pex { peers })).await;
    }

    /// Spawn the reconnect, keepalive, and PEX loops.
    pub fn spawn_loops(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        let manager = self.clone();
        let mut stop = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(constants::RECONNECT_INTERVAL);
            loop {
                tokio::select! {
                    _ = stop.changed() => if *stop.borrow() { break },
                    _ = interval.tick() => manager.reconnect_pass().await,
                }
            }
        });

        let manager = self.clone();
        let mut stop = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(constants::PING_INTERVAL);
            loop {
                tokio::select! {
                    _ = stop.changed() => if *stop.borrow() { break },
                    _ = interval.tick() => manager.keepalive_pass().await,
                }
            }
        });

        let manager = self.clone();
        let mut stop = shutdown;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(constants::PEX_INTERVAL);
            loop {
                tokio::select! {
                    _ = stop.changed() => if *stop.borrow() { break },
                    _ = interval.tick() => manager.pex_pass().await,
                }
            }
        });
    }
}

/// Answer a PING with a PONG carrying our identity.
pub fn pong_for(local: &NodeId) -> Message {
    Message::Pong(Ping {
        node_id: local.clone(),
        timestamp: Utc::now().timestamp(),
    })
}
