//! One peer link: ordered send queue, activity tracking, peer-id binding.
//!
//! The handle is owned by the mesh registry; everything else refers to
//! connections by id or node-id and looks them up per use.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::RwLock;

use chrono::Utc;
use tokio::sync::{mpsc, watch};

use crate::domain::models::NodeId;

use super::wire::Message;
use super::MeshError;

pub type ConnectionId = u64;

/// Handle to a live peer connection.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    /// Dial key (`host:port`) for outbound links; remote address for
    /// accepted ones.
    pub addr: String,
    /// Whether we initiated this link.
    pub outbound: bool,
    sender: mpsc::Sender<Message>,
    close_tx: watch::Sender<bool>,
    last_activity: AtomicI64,
    peer_id: RwLock<Option<NodeId>>,
    hello_sent: AtomicBool,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        addr: String,
        outbound: bool,
        sender: mpsc::Sender<Message>,
        close_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            id,
            addr,
            outbound,
            sender,
            close_tx,
            last_activity: AtomicI64::new(Utc::now().timestamp()),
            peer_id: RwLock::new(None),
            hello_sent: AtomicBool::new(false),
        }
    }

    /// Queue a message for ordered delivery.
    pub async fn send(&self, message: Message) -> Result<(), MeshError> {
        self.sender
            .send(message)
            .await
            .map_err(|_| MeshError::ConnectionClosed)
    }

    /// Ask both pump tasks to stop. Idempotent.
    pub fn close(&self) {
        let _ = self.close_tx.send(true);
    }

    pub fn close_signal(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }

    /// Record traffic now.
    pub fn touch(&self) {
        self.last_activity.store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    /// Seconds since the last observed traffic.
    pub fn idle_seconds(&self) -> i64 {
        Utc::now().timestamp() - self.last_activity.load(Ordering::Relaxed)
    }

    pub fn peer_id(&self) -> Option<NodeId> {
        self.peer_id.read().ok().and_then(|g| g.clone())
    }

    pub fn bind_peer(&self, node_id: NodeId) {
        if let Ok(mut guard) = self.peer_id.write() {
            *guard = Some(node_id);
        }
    }

    /// Mark the handshake as sent; returns `true` the first time only.
    pub fn mark_hello_sent(&self) -> bool {
        !self.hello_sent.swap(true, Ordering::SeqCst)
    }
}
