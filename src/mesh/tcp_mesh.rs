//! TCP mesh: accept loop, outbound dialer, connection registry, and the
//! broadcast/unicast primitives everything above it uses.
//!
//! The mesh owns the HELLO handshake (identity binding, optional shared
//! secret check, duplicate-link replacement). All other frames are handed
//! to the single consumer of the event channel, which dispatches on the
//! typed message.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::domain::models::{NodeId, NodeRole};

use super::codec::{encode, FrameBuffer};
use super::connection::{Connection, ConnectionId};
use super::wire::{Hello, Message};
use super::{constants, MeshError};

/// Identity advertised in our HELLO.
#[derive(Debug, Clone)]
pub struct MeshIdentity {
    pub node_id: NodeId,
    pub http_port: u16,
    pub role: NodeRole,
}

/// Events delivered to the mesh consumer.
#[derive(Debug)]
pub enum MeshEvent {
    /// Handshake finished; the peer's HELLO is attached.
    PeerConnected {
        conn_id: ConnectionId,
        hello: Hello,
        addr: String,
    },
    PeerDisconnected {
        conn_id: ConnectionId,
        node_id: Option<NodeId>,
        addr: String,
    },
    /// Any non-HELLO frame. `from` is set once the peer has handshaken.
    Frame {
        conn_id: ConnectionId,
        from: Option<NodeId>,
        message: Message,
    },
}

#[derive(Default)]
struct Registry {
    conns: HashMap<ConnectionId, Arc<Connection>>,
    /// Outbound dial keys, to suppress duplicate dials.
    by_addr: HashMap<String, ConnectionId>,
    /// Established peers by node id.
    by_node: HashMap<NodeId, ConnectionId>,
}

struct MeshInner {
    identity: MeshIdentity,
    p2p_port: AtomicU64,
    secret: Option<String>,
    max_connections: usize,
    registry: Mutex<Registry>,
    events_tx: mpsc::Sender<MeshEvent>,
    next_conn_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

/// Handle to the mesh. Cheap to clone.
#[derive(Clone)]
pub struct TcpMesh {
    inner: Arc<MeshInner>,
}

/// Auth token for the optional shared-secret handshake.
pub fn auth_token(secret: &str, node_id: &NodeId) -> String {
    let digest = Sha256::digest(format!("{secret}:{node_id}").as_bytes());
    hex::encode(digest)
}

impl TcpMesh {
    pub fn new(
        identity: MeshIdentity,
        secret: Option<String>,
        max_connections: usize,
    ) -> (Self, mpsc::Receiver<MeshEvent>) {
        let (events_tx, events_rx) = mpsc::channel(1024);
        let (shutdown_tx, _) = watch::channel(false);
        let mesh = Self {
            inner: Arc::new(MeshInner {
                identity,
                p2p_port: AtomicU64::new(0),
                secret,
                max_connections,
                registry: Mutex::new(Registry::default()),
                events_tx,
                next_conn_id: AtomicU64::new(1),
                shutdown_tx,
            }),
        };
        (mesh, events_rx)
    }

    pub fn local_node_id(&self) -> &NodeId {
        &self.inner.identity.node_id
    }

    /// The port the accept loop is bound to (0 before `listen`).
    pub fn p2p_port(&self) -> u16 {
        #[allow(clippy::cast_possible_truncation)]
        let port = self.inner.p2p_port.load(Ordering::Relaxed) as u16;
        port
    }

    /// Bind the listener and spawn the accept loop. Returns the bound port
    /// (useful when asked to listen on port 0).
    pub async fn listen(&self, port: u16) -> Result<u16, MeshError> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let bound = listener.local_addr()?.port();
        self.inner.p2p_port.store(u64::from(bound), Ordering::Relaxed);

        let inner = self.inner.clone();
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let addr = peer.to_string();
                            debug!(%addr, "accepted inbound connection");
                            if let Err(err) = spawn_connection(&inner, stream, addr.clone(), false).await {
                                warn!(%addr, error = %err, "failed to register inbound connection");
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                            tokio::time::sleep(constants::ACCEPT_RETRY).await;
                        }
                    }
                }
            }
            debug!("accept loop stopped");
        });

        info!(port = bound, "mesh listening");
        Ok(bound)
    }

    /// Dial a peer at `host:port`. No-op when already dialed or when the
    /// connection cap is reached.
    pub async fn dial(&self, addr: &str) -> Result<(), MeshError> {
        {
            let registry = self.inner.registry.lock().await;
            if registry.by_addr.contains_key(addr) {
                return Err(MeshError::AlreadyConnected(addr.to_string()));
            }
            if registry.conns.len() >= self.inner.max_connections {
                return Err(MeshError::ConnectionLimit(self.inner.max_connections));
            }
        }

        let stream = timeout(constants::CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| MeshError::DialTimeout(constants::CONNECT_TIMEOUT))??;
        debug!(%addr, "dialed peer");
        spawn_connection(&self.inner, stream, addr.to_string(), true).await?;
        Ok(())
    }

    /// Send to an established peer by node id.
    pub async fn send_to(&self, node_id: &NodeId, message: Message) -> Result<(), MeshError> {
        let conn = {
            let registry = self.inner.registry.lock().await;
            registry
                .by_node
                .get(node_id)
                .and_then(|id| registry.conns.get(id))
                .cloned()
        };
        match conn {
            Some(conn) => conn.send(message).await,
            None => Err(MeshError::NotConnected(node_id.to_string())),
        }
    }

    /// Send on a specific connection (used for handshake replies and PONG).
    pub async fn send_on(&self, conn_id: ConnectionId, message: Message) -> Result<(), MeshError> {
        let conn = {
            let registry = self.inner.registry.lock().await;
            registry.conns.get(&conn_id).cloned()
        };
        match conn {
            Some(conn) => conn.send(message).await,
            None => Err(MeshError::ConnectionClosed),
        }
    }

    /// Broadcast to every established peer. Returns the number of peers
    /// the message was queued to.
    pub async fn broadcast(&self, message: Message) -> usize {
        self.broadcast_except(message, None).await
    }

    /// Broadcast to every established peer except `except` (the gossip
    /// forwarding rule).
    pub async fn broadcast_except(&self, message: Message, except: Option<&NodeId>) -> usize {
        let targets: Vec<Arc<Connection>> = {
            let registry = self.inner.registry.lock().await;
            registry
                .by_node
                .iter()
                .filter(|(node_id, _)| except != Some(*node_id))
                .filter_map(|(_, conn_id)| registry.conns.get(conn_id))
                .cloned()
                .collect()
        };
        let mut sent = 0;
        for conn in targets {
            if conn.send(message.clone()).await.is_ok() {
                sent += 1;
            }
        }
        sent
    }

    /// All connections, bound or not (keepalive pings go to every link).
    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner.registry.lock().await.conns.values().cloned().collect()
    }

    /// Node ids with an established link.
    pub async fn connected_peers(&self) -> Vec<NodeId> {
        self.inner.registry.lock().await.by_node.keys().cloned().collect()
    }

    pub async fn peer_count(&self) -> usize {
        self.inner.registry.lock().await.by_node.len()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.registry.lock().await.conns.len()
    }

    /// Whether an outbound link for this dial key exists.
    pub async fn is_dialed(&self, addr: &str) -> bool {
        self.inner.registry.lock().await.by_addr.contains_key(addr)
    }

    /// Close one connection by id.
    pub async fn close(&self, conn_id: ConnectionId) {
        let conn = {
            let registry = self.inner.registry.lock().await;
            registry.conns.get(&conn_id).cloned()
        };
        if let Some(conn) = conn {
            conn.close();
        }
    }

    /// Stop the accept loop and close every connection.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        let conns: Vec<Arc<Connection>> = {
            let registry = self.inner.registry.lock().await;
            registry.conns.values().cloned().collect()
        };
        for conn in conns {
            conn.close();
        }
    }
}

/// Build our HELLO for a given link.
fn local_hello(inner: &MeshInner) -> Hello {
    #[allow(clippy::cast_possible_truncation)]
    let p2p_port = inner.p2p_port.load(Ordering::Relaxed) as u16;
    Hello {
        node_id: inner.identity.node_id.clone(),
        p2p_port,
        http_port: inner.identity.http_port,
        role: inner.identity.role.as_str().to_string(),
        auth: inner
            .secret
            .as_deref()
            .map(|s| auth_token(s, &inner.identity.node_id)),
    }
}

async fn spawn_connection(
    inner: &Arc<MeshInner>,
    stream: TcpStream,
    addr: String,
    outbound: bool,
) -> Result<Arc<Connection>, MeshError> {
    let conn_id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
    let (read_half, write_half) = stream.into_split();
    let (send_tx, send_rx) = mpsc::channel::<Message>(256);
    let (close_tx, _) = watch::channel(false);

    let conn = Arc::new(Connection::new(conn_id, addr.clone(), outbound, send_tx, close_tx));

    {
        let mut registry = inner.registry.lock().await;
        if registry.conns.len() >= inner.max_connections {
            return Err(MeshError::ConnectionLimit(inner.max_connections));
        }
        registry.conns.insert(conn_id, conn.clone());
        if outbound {
            registry.by_addr.insert(addr.clone(), conn_id);
        }
    }

    tokio::spawn(run_writer(conn.clone(), write_half, send_rx));
    tokio::spawn(run_reader(inner.clone(), conn.clone(), read_half));

    // The dialer opens the handshake; the acceptor answers on receipt.
    if outbound && conn.mark_hello_sent() {
        conn.send(Message::Hello(local_hello(inner))).await?;
    }

    Ok(conn)
}

async fn run_writer(
    conn: Arc<Connection>,
    mut half: OwnedWriteHalf,
    mut send_rx: mpsc::Receiver<Message>,
) {
    let mut close_rx = conn.close_signal();
    loop {
        tokio::select! {
            _ = close_rx.changed() => {
                if *close_rx.borrow() {
                    break;
                }
            }
            queued = send_rx.recv() => {
                let Some(message) = queued else { break };
                let frame = match encode(&message) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(conn = conn.id, error = %err, "dropping unencodable message");
                        continue;
                    }
                };
                if let Err(err) = half.write_all(&frame).await {
                    debug!(conn = conn.id, error = %err, "write failed, closing");
                    break;
                }
                conn.touch();
            }
        }
    }
    let _ = half.shutdown().await;
    conn.close();
}

async fn run_reader(inner: Arc<MeshInner>, conn: Arc<Connection>, mut half: OwnedReadHalf) {
    use tokio::io::AsyncReadExt;

    let mut close_rx = conn.close_signal();
    let mut frames = FrameBuffer::new();
    let mut chunk = vec![0u8; 16 * 1024];

    loop {
        tokio::select! {
            _ = close_rx.changed() => {
                if *close_rx.borrow() {
                    break;
                }
            }
            read = timeout(constants::IDLE_TIMEOUT, half.read(&mut chunk)) => {
                match read {
                    Err(_) => {
                        debug!(conn = conn.id, addr = %conn.addr, "idle timeout, closing");
                        break;
                    }
                    Ok(Ok(0)) => break,
                    Ok(Ok(n)) => {
                        conn.touch();
                        frames.extend(&chunk[..n]);
                        match frames.decode_all() {
                            Ok(messages) => {
                                let mut violated = false;
                                for message in messages {
                                    if !handle_frame(&inner, &conn, message).await {
                                        violated = true;
                                        break;
                                    }
                                }
                                if violated {
                                    break;
                                }
                            }
                            Err(err) => {
                                warn!(conn = conn.id, addr = %conn.addr, error = %err, "protocol violation, closing");
                                break;
                            }
                        }
                    }
                    Ok(Err(err)) => {
                        debug!(conn = conn.id, error = %err, "read failed, closing");
                        break;
                    }
                }
            }
        }
    }

    conn.close();
    unregister(&inner, &conn).await;
}

/// Returns `false` when the frame was a handshake violation and the
/// connection must close.
async fn handle_frame(inner: &Arc<MeshInner>, conn: &Arc<Connection>, message: Message) -> bool {
    match message {
        Message::Hello(hello) => handle_hello(inner, conn, hello).await,
        other => {
            let event = MeshEvent::Frame {
                conn_id: conn.id,
                from: conn.peer_id(),
                message: other,
            };
            let _ = inner.events_tx.send(event).await;
            true
        }
    }
}

async fn handle_hello(inner: &Arc<MeshInner>, conn: &Arc<Connection>, hello: Hello) -> bool {
    if hello.node_id == inner.identity.node_id {
        debug!(conn = conn.id, "connected to self, closing");
        return false;
    }

    if let Some(secret) = &inner.secret {
        let expected = auth_token(secret, &hello.node_id);
        if hello.auth.as_deref() != Some(expected.as_str()) {
            warn!(conn = conn.id, peer = %hello.node_id, "handshake auth mismatch, closing");
            return false;
        }
    }

    // Bind, replacing any previous link to the same node. The newer socket
    // wins; the older one is closed.
    let replaced = {
        let mut registry = inner.registry.lock().await;
        let old = registry.by_node.insert(hello.node_id.clone(), conn.id);
        old.filter(|old_id| *old_id != conn.id)
            .and_then(|old_id| registry.conns.get(&old_id).cloned())
    };
    if let Some(old) = replaced {
        debug!(peer = %hello.node_id, old_conn = old.id, new_conn = conn.id, "replacing duplicate peer link");
        old.close();
    }
    conn.bind_peer(hello.node_id.clone());

    // Answer the handshake exactly once on accepted links.
    if !conn.outbound && conn.mark_hello_sent() {
        let reply = Message::Hello(local_hello(inner));
        if conn.send(reply).await.is_err() {
            return false;
        }
    }

    info!(peer = %hello.node_id, addr = %conn.addr, outbound = conn.outbound, "peer connected");
    let event = MeshEvent::PeerConnected {
        conn_id: conn.id,
        hello,
        addr: conn.addr.clone(),
    };
    let _ = inner.events_tx.send(event).await;
    true
}

async fn unregister(inner: &Arc<MeshInner>, conn: &Arc<Connection>) {
    let node_id = conn.peer_id();
    {
        let mut registry = inner.registry.lock().await;
        registry.conns.remove(&conn.id);
        if conn.outbound && registry.by_addr.get(&conn.addr) == Some(&conn.id) {
            registry.by_addr.remove(&conn.addr);
        }
        // Only drop the node-id index entry if this connection is still the
        // current holder; a reconnect may already have replaced it.
        if let Some(id) = &node_id {
            if registry.by_node.get(id) == Some(&conn.id) {
                registry.by_node.remove(id);
            }
        }
    }
    debug!(conn = conn.id, addr = %conn.addr, peer = ?node_id, "connection unregistered");
    let event = MeshEvent::PeerDisconnected {
        conn_id: conn.id,
        node_id,
        addr: conn.addr.clone(),
    };
    let _ = inner.events_tx.send(event).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_token_is_stable_and_peer_specific() {
        let a = NodeId::from_string("aaaa");
        let b = NodeId::from_string("bbbb");
        assert_eq!(auth_token("s3cret", &a), auth_token("s3cret", &a));
        assert_ne!(auth_token("s3cret", &a), auth_token("s3cret", &b));
        assert_ne!(auth_token("s3cret", &a), auth_token("other", &a));
    }
}
