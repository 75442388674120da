//! UDP LAN discovery.
//!
//! Every node broadcasts a small announce datagram on the discovery port;
//! listeners surface unknown peers as `(host, port, node_id)` events for
//! the peer manager to dial.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::domain::models::NodeId;

use super::constants;

/// The announce datagram body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announce {
    pub node_id: NodeId,
    pub p2p_port: u16,
}

/// A peer heard on the LAN.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredPeer {
    pub host: String,
    pub port: u16,
    pub node_id: NodeId,
}

impl DiscoveredPeer {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Spawn the periodic announce loop.
pub fn spawn_announcer(
    node_id: NodeId,
    p2p_port: u16,
    discovery_port: u16,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
            Ok(s) => s,
            Err(err) => {
                warn!(error = %err, "discovery announcer failed to bind");
                return;
            }
        };
        if let Err(err) = socket.set_broadcast(true) {
            warn!(error = %err, "discovery announcer cannot enable broadcast");
            return;
        }

        let announce = Announce { node_id, p2p_port };
        let payload = match serde_json::to_vec(&announce) {
            Ok(p) => p,
            Err(err) => {
                warn!(error = %err, "discovery announce failed to serialize");
                return;
            }
        };
        let target = format!("255.255.255.255:{discovery_port}");
        let mut interval = tokio::time::interval(constants::DISCOVERY_INTERVAL);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(err) = socket.send_to(&payload, &target).await {
                        debug!(error = %err, "discovery broadcast failed");
                    }
                }
            }
        }
        debug!("discovery announcer stopped");
    });
}

/// Spawn the listener; unknown non-self announces are forwarded on
/// `found_tx`.
pub async fn spawn_listener(
    local_node_id: NodeId,
    discovery_port: u16,
    found_tx: mpsc::Sender<DiscoveredPeer>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", discovery_port)).await?;
    tokio::spawn(async move {
        let mut buf = vec![0u8; 512];
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((n, from)) => {
                            if let Some(peer) = parse_announce(&buf[..n], from, &local_node_id) {
                                debug!(peer = %peer.node_id, addr = %peer.addr(), "discovered peer");
                                let _ = found_tx.send(peer).await;
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, "discovery recv failed");
                        }
                    }
                }
            }
        }
        debug!("discovery listener stopped");
    });
    Ok(())
}

fn parse_announce(bytes: &[u8], from: SocketAddr, local: &NodeId) -> Option<DiscoveredPeer> {
    let announce: Announce = serde_json::from_slice(bytes).ok()?;
    if announce.node_id == *local {
        return None;
    }
    Some(DiscoveredPeer {
        host: from.ip().to_string(),
        port: announce.p2p_port,
        node_id: announce.node_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_announce_is_ignored() {
        let me = NodeId::from_string("aaaa");
        let bytes = serde_json::to_vec(&Announce { node_id: me.clone(), p2p_port: 7700 }).unwrap();
        let from: SocketAddr = "192.168.1.5:9999".parse().unwrap();
        assert!(parse_announce(&bytes, from, &me).is_none());
    }

    #[test]
    fn peer_announce_yields_host_and_port() {
        let me = NodeId::from_string("aaaa");
        let other = NodeId::from_string("bbbb");
        let bytes = serde_json::to_vec(&Announce { node_id: other.clone(), p2p_port: 7700 }).unwrap();
        let from: SocketAddr = "192.168.1.5:9999".parse().unwrap();
        let peer = parse_announce(&bytes, from, &me).unwrap();
        assert_eq!(peer.addr(), "192.168.1.5:7700");
        assert_eq!(peer.node_id, other);
    }

    #[test]
    fn junk_datagrams_are_dropped() {
        let me = NodeId::from_string("aaaa");
        let from: SocketAddr = "192.168.1.5:9999".parse().unwrap();
        assert!(parse_announce(b"junk", from, &me).is_none());
    }
}
