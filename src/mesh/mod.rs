//! The P2P mesh: framed-JSON TCP transport, UDP discovery, gossip with
//! anti-entropy, and bully leader election.

pub mod anti_entropy;
pub mod clock;
pub mod codec;
pub mod connection;
pub mod discovery;
pub mod election;
pub mod gossip;
pub mod peer_manager;
pub mod tcp_mesh;
pub mod wire;

use std::time::Duration;

use thiserror::Error;

pub use anti_entropy::{spawn_anti_entropy, SyncWatermark};
pub use clock::LamportClock;
pub use codec::{encode, CodecError, FrameBuffer, MAX_FRAME_BYTES};
pub use connection::{Connection, ConnectionId};
pub use discovery::{Announce, DiscoveredPeer};
pub use election::{ElectionEffect, ElectionManager};
pub use gossip::GossipEngine;
pub use peer_manager::PeerManager;
pub use tcp_mesh::{auth_token, MeshEvent, MeshIdentity, TcpMesh};
pub use wire::Message;

/// Protocol timing and bounds. One place, so the table reads like the
/// design doc.
pub mod constants {
    use std::time::Duration;

    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const ACCEPT_RETRY: Duration = Duration::from_secs(1);
    pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
    pub const PING_INTERVAL: Duration = Duration::from_secs(15);
    pub const MAX_MISSED_PONGS: u32 = 3;
    pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(10);
    pub const REDIAL_BACKOFF: Duration = Duration::from_secs(30);
    pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(5);
    pub const PEX_INTERVAL: Duration = Duration::from_secs(30);
    pub const PEX_MAX_PEERS: usize = 32;
    pub const ANTI_ENTROPY_INTERVAL: Duration = Duration::from_secs(60);
    pub const EMPEROR_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
    pub const EMPEROR_STALE_AFTER: Duration = Duration::from_secs(30);
    pub const ELECTION_WAIT: Duration = Duration::from_secs(5);
    pub const ELECTION_TICK: Duration = Duration::from_secs(1);
    pub const SEEN_CACHE_CAPACITY: usize = 5_000;
}

/// Transport-layer errors. These are absorbed at the mesh boundary: logged,
/// the connection closed, and recovery left to the reconnect loop.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("connection limit of {0} reached")]
    ConnectionLimit(usize),

    #[error("not connected to {0}")]
    NotConnected(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("dial timed out after {0:?}")]
    DialTimeout(Duration),

    #[error("already connected to {0}")]
    AlreadyConnected(String),
}
