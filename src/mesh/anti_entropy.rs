//! Anti-entropy: periodic pull reconciliation.
//!
//! Every interval, pick one random connected peer and ask for every record
//! with a Lamport timestamp above our local watermark. This heals dropped
//! gossip and catches up fresh joiners; responses flow through the same
//! ingest path as pushed records.

use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio::sync::watch;
use tracing::debug;

use super::tcp_mesh::TcpMesh;
use super::wire::{Message, SyncReq};
use super::constants;

/// Where the local replication watermark comes from.
#[async_trait]
pub trait SyncWatermark: Send + Sync {
    /// Highest Lamport timestamp present across all replicated tables.
    async fn watermark(&self) -> u64;
}

/// Spawn the periodic pull loop.
pub fn spawn_anti_entropy(
    mesh: TcpMesh,
    source: Arc<dyn SyncWatermark>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(constants::ANTI_ENTROPY_INTERVAL);
        // The first tick fires immediately; that is exactly what a fresh
        // joiner wants.
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    sync_pass(&mesh, source.as_ref()).await;
                }
            }
        }
        debug!("anti-entropy loop stopped");
    });
}

async fn sync_pass(mesh: &TcpMesh, source: &dyn SyncWatermark) {
    let peers = mesh.connected_peers().await;
    let Some(peer) = peers.choose(&mut rand::thread_rng()).cloned() else {
        return;
    };
    let since = source.watermark().await;
    debug!(peer = %peer, since, "requesting anti-entropy sync");
    let req = Message::SyncReq(SyncReq {
        node_id: mesh.local_node_id().clone(),
        since_lamport_ts: since,
    });
    let _ = mesh.send_to(&peer, req).await;
}
