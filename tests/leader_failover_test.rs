mod common;

use std::time::Duration;

use voidlux::domain::models::{Config, NodeRole};
use voidlux::domain::ports::NodeRepository;

use common::{start_inert, test_config, wait_for};

/// Shrink the election timers so the failover happens in seconds instead
/// of the production half-minute.
fn quick_elections(config: &mut Config) {
    config.mesh.emperor_heartbeat_secs = 1;
    config.mesh.emperor_stale_secs = 3;
    config.mesh.election_wait_secs = 1;
}

/// Scenario: the emperor goes silent; after the stale window the smallest
/// remaining node id broadcasts ELECTION_START over the mesh, claims
/// victory unchallenged, and every peer converges on it as the new
/// emperor. This drives the real wire path: EMPEROR_HEARTBEAT starvation,
/// ELECTION_START/ELECTION_VICTORY frames through the frame dispatcher,
/// and the role change gossiped back out.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn workers_elect_replacement_when_emperor_goes_silent() {
    let (mut config, dir) = test_config();
    config.node.role = "emperor".to_string();
    quick_elections(&mut config);
    let emperor = start_inert(config, dir).await;

    let emperor_addr = format!("127.0.0.1:{}", emperor.handle.p2p_port);
    let (mut config, dir) = test_config();
    config.mesh.seeds = vec![emperor_addr.clone()];
    quick_elections(&mut config);
    let b = start_inert(config, dir).await;

    // The third node seeds both others so the survivors hold a direct
    // link once the emperor is gone.
    let b_addr = format!("127.0.0.1:{}", b.handle.p2p_port);
    let (mut config, dir) = test_config();
    config.mesh.seeds = vec![emperor_addr, b_addr];
    quick_elections(&mut config);
    let c = start_inert(config, dir).await;

    let meshed = wait_for(
        || async { b.handle.mesh.peer_count().await == 2 && c.handle.mesh.peer_count().await == 2 },
        Duration::from_secs(10),
    )
    .await;
    assert!(meshed, "three-node mesh never formed");

    // Both workers have heard the emperor's heartbeat and recorded it.
    let emperor_id = emperor.handle.node_id.clone();
    let emperor_seen = wait_for(
        || async {
            let on_b = b.handle.nodes.get(&emperor_id).await.unwrap();
            let on_c = c.handle.nodes.get(&emperor_id).await.unwrap();
            on_b.is_some_and(|n| n.role == NodeRole::Emperor)
                && on_c.is_some_and(|n| n.role == NodeRole::Emperor)
        },
        Duration::from_secs(10),
    )
    .await;
    assert!(emperor_seen, "workers never recorded the original emperor");
    assert_eq!(b.handle.role(), NodeRole::Worker);
    assert_eq!(c.handle.role(), NodeRole::Worker);

    // Starve the workers of EMPEROR_HEARTBEAT.
    emperor.handle.shutdown().await;

    // The bully order is fixed: the lexicographically smaller node id
    // must take the crown on every replica.
    let (winner, loser) = if b.handle.node_id < c.handle.node_id { (&b, &c) } else { (&c, &b) };

    let elected = wait_for(
        || async { winner.handle.role() == NodeRole::Emperor },
        Duration::from_secs(20),
    )
    .await;
    assert!(elected, "no replacement emperor was elected");

    // The victory (and the winner's follow-up heartbeats) reached the
    // other worker: its replica now shows the winner as emperor.
    let winner_id = winner.handle.node_id.clone();
    let converged = wait_for(
        || async {
            loser
                .handle
                .nodes
                .get(&winner_id)
                .await
                .unwrap()
                .is_some_and(|n| n.role == NodeRole::Emperor)
        },
        Duration::from_secs(10),
    )
    .await;
    assert!(converged, "surviving peer never recorded the new emperor");

    // The loser yielded its own campaign rather than splitting the crown.
    assert_eq!(loser.handle.role(), NodeRole::Worker);
    let own = winner.handle.nodes.get(&winner_id).await.unwrap().unwrap();
    assert_eq!(own.role, NodeRole::Emperor);

    b.handle.shutdown().await;
    c.handle.shutdown().await;
}
