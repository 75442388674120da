//! Swarm runtime: wires storage, mesh, gossip, election, dispatch, and
//! orchestration into one node process.
//!
//! The mesh delivers every frame to a single consumer loop here, which
//! dispatches on the typed message in one match, so an unhandled code is a
//! missing arm rather than a silent drop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::models::{
    Config, Node, NodeId, NodeRole, NodeStatus, NODE_OFFLINE_AFTER_SECS,
};
use crate::domain::ports::{
    state_keys, AgentBridge, AgentRepository, BoardRepository, GitWorkspace, NodeRepository,
    NodeStateRepository, Planner, Reviewer, StatusDetector, TaskRepository,
};
use crate::infrastructure::database::{
    apply_migrations, open_store, retry, SqliteAgentRepository, SqliteBoardRepository,
    SqliteNodeRepository, SqliteNodeStateRepository, SqliteTaskRepository,
};
use crate::infrastructure::mcp::{self, McpState};
use crate::mesh::connection::ConnectionId;
use crate::mesh::peer_manager::pong_for;
use crate::mesh::wire::{ElectionNotice, Message, NodeGossip};
use crate::mesh::{
    constants, discovery, spawn_anti_entropy, ElectionEffect, ElectionManager, GossipEngine,
    LamportClock, MeshEvent, MeshIdentity, PeerManager, SyncWatermark, TcpMesh,
};

use super::agent_monitor::AgentMonitor;
use super::agent_registry::AgentRegistry;
use super::claim_resolver::ClaimResolver;
use super::dispatcher::{DispatchHandle, TaskDispatcher};
use super::merge_pipeline::MergePipeline;
use super::orchestrator::Orchestrator;
use super::replication::Replicator;
use super::task_queue::TaskQueue;

const NODE_HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(15);

/// External collaborators injected at startup.
pub struct SwarmOptions {
    pub config: Config,
    pub planner: Arc<dyn Planner>,
    pub reviewer: Arc<dyn Reviewer>,
    pub bridge: Arc<dyn AgentBridge>,
    pub detector: Arc<dyn StatusDetector>,
    pub git: Arc<dyn GitWorkspace>,
}

/// A running swarm node.
pub struct SwarmHandle {
    pub node_id: NodeId,
    pub mesh: TcpMesh,
    pub p2p_port: u16,
    pub http_port: u16,
    pub queue: Arc<TaskQueue>,
    pub registry: Arc<AgentRegistry>,
    pub replicator: Arc<Replicator>,
    pub tasks: Arc<dyn TaskRepository>,
    pub agents: Arc<dyn AgentRepository>,
    pub nodes: Arc<dyn NodeRepository>,
    pub board: Arc<dyn BoardRepository>,
    pub dispatch: DispatchHandle,
    clock: Arc<LamportClock>,
    node_state: Arc<dyn NodeStateRepository>,
    shutdown_tx: watch::Sender<bool>,
    role_rx: watch::Receiver<NodeRole>,
}

impl SwarmHandle {
    pub fn role(&self) -> NodeRole {
        *self.role_rx.borrow()
    }

    pub fn role_watch(&self) -> watch::Receiver<NodeRole> {
        self.role_rx.clone()
    }

    /// Orderly shutdown: stop every loop, close the mesh, flush the clock.
    pub async fn shutdown(&self) {
        info!(node = %self.node_id, "shutting down");
        let _ = self.shutdown_tx.send(true);
        self.mesh.shutdown().await;
        let clock_value = self.clock.current().to_string();
        if let Err(err) = self.node_state.put(state_keys::LAMPORT_CLOCK, &clock_value).await {
            warn!(error = %err, "failed to flush lamport clock");
        }
        // Give spawned loops a moment to observe the flag.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }
}

/// Shared context for the background loops.
struct RuntimeCtx {
    node_id: NodeId,
    started_at: Instant,
    clock: Arc<LamportClock>,
    mesh: TcpMesh,
    gossip: Arc<GossipEngine>,
    peers: Arc<PeerManager>,
    replicator: Arc<Replicator>,
    resolver: ClaimResolver,
    dispatch: DispatchHandle,
    election: Mutex<ElectionManager>,
    role_tx: watch::Sender<NodeRole>,
    tasks: Arc<dyn TaskRepository>,
    agents: Arc<dyn AgentRepository>,
    nodes: Arc<dyn NodeRepository>,
    node_state: Arc<dyn NodeStateRepository>,
    http_host: String,
    http_port: u16,
    capabilities: Vec<String>,
}

/// Boot a node: storage, identity, mesh, and every background loop.
pub async fn start(options: SwarmOptions) -> Result<SwarmHandle> {
    let config = options.config;

    // Storage first: everything else hangs off the local replica. Opening
    // can contend with a CLI process on the same file, so transient
    // failures retry before escalating to fatal.
    let database_path = config.database_path();
    let pool = backoff::future::retry(retry::policy(&config.retry), || async {
        open_store(&database_path, config.database.max_connections)
            .await
            .map_err(backoff::Error::transient)
    })
    .await
    .context("failed to open database")?;
    backoff::future::retry(retry::policy(&config.retry), || async {
        apply_migrations(&pool).await.map_err(backoff::Error::transient)
    })
    .await
    .context("failed to run migrations")?;

    let tasks: Arc<dyn TaskRepository> = Arc::new(SqliteTaskRepository::new(pool.clone()));
    let agents: Arc<dyn AgentRepository> = Arc::new(SqliteAgentRepository::new(pool.clone()));
    let nodes: Arc<dyn NodeRepository> = Arc::new(SqliteNodeRepository::new(pool.clone()));
    let board: Arc<dyn BoardRepository> = Arc::new(SqliteBoardRepository::new(pool.clone()));
    let node_state: Arc<dyn NodeStateRepository> =
        Arc::new(SqliteNodeStateRepository::new(pool.clone()));

    // Stable identity and restored clock.
    let node_id = match node_state.get(state_keys::NODE_ID).await? {
        Some(id) => NodeId::from_string(id),
        None => {
            let id = NodeId::generate();
            node_state.put(state_keys::NODE_ID, id.as_str()).await?;
            id
        }
    };
    let clock_start = node_state
        .get(state_keys::LAMPORT_CLOCK)
        .await?
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    let clock = Arc::new(LamportClock::new(clock_start));
    let role = NodeRole::parse_str(&config.node.role).unwrap_or_default();
    info!(node = %node_id, role = role.as_str(), clock = clock_start, "node identity loaded");

    // Mesh and gossip plumbing.
    let identity = MeshIdentity {
        node_id: node_id.clone(),
        http_port: config.node.http_port,
        role,
    };
    let (mesh, mesh_events) = TcpMesh::new(
        identity,
        config.mesh.cluster_secret.clone(),
        config.mesh.max_connections,
    );
    let p2p_port = mesh.listen(config.mesh.p2p_port).await.context("failed to bind p2p port")?;
    let gossip = Arc::new(GossipEngine::new(mesh.clone()));

    let replicator = Arc::new(Replicator::new(
        clock.clone(),
        tasks.clone(),
        agents.clone(),
        nodes.clone(),
        board.clone(),
    ));
    let queue = Arc::new(TaskQueue::new(
        node_id.clone(),
        clock.clone(),
        tasks.clone(),
        agents.clone(),
        gossip.clone(),
    ));
    let resolver = ClaimResolver::new(node_id.clone(), clock.clone(), tasks.clone(), agents.clone());

    let dispatcher = Arc::new(TaskDispatcher::new(
        node_id.clone(),
        tasks.clone(),
        agents.clone(),
        queue.clone(),
        options.bridge.clone(),
    ));
    let dispatch = dispatcher.handle();

    let (role_tx, role_rx) = watch::channel(role);
    let registry = Arc::new(AgentRegistry::new(
        node_id.clone(),
        clock.clone(),
        agents.clone(),
        tasks.clone(),
        queue.clone(),
        gossip.clone(),
        dispatch.clone(),
        role_rx.clone(),
    ));
    let monitor = AgentMonitor::new(
        node_id.clone(),
        agents.clone(),
        tasks.clone(),
        queue.clone(),
        registry.clone(),
        options.bridge.clone(),
        options.detector.clone(),
    );
    let merge = Arc::new(MergePipeline::new(options.git.clone(), tasks.clone(), queue.clone()));
    let orchestrator = Arc::new(Orchestrator::new(
        node_id.clone(),
        queue.clone(),
        tasks.clone(),
        agents.clone(),
        options.planner.clone(),
        options.reviewer.clone(),
        merge,
        dispatch.clone(),
        role_rx.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Register our own node record before anyone asks about us.
    let mut own = Node::new(
        node_id.clone(),
        role,
        config.node.http_host.clone(),
        config.node.http_port,
        p2p_port,
    )
    .with_capabilities(config.node.capabilities.clone());
    own.lamport_ts = clock.tick();
    nodes.upsert(&own).await?;

    // Peer bookkeeping, seeded from config.
    let peers = PeerManager::new(mesh.clone(), config.mesh.max_connections);
    for seed in &config.mesh.seeds {
        peers.add_address(seed.clone()).await;
    }
    peers.spawn_loops(shutdown_rx.clone());

    // LAN discovery.
    if !config.mesh.disable_discovery {
        discovery::spawn_announcer(
            node_id.clone(),
            p2p_port,
            config.mesh.discovery_port,
            shutdown_rx.clone(),
        );
        let (found_tx, mut found_rx) = mpsc::channel(64);
        if let Err(err) = discovery::spawn_listener(
            node_id.clone(),
            config.mesh.discovery_port,
            found_tx,
            shutdown_rx.clone(),
        )
        .await
        {
            warn!(error = %err, "discovery listener failed to bind; continuing without it");
        }
        let discovery_peers = peers.clone();
        let discovery_mesh = mesh.clone();
        tokio::spawn(async move {
            while let Some(found) = found_rx.recv().await {
                let addr = found.addr();
                if discovery_peers.add_address(addr.clone()).await {
                    let _ = discovery_mesh.dial(&addr).await;
                }
            }
        });
    }

    // Pull-based reconciliation.
    spawn_anti_entropy(
        mesh.clone(),
        replicator.clone() as Arc<dyn SyncWatermark>,
        shutdown_rx.clone(),
    );

    let ctx = Arc::new(RuntimeCtx {
        node_id: node_id.clone(),
        started_at: Instant::now(),
        clock: clock.clone(),
        mesh: mesh.clone(),
        gossip: gossip.clone(),
        peers,
        replicator: replicator.clone(),
        resolver,
        dispatch: dispatch.clone(),
        election: Mutex::new(ElectionManager::new(node_id.clone(), role).with_timers(
            Duration::from_secs(config.mesh.emperor_heartbeat_secs),
            Duration::from_secs(config.mesh.emperor_stale_secs),
            Duration::from_secs(config.mesh.election_wait_secs),
        )),
        role_tx,
        tasks: tasks.clone(),
        agents: agents.clone(),
        nodes: nodes.clone(),
        node_state: node_state.clone(),
        http_host: config.node.http_host.clone(),
        http_port: config.node.http_port,
        capabilities: config.node.capabilities.clone(),
    });

    // The single mesh consumer.
    spawn_mesh_loop(ctx.clone(), mesh_events, shutdown_rx.clone());

    // Election driver.
    spawn_election_loop(ctx.clone(), shutdown_rx.clone());

    // Node heartbeat + staleness sweep.
    spawn_node_heartbeat_loop(ctx.clone(), shutdown_rx.clone());

    // Agent heartbeats and offline detection.
    registry.spawn_loops(shutdown_rx.clone());

    // Dispatch, monitoring, orchestration.
    {
        let dispatcher = dispatcher.clone();
        let stop = shutdown_rx.clone();
        tokio::spawn(async move { dispatcher.run(stop).await });
    }
    {
        let stop = shutdown_rx.clone();
        tokio::spawn(async move { monitor.run(stop).await });
    }
    // Reconcile tasks stranded by a previous run, then start the
    // orchestration loop.
    match orchestrator.reconcile_on_startup().await {
        Ok(0) => {}
        Ok(n) => info!(requeued = n, "startup reconciliation requeued stranded tasks"),
        Err(err) => warn!(error = %err, "startup reconciliation failed"),
    }
    {
        let orchestrator = orchestrator.clone();
        let queue_events = queue.subscribe();
        let replica_events = replicator.subscribe();
        let stop = shutdown_rx.clone();
        tokio::spawn(async move { orchestrator.run(queue_events, replica_events, stop).await });
    }

    // MCP surface.
    let mcp_state = McpState {
        node_id: node_id.clone(),
        clock: clock.clone(),
        queue: queue.clone(),
        registry: registry.clone(),
        replicator: replicator.clone(),
        gossip: gossip.clone(),
    };
    let http_port = mcp::serve(
        mcp_state,
        &config.node.http_host,
        config.node.http_port,
        shutdown_rx.clone(),
    )
    .await?;

    Ok(SwarmHandle {
        node_id,
        mesh,
        p2p_port,
        http_port,
        queue,
        registry,
        replicator,
        tasks,
        agents,
        nodes,
        board,
        dispatch,
        clock,
        node_state,
        shutdown_tx,
        role_rx,
    })
}

fn spawn_mesh_loop(
    ctx: Arc<RuntimeCtx>,
    mut events: mpsc::Receiver<MeshEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else { break };
                    handle_mesh_event(&ctx, event).await;
                }
            }
        }
        debug!("mesh consumer stopped");
    });
}

async fn handle_mesh_event(ctx: &Arc<RuntimeCtx>, event: MeshEvent) {
    match event {
        MeshEvent::PeerConnected { hello, addr, .. } => {
            // Learn the peer's dialable address and seed a node record;
            // its own NODE_STATUS heartbeats will overwrite this stub.
            let host = addr.split(':').next().unwrap_or("127.0.0.1").to_string();
            ctx.peers.add_address(format!("{host}:{}", hello.p2p_port)).await;
            let stub = Node::new(
                hello.node_id.clone(),
                NodeRole::parse_str(&hello.role).unwrap_or_default(),
                host,
                hello.http_port,
                hello.p2p_port,
            );
            if let Err(err) = ctx.replicator.apply_node(&stub).await {
                warn!(error = %err, "failed to seed node record");
            }
        }
        MeshEvent::PeerDisconnected { node_id, addr, .. } => {
            debug!(peer = ?node_id, %addr, "peer disconnected");
        }
        MeshEvent::Frame { conn_id, from, message } => {
            if let Err(err) = handle_frame(ctx, conn_id, from, message).await {
                warn!(error = %err, "failed to handle frame");
            }
        }
    }
}

async fn handle_frame(
    ctx: &Arc<RuntimeCtx>,
    conn_id: ConnectionId,
    from: Option<NodeId>,
    message: Message,
) -> anyhow::Result<()> {
    match &message {
        // Handshake frames are consumed by the mesh itself.
        Message::Hello(_) => {}

        Message::Pex(pex) => ctx.peers.merge_addresses(pex.peers.clone()).await,
        Message::Ping(_) => {
            let _ = ctx.mesh.send_on(conn_id, pong_for(&ctx.node_id)).await;
        }
        Message::Pong(_) => ctx.peers.on_pong(conn_id).await,

        Message::SyncReq(req) => {
            let rsp = ctx.replicator.collect_since(req.since_lamport_ts).await?;
            debug!(
                peer = %req.node_id,
                since = req.since_lamport_ts,
                tasks = rsp.tasks.len(),
                "answering sync request"
            );
            let _ = ctx.mesh.send_on(conn_id, Message::SyncRsp(Box::new(rsp))).await;
        }
        Message::SyncRsp(rsp) => {
            let applied = ctx.replicator.apply_sync(rsp).await?;
            if applied > 0 {
                info!(applied, "anti-entropy applied records");
                ctx.dispatch.task_ready();
            }
        }

        Message::EmperorHeartbeat(notice) => {
            ctx.clock.witness(notice.lamport_ts);
            let effects = {
                let mut election = ctx.election.lock().await;
                election.on_emperor_heartbeat(notice.node_id.clone(), Instant::now())
            };
            execute_election_effects(ctx, effects).await;
        }
        Message::ElectionStart(notice) => {
            ctx.clock.witness(notice.lamport_ts);
            let effects = {
                let mut election = ctx.election.lock().await;
                election.on_election_start(notice.node_id.clone(), Instant::now())
            };
            execute_election_effects(ctx, effects).await;
        }
        Message::ElectionVictory(notice) => {
            ctx.clock.witness(notice.lamport_ts);
            let effects = {
                let mut election = ctx.election.lock().await;
                election.on_victory(notice.node_id.clone(), Instant::now())
            };
            execute_election_effects(ctx, effects).await;
        }

        // Gossip-class records: dedup, ingest, forward to everyone but the
        // sender.
        _ => {
            let Some(message_id) = message.message_id() else {
                return Ok(());
            };
            if !ctx.gossip.observe(message_id) {
                return Ok(());
            }
            ingest_gossip(ctx, &message).await?;
            if let Some(sender) = &from {
                ctx.gossip.forward(message.clone(), sender).await;
            }
        }
    }
    Ok(())
}

async fn ingest_gossip(ctx: &Arc<RuntimeCtx>, message: &Message) -> anyhow::Result<()> {
    match message {
        Message::TaskCreate(m) => {
            if ctx.replicator.apply_task(&m.task).await? {
                ctx.dispatch.task_ready();
            }
        }
        Message::TaskUpdate(m) => {
            if ctx.replicator.apply_task(&m.task).await? {
                ctx.dispatch.task_ready();
            }
        }
        Message::TaskComplete(m) => {
            if ctx.replicator.apply_task(&m.task).await? {
                ctx.dispatch.task_ready();
            }
        }
        Message::TaskFail(m) => {
            ctx.replicator.apply_task(&m.task).await?;
        }
        Message::TaskCancel(m) => {
            ctx.replicator.apply_task(&m.task).await?;
        }
        Message::TaskClaim(m) => {
            ctx.resolver.handle_remote_claim(m).await?;
        }
        Message::AgentRegister(m) | Message::AgentHeartbeat(m) => {
            ctx.replicator.apply_agent(&m.agent).await?;
        }
        Message::AgentDeregister(m) => {
            ctx.replicator.remove_agent(&m.agent).await?;
        }
        Message::NodeRegister(m) | Message::NodeStatus(m) => {
            if m.node.node_id != ctx.node_id {
                ctx.replicator.apply_node(&m.node).await?;
                ctx.peers
                    .add_address(format!("{}:{}", m.node.http_host, m.node.p2p_port))
                    .await;
            }
        }
        Message::BoardPost(m) => {
            ctx.replicator.apply_board(&m.message).await?;
        }
        _ => {}
    }
    Ok(())
}

fn spawn_election_loop(ctx: Arc<RuntimeCtx>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(constants::ELECTION_TICK);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    let effects = {
                        let mut election = ctx.election.lock().await;
                        election.on_tick(Instant::now())
                    };
                    execute_election_effects(&ctx, effects).await;
                }
            }
        }
    });
}

async fn execute_election_effects(ctx: &Arc<RuntimeCtx>, effects: Vec<ElectionEffect>) {
    for effect in effects {
        match effect {
            ElectionEffect::SendHeartbeat => {
                ctx.mesh
                    .broadcast(Message::EmperorHeartbeat(ElectionNotice {
                        node_id: ctx.node_id.clone(),
                        lamport_ts: ctx.clock.tick(),
                    }))
                    .await;
            }
            ElectionEffect::SendElectionStart => {
                ctx.mesh
                    .broadcast(Message::ElectionStart(ElectionNotice {
                        node_id: ctx.node_id.clone(),
                        lamport_ts: ctx.clock.tick(),
                    }))
                    .await;
            }
            ElectionEffect::SendVictory => {
                ctx.mesh
                    .broadcast(Message::ElectionVictory(ElectionNotice {
                        node_id: ctx.node_id.clone(),
                        lamport_ts: ctx.clock.tick(),
                    }))
                    .await;
            }
            ElectionEffect::BecameEmperor => {
                info!(node = %ctx.node_id, "assumed emperor role");
                let _ = ctx.role_tx.send(NodeRole::Emperor);
                publish_node_status(ctx).await;
            }
            ElectionEffect::SteppedDown => {
                info!(node = %ctx.node_id, "stepped down from emperor role");
                let _ = ctx.role_tx.send(NodeRole::Worker);
                publish_node_status(ctx).await;
            }
            ElectionEffect::EmperorIs(emperor) => {
                debug!(emperor = %emperor, "recorded new emperor");
                let _ = ctx.nodes.set_role(&emperor, NodeRole::Emperor, ctx.clock.tick()).await;
            }
        }
    }
}

fn spawn_node_heartbeat_loop(ctx: Arc<RuntimeCtx>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(NODE_HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    publish_node_status(&ctx).await;

                    let cutoff = Utc::now() - ChronoDuration::seconds(NODE_OFFLINE_AFTER_SECS);
                    match ctx.nodes.mark_stale_offline(cutoff).await {
                        Ok(flipped) if !flipped.is_empty() => {
                            for node_id in flipped {
                                warn!(node = %node_id, "peer node heartbeat lapsed, marked offline");
                            }
                        }
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "node stale sweep failed"),
                    }

                    // Crash-safe-ish clock checkpoint; the authoritative
                    // flush happens at shutdown.
                    let value = ctx.clock.current().to_string();
                    let _ = ctx.node_state.put(state_keys::LAMPORT_CLOCK, &value).await;
                }
            }
        }
    });
}

/// Refresh and gossip our own node record.
async fn publish_node_status(ctx: &Arc<RuntimeCtx>) {
    let role = *ctx.role_tx.borrow();
    let agent_count = ctx
        .agents
        .list_by_node(&ctx.node_id)
        .await
        .map(|a| a.len())
        .unwrap_or(0);
    let active_task_count = ctx
        .agents
        .list_by_node(&ctx.node_id)
        .await
        .map(|a| a.iter().filter(|agent| agent.current_task_id.is_some()).count())
        .unwrap_or(0);

    let mut node = match ctx.nodes.get(&ctx.node_id).await {
        Ok(Some(node)) => node,
        _ => Node::new(ctx.node_id.clone(), role, ctx.http_host.clone(), ctx.http_port, ctx.mesh.p2p_port()),
    };
    node.role = role;
    node.status = NodeStatus::Online;
    node.capabilities = ctx.capabilities.clone();
    node.last_heartbeat = Utc::now();
    node.lamport_ts = ctx.clock.tick();
    #[allow(clippy::cast_possible_truncation)]
    {
        node.agent_count = agent_count as u32;
        node.active_task_count = active_task_count as u32;
    }
    node.uptime_seconds = ctx.started_at.elapsed().as_secs();
    node.memory_usage_bytes = read_memory_usage();

    if let Err(err) = ctx.nodes.upsert(&node).await {
        warn!(error = %err, "failed to persist own node record");
        return;
    }
    ctx.gossip
        .publish(Message::NodeStatus(NodeGossip {
            message_id: Uuid::new_v4(),
            node,
        }))
        .await;
}

/// Resident set size, best effort. Linux only; 0 elsewhere.
fn read_memory_usage() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
            if let Some(resident) = statm.split_whitespace().nth(1) {
                if let Ok(pages) = resident.parse::<u64>() {
                    return pages * 4096;
                }
            }
        }
    }
    0
}
