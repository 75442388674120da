//! The `start` command: run a swarm node until interrupted.

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::domain::models::Config;
use crate::infrastructure::git::CommandGitWorkspace;
use crate::infrastructure::substrates::{
    ApprovingReviewer, MarkerStatusDetector, NullAgentBridge, PassthroughPlanner,
};
use crate::services::{self, SwarmOptions};

/// CLI overrides applied on top of the merged file/env configuration.
pub struct StartOverrides {
    pub p2p_port: Option<u16>,
    pub discovery_port: Option<u16>,
    pub seeds: Option<String>,
    pub data_dir: Option<String>,
    pub role: Option<String>,
    pub http_port: Option<u16>,
}

pub fn apply_overrides(config: &mut Config, overrides: StartOverrides) {
    if let Some(port) = overrides.p2p_port {
        config.mesh.p2p_port = port;
    }
    if let Some(port) = overrides.discovery_port {
        config.mesh.discovery_port = port;
    }
    if let Some(seeds) = overrides.seeds {
        config.mesh.seeds = seeds
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect();
    }
    if let Some(data_dir) = overrides.data_dir {
        config.node.data_dir = data_dir;
    }
    if let Some(role) = overrides.role {
        config.node.role = role;
    }
    if let Some(port) = overrides.http_port {
        config.node.http_port = port;
    }
}

pub async fn handle_start(config: Config) -> Result<()> {
    // The node runs from the repository it orchestrates; worktrees live
    // under the data directory.
    let repo_root = ".".to_string();
    let worktree_root = format!("{}/worktrees", config.node.data_dir);

    let options = SwarmOptions {
        config,
        planner: Arc::new(PassthroughPlanner),
        reviewer: Arc::new(ApprovingReviewer),
        bridge: Arc::new(NullAgentBridge),
        detector: Arc::new(MarkerStatusDetector),
        git: Arc::new(CommandGitWorkspace::new(repo_root, worktree_root)),
    };

    let handle = services::start(options).await.context("failed to start swarm node")?;
    tracing::info!(
        node = %handle.node_id,
        p2p_port = handle.p2p_port,
        http_port = handle.http_port,
        role = handle.role().as_str(),
        "swarm node running; press ctrl-c to stop"
    );

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    handle.shutdown().await;
    Ok(())
}
