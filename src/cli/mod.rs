//! Command-line interface.

pub mod start;
pub mod status;
pub mod task;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "voidlux", version, about = "Decentralized swarm orchestrator for AI coding agents")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Emit JSON instead of tables.
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run a swarm node.
    Start {
        /// TCP port for the P2P mesh.
        #[arg(long)]
        p2p_port: Option<u16>,

        /// UDP port for LAN discovery.
        #[arg(long)]
        discovery_port: Option<u16>,

        /// Comma-separated seed addresses (host:port,...).
        #[arg(long)]
        seeds: Option<String>,

        /// Data directory for the database and node state.
        #[arg(long)]
        data_dir: Option<String>,

        /// Initial role: emperor, worker, or seneschal.
        #[arg(long)]
        role: Option<String>,

        /// Port for the inbound MCP/HTTP surface.
        #[arg(long)]
        http_port: Option<u16>,
    },

    /// Task management.
    #[command(subcommand)]
    Task(TaskCommands),

    /// Node, agent, and queue summary from the local replica.
    Status,
}

#[derive(Debug, Subcommand)]
pub enum TaskCommands {
    /// Submit a new task.
    Submit {
        /// Task title.
        title: String,

        /// Detailed description.
        #[arg(long, default_value = "")]
        description: String,

        /// Priority; higher dispatches first.
        #[arg(long, default_value_t = 0)]
        priority: i64,

        /// Required capability (repeatable).
        #[arg(long = "capability")]
        capabilities: Vec<String>,

        /// Task id this task depends on (repeatable).
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,

        /// Command run in the integration worktree after merging.
        #[arg(long)]
        test_command: Option<String>,

        /// Repository path the task operates on.
        #[arg(long)]
        project_path: Option<String>,
    },

    /// List tasks.
    List {
        /// Filter by status.
        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Show one task.
    Show { task_id: String },

    /// Cancel a task.
    Cancel { task_id: String },
}
