//! Runtime configuration for a VoidLux node.

use serde::{Deserialize, Serialize};

/// Main configuration structure for a VoidLux node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Node settings (identity, role, directories).
    #[serde(default)]
    pub node: NodeConfig,

    /// Mesh networking settings.
    #[serde(default)]
    pub mesh: MeshConfig,

    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Retry policy for transient storage errors.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            mesh: MeshConfig::default(),
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

/// Node identity and filesystem settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NodeConfig {
    /// Directory holding the database and node state.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Requested role at startup: emperor, worker, or seneschal.
    /// Election may change it at runtime.
    #[serde(default = "default_role")]
    pub role: String,

    /// Port for the inbound MCP/HTTP surface.
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Host advertised to peers for the HTTP surface.
    #[serde(default = "default_http_host")]
    pub http_host: String,

    /// Capabilities advertised in node heartbeats.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

fn default_data_dir() -> String {
    ".voidlux".to_string()
}

fn default_role() -> String {
    "worker".to_string()
}

const fn default_http_port() -> u16 {
    7780
}

fn default_http_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            role: default_role(),
            http_port: default_http_port(),
            http_host: default_http_host(),
            capabilities: Vec::new(),
        }
    }
}

/// Mesh networking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MeshConfig {
    /// TCP port the mesh listens on.
    #[serde(default = "default_p2p_port")]
    pub p2p_port: u16,

    /// UDP port used for LAN discovery broadcasts.
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,

    /// Seed addresses dialed at startup, `host:port`.
    #[serde(default)]
    pub seeds: Vec<String>,

    /// Hard cap on concurrent peer connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Optional shared secret; when set, HELLO carries an auth token and
    /// mismatching peers are disconnected.
    #[serde(default)]
    pub cluster_secret: Option<String>,

    /// Disable the UDP announce/listen loops (useful in tests and CI).
    #[serde(default)]
    pub disable_discovery: bool,

    /// Seconds between the emperor's EMPEROR_HEARTBEAT broadcasts.
    #[serde(default = "default_emperor_heartbeat_secs")]
    pub emperor_heartbeat_secs: u64,

    /// Seconds without an emperor heartbeat before a worker campaigns.
    #[serde(default = "default_emperor_stale_secs")]
    pub emperor_stale_secs: u64,

    /// Seconds a candidate waits unchallenged before claiming victory.
    #[serde(default = "default_election_wait_secs")]
    pub election_wait_secs: u64,
}

const fn default_p2p_port() -> u16 {
    7700
}

const fn default_discovery_port() -> u16 {
    7701
}

const fn default_max_connections() -> usize {
    20
}

const fn default_emperor_heartbeat_secs() -> u64 {
    10
}

const fn default_emperor_stale_secs() -> u64 {
    30
}

const fn default_election_wait_secs() -> u64 {
    5
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            p2p_port: default_p2p_port(),
            discovery_port: default_discovery_port(),
            seeds: Vec::new(),
            max_connections: default_max_connections(),
            cluster_secret: None,
            disable_discovery: false,
            emperor_heartbeat_secs: default_emperor_heartbeat_secs(),
            emperor_stale_secs: default_emperor_stale_secs(),
            election_wait_secs: default_election_wait_secs(),
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DatabaseConfig {
    /// Path to the `SQLite` database file, relative to `data_dir` unless
    /// absolute.
    #[serde(default = "default_database_path")]
    pub path: String,

    /// Maximum number of pooled connections.
    #[serde(default = "default_db_connections")]
    pub max_connections: u32,
}

fn default_database_path() -> String {
    "voidlux.db".to_string()
}

const fn default_db_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_connections: default_db_connections(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty.
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Retry policy for transient storage errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Attempts before a transient error escalates to fatal.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Backoff ceiling in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_initial_backoff_ms() -> u64 {
    100
}

const fn default_max_backoff_ms() -> u64 {
    2_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Config {
    /// Absolute or data-dir-relative database path.
    pub fn database_path(&self) -> String {
        let p = std::path::Path::new(&self.database.path);
        if p.is_absolute() {
            self.database.path.clone()
        } else {
            format!("{}/{}", self.node.data_dir, self.database.path)
        }
    }
}
