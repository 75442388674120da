//! Domain models.

pub mod agent;
pub mod board;
pub mod config;
pub mod node;
pub mod task;

pub use agent::{Agent, AgentStatus, AGENT_OFFLINE_AFTER_SECS};
pub use board::BoardMessage;
pub use config::{Config, DatabaseConfig, LoggingConfig, MeshConfig, NodeConfig, RetryConfig};
pub use node::{Node, NodeId, NodeRole, NodeStatus, NODE_OFFLINE_AFTER_SECS};
pub use task::{Complexity, ReviewStatus, Task, TaskStatus, MAX_MERGE_ATTEMPTS, RETRY_EXHAUSTED};
