//! Orchestration services.

pub mod agent_monitor;
pub mod agent_registry;
pub mod claim_resolver;
pub mod dispatcher;
pub mod merge_pipeline;
pub mod orchestrator;
pub mod replication;
pub mod runtime;
pub mod task_queue;

pub use agent_monitor::AgentMonitor;
pub use agent_registry::AgentRegistry;
pub use claim_resolver::{compare_claims, ClaimDecision, ClaimResolver};
pub use dispatcher::{DispatchEvent, DispatchHandle, TaskDispatcher};
pub use merge_pipeline::{MergePipeline, MergeRound};
pub use orchestrator::Orchestrator;
pub use replication::{ReplicaEvent, Replicator};
pub use runtime::{start, SwarmHandle, SwarmOptions};
pub use task_queue::{QueueEvent, TaskQueue};
