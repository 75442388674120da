//! Inbound MCP surface: JSON-RPC tools agents use to report task progress.

pub mod handlers;
pub mod http_server;
pub mod types;

pub use handlers::McpState;
pub use http_server::serve;
