//! SQLite persistence layer.

pub mod agent_repo;
pub mod board_repo;
pub mod node_repo;
pub mod retry;
pub mod store;
pub mod task_repo;

pub use agent_repo::SqliteAgentRepository;
pub use board_repo::SqliteBoardRepository;
pub use node_repo::{SqliteNodeRepository, SqliteNodeStateRepository};
pub use store::{apply_migrations, open_memory_store, open_store, StoreError};
pub use task_repo::SqliteTaskRepository;
