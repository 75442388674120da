//! Board-message repository port.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::BoardMessage;

/// Repository interface for the replicated message board.
#[async_trait]
pub trait BoardRepository: Send + Sync {
    /// Insert a post. Duplicate ids are ignored; returns `true` when the
    /// row was new.
    async fn insert(&self, message: &BoardMessage) -> DomainResult<bool>;

    /// Most recent posts, newest first.
    async fn list_recent(&self, limit: usize) -> DomainResult<Vec<BoardMessage>>;

    /// Records with `lamport_ts` strictly greater than the watermark.
    async fn since(&self, lamport_ts: u64) -> DomainResult<Vec<BoardMessage>>;

    async fn max_lamport_ts(&self) -> DomainResult<u64>;
}
