//! Git workspace port.
//!
//! The merge/test/retry loop drives git exclusively through this trait so
//! tests can swap in a scripted fake.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::domain::errors::DomainResult;

/// Result of merging one branch into the integration worktree.
#[derive(Debug, Clone)]
pub enum MergeOutcome {
    Merged,
    /// The merge was aborted; `detail` carries the conflict summary.
    Conflict { detail: String },
}

impl MergeOutcome {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Result of a test run in the integration worktree.
#[derive(Debug, Clone)]
pub struct TestOutcome {
    pub success: bool,
    pub output: String,
}

/// Operations the merge pipeline needs from the git backend.
#[async_trait]
pub trait GitWorkspace: Send + Sync {
    /// Default branch of the repository (`main`/`master`).
    async fn default_branch(&self) -> DomainResult<String>;

    /// Create a worktree for a subtask branched off `base`. Returns its path.
    async fn add_worktree(&self, branch: &str, base: &str) -> DomainResult<PathBuf>;

    /// Create or reset the integration worktree on a fresh `branch` cut
    /// from `base`. Returns its path.
    async fn prepare_integration_worktree(&self, branch: &str, base: &str) -> DomainResult<PathBuf>;

    /// Merge `branch` into the checkout at `worktree` with `--no-ff`.
    /// Conflicts abort the merge and report `MergeOutcome::Conflict`.
    async fn merge_branch(&self, worktree: &Path, branch: &str) -> DomainResult<MergeOutcome>;

    /// Run the test command inside the worktree, capturing combined output.
    async fn run_tests(&self, worktree: &Path, command: &str) -> DomainResult<TestOutcome>;

    /// Push `branch` to the origin remote.
    async fn push_branch(&self, worktree: &Path, branch: &str) -> DomainResult<()>;

    /// Open a pull request for `branch`; returns its URL.
    async fn create_pull_request(&self, branch: &str, title: &str, body: &str) -> DomainResult<String>;

    /// Remove a worktree (and prune bookkeeping).
    async fn remove_worktree(&self, path: &Path) -> DomainResult<()>;
}
