//! Shell-out implementation of the `GitWorkspace` port.
//!
//! Worktrees live under `<data_dir>/worktrees`, one per branch, so agents
//! and the merge pipeline never trample each other's checkouts. Pull
//! requests go through the `gh` CLI.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::ports::{GitWorkspace, MergeOutcome, TestOutcome};

pub struct CommandGitWorkspace {
    repo_root: PathBuf,
    worktree_root: PathBuf,
}

impl CommandGitWorkspace {
    pub fn new(repo_root: impl Into<PathBuf>, worktree_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            worktree_root: worktree_root.into(),
        }
    }

    fn worktree_path(&self, branch: &str) -> PathBuf {
        self.worktree_root.join(branch.replace('/', "-"))
    }

    async fn git(&self, cwd: &Path, args: &[&str]) -> DomainResult<std::process::Output> {
        let output = Command::new("git")
            .current_dir(cwd)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| DomainError::GitFailed(format!("failed to spawn git {}: {e}", args.join(" "))))?;
        Ok(output)
    }

    async fn git_ok(&self, cwd: &Path, args: &[&str]) -> DomainResult<String> {
        let output = self.git(cwd, args).await?;
        if !output.status.success() {
            return Err(DomainError::GitFailed(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn branch_exists(&self, branch: &str) -> bool {
        self.git(&self.repo_root, &["show-ref", "--verify", "--quiet", &format!("refs/heads/{branch}")])
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    async fn ensure_worktree_parent(&self) -> DomainResult<()> {
        tokio::fs::create_dir_all(&self.worktree_root)
            .await
            .map_err(|e| DomainError::GitFailed(format!("failed to create worktree root: {e}")))
    }
}

#[async_trait]
impl GitWorkspace for CommandGitWorkspace {
    async fn default_branch(&self) -> DomainResult<String> {
        // Prefer the remote HEAD; fall back to whichever of main/master
        // exists locally.
        if let Ok(head) = self
            .git_ok(&self.repo_root, &["symbolic-ref", "refs/remotes/origin/HEAD"])
            .await
        {
            if let Some(branch) = head.strip_prefix("refs/remotes/origin/") {
                return Ok(branch.to_string());
            }
        }
        for candidate in ["main", "master"] {
            if self.branch_exists(candidate).await {
                return Ok(candidate.to_string());
            }
        }
        Err(DomainError::GitFailed("could not resolve the default branch".into()))
    }

    async fn add_worktree(&self, branch: &str, base: &str) -> DomainResult<PathBuf> {
        self.ensure_worktree_parent().await?;
        let path = self.worktree_path(branch);
        let path_str = path.to_string_lossy().to_string();

        if self.branch_exists(branch).await {
            debug!(branch, "branch exists, reusing for worktree");
            self.git_ok(&self.repo_root, &["worktree", "add", &path_str, branch]).await?;
        } else {
            self.git_ok(&self.repo_root, &["worktree", "add", "-b", branch, &path_str, base])
                .await?;
        }
        info!(branch, path = %path.display(), "worktree created");
        Ok(path)
    }

    async fn prepare_integration_worktree(&self, branch: &str, base: &str) -> DomainResult<PathBuf> {
        self.ensure_worktree_parent().await?;
        let path = self.worktree_path(branch);
        let path_str = path.to_string_lossy().to_string();

        // A stale integration worktree from a previous round is discarded
        // wholesale; the branch is recut from base.
        if path.exists() {
            let removed = self
                .git(&self.repo_root, &["worktree", "remove", "--force", &path_str])
                .await?;
            if !removed.status.success() {
                warn!(path = %path.display(), "stale worktree removal failed, deleting directory");
                let _ = tokio::fs::remove_dir_all(&path).await;
                let _ = self.git(&self.repo_root, &["worktree", "prune"]).await;
            }
        }

        self.git_ok(&self.repo_root, &["worktree", "add", "-B", branch, &path_str, base])
            .await?;
        info!(branch, base, path = %path.display(), "integration worktree ready");
        Ok(path)
    }

    async fn merge_branch(&self, worktree: &Path, branch: &str) -> DomainResult<MergeOutcome> {
        let output = self
            .git(worktree, &["merge", "--no-ff", "--no-edit", branch])
            .await?;

        if output.status.success() {
            debug!(branch, "merged cleanly");
            return Ok(MergeOutcome::Merged);
        }

        let detail = format!(
            "{}\n{}",
            String::from_utf8_lossy(&output.stdout).trim(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
        warn!(branch, "merge conflict, aborting merge");
        let _ = self.git(worktree, &["merge", "--abort"]).await;
        Ok(MergeOutcome::Conflict { detail: detail.trim().to_string() })
    }

    async fn run_tests(&self, worktree: &Path, command: &str) -> DomainResult<TestOutcome> {
        let output = Command::new("sh")
            .current_dir(worktree)
            .arg("-c")
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| DomainError::GitFailed(format!("failed to spawn test command: {e}")))?;

        let combined = format!(
            "{}\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        Ok(TestOutcome {
            success: output.status.success(),
            output: combined.trim().to_string(),
        })
    }

    async fn push_branch(&self, worktree: &Path, branch: &str) -> DomainResult<()> {
        self.git_ok(worktree, &["push", "-u", "origin", branch]).await?;
        Ok(())
    }

    async fn create_pull_request(&self, branch: &str, title: &str, body: &str) -> DomainResult<String> {
        let output = Command::new("gh")
            .current_dir(&self.repo_root)
            .args(["pr", "create", "--head", branch, "--title", title, "--body", body])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| DomainError::GitFailed(format!("failed to spawn gh: {e}")))?;

        if !output.status.success() {
            return Err(DomainError::GitFailed(format!(
                "gh pr create failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        // gh prints the PR URL on the last stdout line.
        let stdout = String::from_utf8_lossy(&output.stdout);
        let url = stdout
            .lines()
            .rev()
            .find(|l| l.starts_with("http"))
            .unwrap_or_default()
            .to_string();
        Ok(url)
    }

    async fn remove_worktree(&self, path: &Path) -> DomainResult<()> {
        let path_str = path.to_string_lossy().to_string();
        let output = self
            .git(&self.repo_root, &["worktree", "remove", "--force", &path_str])
            .await?;
        if !output.status.success() {
            let _ = tokio::fs::remove_dir_all(path).await;
            let _ = self.git(&self.repo_root, &["worktree", "prune"]).await;
        }
        Ok(())
    }
}
