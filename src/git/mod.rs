//! Branch and worktree management.
//!
//! Every task works in its own worktree on its own branch. The main checkout
//! at `repo_root` stays on trunk for the lifetime of the process and is only
//! mutated by the merge coordinator while it holds the integration lock.

pub mod cli;
pub mod diff;

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;

pub use cli::GitCli;

/// Outcome of a git step that can stop on conflicts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitStep {
    Clean,
    Conflict { files: Vec<String> },
}

impl GitStep {
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Clean)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushResult {
    Pushed,
    /// Upstream trunk moved; a pull-rebase is needed before pushing again.
    Rejected { detail: String },
    /// No remote configured.
    Skipped,
}

/// A half-finished git operation left in a checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InProgressOp {
    Rebase,
    Merge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worktree {
    pub path: PathBuf,
    pub branch: String,
}

/// Abstraction over branch/worktree primitives for testability.
/// Real implementation: `GitCli`. Tests use in-memory fakes.
#[async_trait]
pub trait WorktreeManager: Send + Sync {
    fn repo_root(&self) -> &Path;

    fn trunk(&self) -> &str;

    /// Create (or reuse) the isolated worktree for a task. An existing branch
    /// from an earlier attempt is checked out rather than recreated.
    async fn create_worktree(&self, task_id: &str) -> Result<Worktree>;

    /// Remove a worktree. Removing a missing worktree succeeds.
    async fn remove_worktree(&self, path: &Path) -> Result<()>;

    /// Delete a branch. Deleting a missing branch succeeds.
    async fn delete_branch(&self, branch: &str) -> Result<()>;

    /// Stage and commit everything in `dir`. Returns whether a commit was made.
    async fn commit_all(&self, dir: &Path, message: &str) -> Result<bool>;

    /// Fast-forward local trunk from upstream.
    async fn refresh_trunk(&self) -> Result<()>;

    async fn rebase_onto_trunk(&self, worktree: &Path) -> Result<GitStep>;

    async fn continue_rebase(&self, dir: &Path) -> Result<GitStep>;

    async fn abort_rebase(&self, dir: &Path) -> Result<()>;

    /// Merge `branch` into trunk in the main checkout.
    async fn merge_into_trunk(&self, branch: &str, message: &str) -> Result<GitStep>;

    async fn continue_merge(&self) -> Result<GitStep>;

    async fn abort_merge(&self) -> Result<()>;

    async fn in_progress_operation(&self, dir: &Path) -> Result<Option<InProgressOp>>;

    async fn push_trunk(&self) -> Result<PushResult>;

    /// Pull upstream trunk into local trunk with rebase, in the main checkout.
    async fn pull_rebase_trunk(&self) -> Result<GitStep>;

    /// Unified diff of `branch` against its merge base with trunk.
    async fn branch_diff(&self, branch: &str) -> Result<String>;

    /// Files changed on `branch` relative to its merge base with trunk.
    async fn changed_files(&self, branch: &str) -> Result<Vec<PathBuf>>;
}

/// Convert text to a ref-safe slug, limited to `max_len` characters.
pub fn slugify(text: &str, max_len: usize) -> String {
    let slug: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..slug.floor_char_boundary(max_len)]
            .trim_end_matches('-')
            .to_string()
    } else {
        slug
    }
}

/// Branch used for a task. Stable across attempts so a preserved branch is
/// picked up again.
pub fn branch_name(task_id: &str) -> String {
    format!("kiln/{}", slugify(task_id, 60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify_collapses_separators() {
        assert_eq!(slugify("Fix: the  Parser!!", 40), "fix-the-parser");
        assert_eq!(slugify("kl-12", 40), "kl-12");
    }

    #[test]
    fn test_slugify_truncates_without_trailing_dash() {
        assert_eq!(slugify("abc def ghi", 4), "abc");
    }

    #[test]
    fn test_branch_name_is_stable() {
        assert_eq!(branch_name("kl-7"), "kiln/kl-7");
        assert_eq!(branch_name("kl-7"), branch_name("kl-7"));
    }
}
