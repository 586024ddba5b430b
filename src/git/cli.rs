use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{GitStep, InProgressOp, PushResult, Worktree, WorktreeManager, branch_name, diff, slugify};

/// Stage everything except kiln's own state directory.
const STAGE_ALL: [&str; 5] = ["add", "-A", "--", ".", ":(exclude).kiln"];

/// `WorktreeManager` backed by the `git` command line.
pub struct GitCli {
    repo_root: PathBuf,
    trunk: String,
    remote: Option<String>,
    worktrees_dir: PathBuf,
}

impl GitCli {
    pub fn new(repo_root: &Path, trunk: &str, remote: Option<&str>) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            trunk: trunk.to_string(),
            remote: remote.map(String::from),
            worktrees_dir: repo_root.join(".kiln").join("worktrees"),
        }
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> Result<Output> {
        debug!(dir = %dir.display(), args = ?args, "git");
        Command::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_EDITOR", "true")
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to run git {}", args.join(" ")))
    }

    /// Run git and fail with its stderr on non-zero exit.
    async fn git_ok(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let output = self.git(dir, args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("git {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool> {
        let refname = format!("refs/heads/{}", branch);
        let output = self
            .git(&self.repo_root, &["rev-parse", "--verify", "--quiet", &refname])
            .await?;
        Ok(output.status.success())
    }

    async fn unmerged_files(&self, dir: &Path) -> Result<Vec<String>> {
        let out = self
            .git_ok(dir, &["diff", "--name-only", "--diff-filter=U"])
            .await?;
        Ok(out.lines().map(str::to_string).filter(|l| !l.is_empty()).collect())
    }

    /// Interpret a failed conflict-capable command: conflicts become
    /// `GitStep::Conflict`, anything else is an error.
    async fn conflict_or_error(&self, dir: &Path, what: &str, output: &Output) -> Result<GitStep> {
        if output.status.success() {
            return Ok(GitStep::Clean);
        }
        let files = self.unmerged_files(dir).await?;
        if files.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("git {} failed: {}", what, stderr.trim());
        }
        Ok(GitStep::Conflict { files })
    }

    async fn git_path_exists(&self, dir: &Path, name: &str) -> Result<bool> {
        let rel = self.git_ok(dir, &["rev-parse", "--git-path", name]).await?;
        let path = PathBuf::from(&rel);
        let path = if path.is_absolute() { path } else { dir.join(path) };
        Ok(path.exists())
    }

    fn upstream_ref(&self) -> Option<String> {
        self.remote.as_ref().map(|r| format!("{}/{}", r, self.trunk))
    }
}

#[async_trait]
impl WorktreeManager for GitCli {
    fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    fn trunk(&self) -> &str {
        &self.trunk
    }

    async fn create_worktree(&self, task_id: &str) -> Result<Worktree> {
        let branch = branch_name(task_id);
        let path = self.worktrees_dir.join(slugify(task_id, 60));

        if path.join(".git").exists() {
            debug!(path = %path.display(), "reusing existing worktree");
            return Ok(Worktree { path, branch });
        }

        tokio::fs::create_dir_all(&self.worktrees_dir)
            .await
            .context("Failed to create worktrees directory")?;
        let path_str = path
            .to_str()
            .context("Worktree path contains invalid UTF-8")?;

        if self.branch_exists(&branch).await? {
            self.git_ok(&self.repo_root, &["worktree", "add", path_str, &branch])
                .await
                .context("Failed to attach worktree to preserved branch")?;
        } else {
            self.git_ok(
                &self.repo_root,
                &["worktree", "add", "-b", &branch, path_str, &self.trunk],
            )
            .await
            .context("Failed to create worktree")?;
        }
        Ok(Worktree { path, branch })
    }

    async fn remove_worktree(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            self.git_ok(&self.repo_root, &["worktree", "prune"]).await?;
            return Ok(());
        }
        let path_str = path.to_str().context("Worktree path contains invalid UTF-8")?;
        self.git_ok(&self.repo_root, &["worktree", "remove", "--force", path_str])
            .await?;
        Ok(())
    }

    async fn delete_branch(&self, branch: &str) -> Result<()> {
        if !self.branch_exists(branch).await? {
            return Ok(());
        }
        self.git_ok(&self.repo_root, &["branch", "-D", branch]).await?;
        Ok(())
    }

    async fn commit_all(&self, dir: &Path, message: &str) -> Result<bool> {
        self.git_ok(dir, &STAGE_ALL).await?;
        let staged = self.git(dir, &["diff", "--cached", "--quiet"]).await?;
        if staged.status.success() {
            return Ok(false);
        }
        self.git_ok(dir, &["commit", "--no-verify", "-m", message]).await?;
        Ok(true)
    }

    async fn refresh_trunk(&self) -> Result<()> {
        let (Some(remote), Some(upstream)) = (self.remote.as_deref(), self.upstream_ref()) else {
            return Ok(());
        };
        self.git_ok(&self.repo_root, &["fetch", remote, &self.trunk]).await?;
        let ff = self
            .git(&self.repo_root, &["merge", "--ff-only", &upstream])
            .await?;
        if !ff.status.success() {
            // Local trunk carries unpushed merges; the next push reconciles.
            warn!(
                trunk = %self.trunk,
                stderr = %String::from_utf8_lossy(&ff.stderr).trim(),
                "trunk cannot fast-forward from upstream"
            );
        }
        Ok(())
    }

    async fn rebase_onto_trunk(&self, worktree: &Path) -> Result<GitStep> {
        let output = self.git(worktree, &["rebase", &self.trunk]).await?;
        self.conflict_or_error(worktree, "rebase", &output).await
    }

    async fn continue_rebase(&self, dir: &Path) -> Result<GitStep> {
        self.git_ok(dir, &STAGE_ALL).await?;
        let output = self.git(dir, &["rebase", "--continue"]).await?;
        self.conflict_or_error(dir, "rebase --continue", &output).await
    }

    async fn abort_rebase(&self, dir: &Path) -> Result<()> {
        self.git_ok(dir, &["rebase", "--abort"]).await?;
        Ok(())
    }

    async fn merge_into_trunk(&self, branch: &str, message: &str) -> Result<GitStep> {
        let head = self
            .git_ok(&self.repo_root, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await?;
        if head != self.trunk {
            anyhow::bail!(
                "main checkout is on '{}', expected trunk '{}'",
                head,
                self.trunk
            );
        }
        let output = self
            .git(&self.repo_root, &["merge", "--no-ff", "-m", message, branch])
            .await?;
        self.conflict_or_error(&self.repo_root, "merge", &output).await
    }

    async fn continue_merge(&self) -> Result<GitStep> {
        self.git_ok(&self.repo_root, &STAGE_ALL).await?;
        let files = self.unmerged_files(&self.repo_root).await?;
        if !files.is_empty() {
            return Ok(GitStep::Conflict { files });
        }
        self.git_ok(&self.repo_root, &["commit", "--no-edit", "--no-verify"])
            .await?;
        Ok(GitStep::Clean)
    }

    async fn abort_merge(&self) -> Result<()> {
        self.git_ok(&self.repo_root, &["merge", "--abort"]).await?;
        Ok(())
    }

    async fn in_progress_operation(&self, dir: &Path) -> Result<Option<InProgressOp>> {
        if self.git_path_exists(dir, "rebase-merge").await?
            || self.git_path_exists(dir, "rebase-apply").await?
        {
            return Ok(Some(InProgressOp::Rebase));
        }
        if self.git_path_exists(dir, "MERGE_HEAD").await? {
            return Ok(Some(InProgressOp::Merge));
        }
        Ok(None)
    }

    async fn push_trunk(&self) -> Result<PushResult> {
        let Some(remote) = self.remote.as_deref() else {
            return Ok(PushResult::Skipped);
        };
        let output = self
            .git(&self.repo_root, &["push", remote, &self.trunk])
            .await?;
        if output.status.success() {
            return Ok(PushResult::Pushed);
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("rejected") || stderr.contains("non-fast-forward") || stderr.contains("fetch first") {
            return Ok(PushResult::Rejected { detail: stderr });
        }
        anyhow::bail!("git push failed: {}", stderr)
    }

    async fn pull_rebase_trunk(&self) -> Result<GitStep> {
        let Some(remote) = self.remote.as_deref() else {
            return Ok(GitStep::Clean);
        };
        let output = self
            .git(&self.repo_root, &["pull", "--rebase", remote, &self.trunk])
            .await?;
        self.conflict_or_error(&self.repo_root, "pull --rebase", &output).await
    }

    async fn branch_diff(&self, branch: &str) -> Result<String> {
        let root = self.repo_root.clone();
        let trunk = self.trunk.clone();
        let branch = branch.to_string();
        tokio::task::spawn_blocking(move || diff::branch_patch(&root, &trunk, &branch))
            .await
            .context("diff task panicked")?
    }

    async fn changed_files(&self, branch: &str) -> Result<Vec<PathBuf>> {
        let root = self.repo_root.clone();
        let trunk = self.trunk.clone();
        let branch = branch.to_string();
        tokio::task::spawn_blocking(move || diff::branch_files(&root, &trunk, &branch))
            .await
            .context("diff task panicked")?
    }
}
