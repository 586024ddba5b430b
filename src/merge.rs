//! Serialized integration of task branches into trunk.
//!
//! Every trunk-mutating sequence (refresh, rebase, merge, push) runs while
//! holding the integration lock, a FIFO-fair `tokio::sync::Mutex`. Pushes run
//! in the background under a separate push mutex so the next task can start
//! integrating while the previous push is still talking to the remote.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::errors::IntegrationError;
use crate::events::{Notifier, OrchestratorEvent};
use crate::git::{GitStep, PushResult, WorktreeManager};
use crate::orchestrator::prompt;
use crate::tracker::TaskStore;
use crate::worker::{
    STOP_GRACE, WorkerKind, WorkerRequest, WorkerRun, WorkerSpawner, clear_result_file,
    read_result_file,
};

const CLOSE_ATTEMPTS: u32 = 3;
const CLOSE_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct IntegrationRequest {
    pub task_id: String,
    pub title: String,
    /// Written as the task's close reason.
    pub summary: String,
    pub branch: String,
    pub worktree_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrationOutcome {
    /// Branch is on trunk. `close_error` is set when the task could not be
    /// closed afterwards; the merge stands regardless.
    Merged {
        merged_at: DateTime<Utc>,
        close_error: Option<String>,
    },
    /// Conflicts could not be resolved; the branch is intact and the task
    /// should go back to the backlog.
    Requeue { reason: String },
}

/// Which half-finished operation a conflict belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConflictSite {
    Rebase,
    Merge,
    PushRebase,
}

impl ConflictSite {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Rebase => "rebase",
            Self::Merge => "merge",
            Self::PushRebase => "pull-rebase",
        }
    }
}

pub struct MergeCoordinator {
    project_id: String,
    git: Arc<dyn WorktreeManager>,
    tasks: Arc<dyn TaskStore>,
    workers: Arc<dyn WorkerSpawner>,
    notifier: Arc<Notifier>,
    integration: Mutex<()>,
    push_lock: Mutex<()>,
    push_pending: AtomicBool,
    pushes: StdMutex<Vec<JoinHandle<()>>>,
    merger_timeout: Duration,
    model: Option<String>,
}

impl MergeCoordinator {
    pub fn new(
        project_id: &str,
        git: Arc<dyn WorktreeManager>,
        tasks: Arc<dyn TaskStore>,
        workers: Arc<dyn WorkerSpawner>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            project_id: project_id.to_string(),
            git,
            tasks,
            workers,
            notifier,
            integration: Mutex::new(()),
            push_lock: Mutex::new(()),
            push_pending: AtomicBool::new(false),
            pushes: StdMutex::new(Vec::new()),
            merger_timeout: Duration::from_secs(600),
            model: None,
        }
    }

    pub fn with_merger_timeout(mut self, timeout: Duration) -> Self {
        self.merger_timeout = timeout;
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    /// Whether the last push failed and is waiting for the next completion.
    pub fn push_pending(&self) -> bool {
        self.push_pending.load(Ordering::SeqCst)
    }

    /// Wait for every push spawned so far.
    pub async fn wait_for_push(&self) {
        let handles: Vec<JoinHandle<()>> = match self.pushes.lock() {
            Ok(mut pushes) => pushes.drain(..).collect(),
            Err(_) => return,
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(project = %self.project_id, error = %e, "push job panicked");
            }
        }
    }

    /// Integrate a reviewed branch into trunk and close its task.
    ///
    /// Conflicts are resolved by a merger worker at most once per step; an
    /// unresolved conflict aborts the operation and yields
    /// [`IntegrationOutcome::Requeue`] with the branch untouched.
    pub async fn integrate(
        self: &Arc<Self>,
        request: &IntegrationRequest,
    ) -> Result<IntegrationOutcome, IntegrationError> {
        let task = request.task_id.as_str();

        self.git
            .commit_all(
                &request.worktree_path,
                &format!("kiln: outstanding work for {}", task),
            )
            .await
            .map_err(|source| IntegrationError::CommitFailed {
                path: request.worktree_path.clone(),
                source,
            })?;

        // Let an in-flight push land before touching trunk again
        drop(self.push_lock.lock().await);

        let outcome = {
            let _guard = self.integration.lock().await;
            debug!(project = %self.project_id, task, "integration lock acquired");
            self.integrate_locked(request).await?
        };

        if matches!(outcome, IntegrationOutcome::Merged { .. }) {
            self.spawn_push();
        }
        Ok(outcome)
    }

    async fn integrate_locked(
        self: &Arc<Self>,
        request: &IntegrationRequest,
    ) -> Result<IntegrationOutcome, IntegrationError> {
        let task = request.task_id.as_str();
        let branch = request.branch.as_str();

        self.git
            .refresh_trunk()
            .await
            .map_err(|source| IntegrationError::TrunkRefreshFailed {
                trunk: self.git.trunk().to_string(),
                source,
            })?;

        let rebase = match self.git.rebase_onto_trunk(&request.worktree_path).await {
            Ok(step) => step,
            Err(source) => {
                self.abort_quietly(ConflictSite::Rebase, &request.worktree_path).await;
                return Err(IntegrationError::Git {
                    operation: "rebase",
                    branch: branch.to_string(),
                    source,
                });
            }
        };
        if let GitStep::Conflict { files } = rebase
            && !self
                .resolve_conflict(ConflictSite::Rebase, request, &request.worktree_path, files.clone())
                .await
        {
            self.abort_quietly(ConflictSite::Rebase, &request.worktree_path).await;
            return Ok(IntegrationOutcome::Requeue {
                reason: format!("rebase conflict in {}", files.join(", ")),
            });
        }

        let message = format!("Merge {}: {}", branch, request.title);
        let repo_root = self.git.repo_root().to_path_buf();
        let merge = match self.git.merge_into_trunk(branch, &message).await {
            Ok(step) => step,
            Err(source) => {
                self.abort_quietly(ConflictSite::Merge, &repo_root).await;
                return Err(IntegrationError::Git {
                    operation: "merge",
                    branch: branch.to_string(),
                    source,
                });
            }
        };
        if let GitStep::Conflict { files } = merge
            && !self
                .resolve_conflict(ConflictSite::Merge, request, &repo_root, files.clone())
                .await
        {
            self.abort_quietly(ConflictSite::Merge, &repo_root).await;
            return Ok(IntegrationOutcome::Requeue {
                reason: format!("merge conflict in {}", files.join(", ")),
            });
        }

        let merged_at = Utc::now();
        let close_error = self.close_merged(task, &request.summary).await.err();
        match &close_error {
            None => info!(project = %self.project_id, task, branch, "merged into trunk and closed"),
            Some(e) => error!(project = %self.project_id, task, branch, error = %e, "merged into trunk but task is still open"),
        }
        Ok(IntegrationOutcome::Merged {
            merged_at,
            close_error,
        })
    }

    /// Close a task whose branch is already on trunk, retrying transient
    /// tracker errors.
    async fn close_merged(&self, task: &str, summary: &str) -> Result<(), String> {
        let mut last = String::new();
        for attempt in 1..=CLOSE_ATTEMPTS {
            match self.tasks.close_task(task, summary).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    warn!(project = %self.project_id, task, attempt, error = %e, "failed to close merged task");
                    last = format!("{:#}", e);
                }
            }
            if attempt < CLOSE_ATTEMPTS {
                tokio::time::sleep(CLOSE_RETRY_DELAY * attempt).await;
            }
        }
        Err(last)
    }

    /// Run the merger worker once in `dir`, then continue the interrupted
    /// operation. Returns whether the operation completed.
    async fn resolve_conflict(
        &self,
        site: ConflictSite,
        request: &IntegrationRequest,
        dir: &Path,
        files: Vec<String>,
    ) -> bool {
        let task = request.task_id.as_str();
        info!(project = %self.project_id, task, operation = site.as_str(), files = ?files, "conflict, running merger");

        match self.run_merger(site, &request.task_id, &request.title, dir, &files).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(project = %self.project_id, task, operation = site.as_str(), "merger did not resolve conflict");
                return false;
            }
            Err(e) => {
                warn!(project = %self.project_id, task, operation = site.as_str(), error = %e, "merger failed to run");
                return false;
            }
        }

        let continued = match site {
            ConflictSite::Rebase | ConflictSite::PushRebase => self.git.continue_rebase(dir).await,
            ConflictSite::Merge => self.git.continue_merge().await,
        };
        match continued {
            Ok(GitStep::Clean) => true,
            Ok(GitStep::Conflict { files }) => {
                warn!(project = %self.project_id, task, operation = site.as_str(), files = ?files, "conflicts remain after merger");
                false
            }
            Err(e) => {
                warn!(project = %self.project_id, task, operation = site.as_str(), error = %e, "continue failed after merger");
                false
            }
        }
    }

    async fn run_merger(
        &self,
        site: ConflictSite,
        task_id: &str,
        title: &str,
        dir: &Path,
        files: &[String],
    ) -> Result<bool> {
        clear_result_file(dir)?;
        let handle = self
            .workers
            .spawn(WorkerRequest {
                kind: WorkerKind::Merger,
                task_id: task_id.to_string(),
                prompt: prompt::merger_prompt(task_id, title, site.as_str(), files),
                working_dir: dir.to_path_buf(),
                model: self.model.clone(),
            })
            .await?;

        let resolved = match handle.supervise(self.merger_timeout).await {
            WorkerRun::Exited { exit, .. } if exit.success() => {
                read_result_file(dir).is_none_or(|r| r.is_success())
            }
            WorkerRun::Exited { exit, .. } => {
                debug!(task = task_id, code = ?exit.code, "merger exited unsuccessfully");
                false
            }
            WorkerRun::TimedOut { worker, .. } => {
                worker.terminate(STOP_GRACE).await;
                false
            }
        };
        clear_result_file(dir)?;
        Ok(resolved)
    }

    async fn abort_quietly(&self, site: ConflictSite, dir: &Path) {
        let in_progress = match self.git.in_progress_operation(dir).await {
            Ok(op) => op,
            Err(e) => {
                warn!(project = %self.project_id, dir = %dir.display(), error = %e, "could not inspect checkout state");
                return;
            }
        };
        if in_progress.is_none() {
            return;
        }
        let result = match site {
            ConflictSite::Rebase | ConflictSite::PushRebase => self.git.abort_rebase(dir).await,
            ConflictSite::Merge => self.git.abort_merge().await,
        };
        if let Err(e) = result {
            error!(project = %self.project_id, dir = %dir.display(), operation = site.as_str(), error = %e, "abort failed");
        }
    }

    fn spawn_push(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let _push = this.push_lock.lock().await;
            let _guard = this.integration.lock().await;
            this.push_with_recovery().await;
        });
        if let Ok(mut pushes) = self.pushes.lock() {
            pushes.retain(|h| !h.is_finished());
            pushes.push(handle);
        }
    }

    async fn push_with_recovery(&self) {
        let first = match self.git.push_trunk().await {
            Ok(result) => result,
            Err(e) => return self.push_failed(&format!("{:#}", e)),
        };
        let detail = match first {
            PushResult::Pushed | PushResult::Skipped => return self.push_succeeded(first),
            PushResult::Rejected { detail } => detail,
        };
        info!(project = %self.project_id, detail = %detail, "push rejected, pulling upstream trunk");

        let repo_root = self.git.repo_root().to_path_buf();
        match self.git.pull_rebase_trunk().await {
            Ok(GitStep::Clean) => {}
            Ok(GitStep::Conflict { files }) => {
                let request = IntegrationRequest {
                    task_id: "trunk".to_string(),
                    title: format!("reconcile {} with upstream", self.git.trunk()),
                    summary: String::new(),
                    branch: self.git.trunk().to_string(),
                    worktree_path: repo_root.clone(),
                };
                if !self
                    .resolve_conflict(ConflictSite::PushRebase, &request, &repo_root, files)
                    .await
                {
                    self.abort_quietly(ConflictSite::PushRebase, &repo_root).await;
                    return self.push_failed("upstream trunk conflicts with local merges");
                }
            }
            Err(e) => {
                self.abort_quietly(ConflictSite::PushRebase, &repo_root).await;
                return self.push_failed(&format!("{:#}", e));
            }
        }

        match self.git.push_trunk().await {
            Ok(PushResult::Rejected { detail }) => self.push_failed(&detail),
            Ok(result) => self.push_succeeded(result),
            Err(e) => self.push_failed(&format!("{:#}", e)),
        }
    }

    fn push_succeeded(&self, result: PushResult) {
        if result == PushResult::Pushed {
            info!(project = %self.project_id, trunk = %self.git.trunk(), "trunk pushed");
        }
        self.push_pending.store(false, Ordering::SeqCst);
    }

    fn push_failed(&self, detail: &str) {
        warn!(project = %self.project_id, detail, "push failed, will retry after next merge");
        self.push_pending.store(true, Ordering::SeqCst);
        self.notifier.emit(OrchestratorEvent::PushFailed {
            detail: detail.to_string(),
        });
    }
}
