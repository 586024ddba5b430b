//! Per-project scheduling loop and slot driver.
//!
//! A `ProjectOrchestrator` owns the slots of one project. The dispatch loop
//! wakes on nudges and watchdog ticks, selects ready tasks while slot capacity
//! is free, and hands each selected task to its own driver task. The driver
//! walks the slot through its phases and applies the backoff policy when an
//! attempt fails.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::prompt;
use super::slot::{Slot, SlotPhase};
use super::testing::TestRunner;
use crate::archive::{SessionArchive, SessionRecord, SessionStatus};
use crate::backoff::{BackoffDecision, BackoffPolicy, BlockCategory, FailureCategory, truncate_reason};
use crate::errors::{IntegrationError, OrchestratorError, SnapshotError, TrackerError};
use crate::events::{Notifier, OrchestratorEvent};
use crate::git::WorktreeManager;
use crate::merge::{IntegrationOutcome, IntegrationRequest, MergeCoordinator};
use crate::snapshot::{ProjectSnapshot, RunTotals, SlotSnapshot, SnapshotStore};
use crate::tracker::{BLOCKED_LABEL, Task, TaskStatus, TaskStore, TaskUpdate};
use crate::worker::{
    ProcessProbe, ReviewVerdict, STOP_GRACE, WorkerExit, WorkerKind, WorkerRequest, WorkerRun,
    WorkerSpawner, clear_result_file, read_result_file, review_verdict,
};

/// Settings for one project orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub project_id: String,
    /// Assignee written on claimed tasks.
    pub agent_name: String,
    pub max_concurrent_slots: usize,
    pub watchdog_interval: Duration,
    pub inactivity_timeout: Duration,
    pub recovery_poll: Duration,
    pub model: Option<String>,
    pub deploy_command: Option<String>,
    pub backoff: BackoffPolicy,
    pub snapshot_path: PathBuf,
}

impl OrchestratorConfig {
    pub fn new(project_id: &str, snapshot_path: PathBuf) -> Self {
        Self {
            project_id: project_id.to_string(),
            agent_name: "kiln".to_string(),
            max_concurrent_slots: 1,
            watchdog_interval: Duration::from_secs(60),
            inactivity_timeout: Duration::from_secs(900),
            recovery_poll: Duration::from_secs(5),
            model: None,
            deploy_command: None,
            backoff: BackoffPolicy::default(),
            snapshot_path,
        }
    }

    pub fn with_max_concurrent_slots(mut self, slots: usize) -> Self {
        self.max_concurrent_slots = slots.max(1);
        self
    }

    pub fn with_agent_name(mut self, name: &str) -> Self {
        self.agent_name = name.to_string();
        self
    }

    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    pub fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    pub fn with_recovery_poll(mut self, poll: Duration) -> Self {
        self.recovery_poll = poll;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_deploy_command(mut self, command: Option<String>) -> Self {
        self.deploy_command = command;
        self
    }
}

/// External systems the orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub tasks: Arc<dyn TaskStore>,
    pub git: Arc<dyn WorktreeManager>,
    pub workers: Arc<dyn WorkerSpawner>,
    pub tests: Arc<dyn TestRunner>,
    pub archive: Arc<dyn SessionArchive>,
    pub probe: Arc<dyn ProcessProbe>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub project_id: String,
    pub running: bool,
    pub slots: Vec<SlotSnapshot>,
    pub totals: RunTotals,
    pub push_pending: bool,
}

#[derive(Default)]
pub(super) struct EngineState {
    pub(super) slots: BTreeMap<String, SlotSnapshot>,
    pub(super) totals: RunTotals,
}

/// Why an attempt stopped short of a merge.
#[derive(Debug, Clone)]
pub(super) struct Failure {
    pub(super) category: FailureCategory,
    pub(super) reason: String,
}

impl Failure {
    pub(super) fn coding(reason: impl Into<String>) -> Self {
        Self {
            category: FailureCategory::Coding,
            reason: reason.into(),
        }
    }

    pub(super) fn merge(reason: impl Into<String>) -> Self {
        Self {
            category: FailureCategory::Merge,
            reason: reason.into(),
        }
    }
}

impl From<anyhow::Error> for Failure {
    fn from(e: anyhow::Error) -> Self {
        Self::coding(format!("{:#}", e))
    }
}

impl From<OrchestratorError> for Failure {
    fn from(e: OrchestratorError) -> Self {
        Self::coding(e.to_string())
    }
}

impl From<SnapshotError> for Failure {
    fn from(e: SnapshotError) -> Self {
        Self::coding(e.to_string())
    }
}

impl From<IntegrationError> for Failure {
    fn from(e: IntegrationError) -> Self {
        Self::merge(e.to_string())
    }
}

/// A branch that reached trunk.
#[derive(Debug)]
struct Merged {
    at: DateTime<Utc>,
    close_error: Option<String>,
}

/// Where a slot driver picks up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Resume {
    Fresh,
    AfterCoder,
    Testing,
    AfterReviewer,
    Merging,
}

#[derive(Debug, PartialEq, Eq)]
enum FailureAction {
    RetryInSlot,
    Released,
}

pub struct ProjectOrchestrator {
    pub(super) config: OrchestratorConfig,
    pub(super) deps: Collaborators,
    pub(super) merge: Arc<MergeCoordinator>,
    pub(super) snapshots: SnapshotStore,
    pub(super) notifier: Arc<Notifier>,
    pub(super) state: StdMutex<EngineState>,
    wake: Notify,
    dispatch_lock: Mutex<()>,
    pub(super) shutdown: CancellationToken,
    drivers: Mutex<JoinSet<()>>,
    loop_handle: StdMutex<Option<JoinHandle<()>>>,
    effects: StdMutex<Vec<JoinHandle<()>>>,
    reviewed_epics: StdMutex<HashSet<String>>,
}

pub(super) fn guard<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ProjectOrchestrator {
    pub fn new(config: OrchestratorConfig, deps: Collaborators) -> Arc<Self> {
        let notifier = Arc::new(Notifier::new());
        let merge = MergeCoordinator::new(
            &config.project_id,
            Arc::clone(&deps.git),
            Arc::clone(&deps.tasks),
            Arc::clone(&deps.workers),
            Arc::clone(&notifier),
        )
        .with_merger_timeout(config.inactivity_timeout)
        .with_model(config.model.clone());
        let snapshots = SnapshotStore::new(config.snapshot_path.clone(), &config.project_id);

        Arc::new(Self {
            config,
            deps,
            merge: Arc::new(merge),
            snapshots,
            notifier,
            state: StdMutex::new(EngineState::default()),
            wake: Notify::new(),
            dispatch_lock: Mutex::new(()),
            shutdown: CancellationToken::new(),
            drivers: Mutex::new(JoinSet::new()),
            loop_handle: StdMutex::new(None),
            effects: StdMutex::new(Vec::new()),
            reviewed_epics: StdMutex::new(HashSet::new()),
        })
    }

    pub fn project_id(&self) -> &str {
        &self.config.project_id
    }

    pub fn merge_coordinator(&self) -> &Arc<MergeCoordinator> {
        &self.merge
    }

    /// Recover from the last snapshot, then run the dispatch loop in the
    /// background until [`shutdown`](Self::shutdown).
    pub async fn start(self: &Arc<Self>) -> Result<super::RecoveryReport, OrchestratorError> {
        if guard(&self.loop_handle).is_some() {
            debug!(project = %self.config.project_id, "already started");
            return Ok(super::RecoveryReport::default());
        }
        let report = self.recover().await?;
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run_loop().await });
        *guard(&self.loop_handle) = Some(handle);
        Ok(report)
    }

    async fn run_loop(self: Arc<Self>) {
        let project = self.config.project_id.clone();
        info!(project = %project, slots = self.config.max_concurrent_slots, "orchestrator started");
        let mut watchdog = crate::timer::Watchdog::new(self.config.watchdog_interval);

        loop {
            if let Err(e) = self.dispatch_pass().await {
                warn!(project = %project, error = %e, "dispatch pass failed");
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = watchdog.tick() => {
                    debug!(project = %project, "watchdog tick");
                    if let Err(e) = self.auto_retry_sweep().await {
                        warn!(project = %project, error = %e, "auto-retry sweep failed");
                    }
                }
            }
        }
        info!(project = %project, "orchestrator stopped");
    }

    /// Re-trigger selection. Cheap; a pass only starts work when a slot is free.
    pub fn nudge(&self) {
        self.wake.notify_one();
    }

    /// Fill free slots from the ready list. Returns how many slots opened.
    pub async fn dispatch_pass(self: &Arc<Self>) -> Result<usize, OrchestratorError> {
        if self.shutdown.is_cancelled() {
            return Ok(0);
        }
        let _pass = self.dispatch_lock.lock().await;
        let project = self.config.project_id.as_str();

        let occupied = guard(&self.state).slots.len();
        let free = self.config.max_concurrent_slots.saturating_sub(occupied);
        if free == 0 {
            debug!(project, occupied, "no free slot");
            return Ok(0);
        }

        let ready = self.deps.tasks.list_ready(project).await?;
        guard(&self.state).totals.queue_depth = ready.len();
        if ready.is_empty() {
            debug!(project, "nothing ready");
            return Ok(0);
        }

        let mut opened = 0;
        for task in ready {
            if opened == free {
                break;
            }
            match self.deps.tasks.blockers_closed(&task.id).await {
                Ok(true) => {}
                Ok(false) => {
                    info!(project, task = %task.id, "blocker reopened since listing, skipping");
                    continue;
                }
                Err(e) => {
                    warn!(project, task = %task.id, error = %e, "could not verify blockers, skipping");
                    continue;
                }
            }
            let task_id = task.id.clone();
            match self.open_slot(task).await {
                Ok(()) => opened += 1,
                Err(e @ OrchestratorError::SlotOccupied { .. }) => debug!(project, error = %e, "skipping"),
                Err(e) => warn!(project, task = %task_id, error = %e, "failed to open slot"),
            }
        }
        Ok(opened)
    }

    async fn open_slot(self: &Arc<Self>, task: Task) -> Result<(), OrchestratorError> {
        let project = self.config.project_id.as_str();
        if guard(&self.state).slots.contains_key(&task.id) {
            return Err(OrchestratorError::SlotOccupied { task_id: task.id });
        }
        let attempt = self.deps.tasks.attempt_count(&task.id).await? + 1;
        self.deps
            .tasks
            .update_task(
                &task.id,
                TaskUpdate::default()
                    .status(TaskStatus::InProgress)
                    .assignee(Some(self.config.agent_name.clone())),
            )
            .await?;

        let worktree = match self.deps.git.create_worktree(&task.id).await {
            Ok(worktree) => worktree,
            Err(e) => {
                if let Err(undo) = self.deps.tasks.update_task(&task.id, TaskUpdate::requeue()).await {
                    error!(project, task = %task.id, error = %undo, "failed to release claim");
                }
                return Err(e.into());
            }
        };

        let slot = Slot::new(&task.id, worktree, attempt);
        self.record_slot(&slot)?;
        info!(project, task = %task.id, attempt, branch = %slot.worktree.branch, "slot opened");

        self.spawn_driver(slot, task, Resume::Fresh).await;
        Ok(())
    }

    async fn spawn_driver(self: &Arc<Self>, slot: Slot, task: Task, resume: Resume) {
        let this = Arc::clone(self);
        self.spawn_task(async move { this.drive_slot(slot, task, resume).await })
            .await;
    }

    /// Track a slot-owning task so shutdown and [`wait_for_slots`](Self::wait_for_slots) see it.
    pub(super) async fn spawn_task<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.drivers.lock().await.spawn(task);
    }

    /// Wait until every slot driver started so far, and the post-merge work
    /// it kicked off, has finished.
    pub async fn wait_for_slots(&self) {
        {
            let mut drivers = self.drivers.lock().await;
            while let Some(result) = drivers.join_next().await {
                if let Err(e) = result
                    && !e.is_cancelled()
                {
                    error!(project = %self.config.project_id, error = %e, "slot driver panicked");
                }
            }
        }
        let effects: Vec<JoinHandle<()>> = guard(&self.effects).drain(..).collect();
        for handle in effects {
            if let Err(e) = handle.await {
                warn!(project = %self.config.project_id, error = %e, "post-merge task panicked");
            }
        }
    }

    pub(super) async fn drive_slot(self: Arc<Self>, mut slot: Slot, task: Task, mut resume: Resume) {
        loop {
            match self.run_attempt(&mut slot, &task, resume).await {
                Ok(merged) => {
                    self.complete(slot, &task, merged).await;
                    break;
                }
                Err(failure) => {
                    if self.handle_failure(&mut slot, &task, failure).await == FailureAction::Released {
                        break;
                    }
                    resume = Resume::Fresh;
                }
            }
        }
        self.nudge();
    }

    async fn run_attempt(
        &self,
        slot: &mut Slot,
        task: &Task,
        resume: Resume,
    ) -> Result<Merged, Failure> {
        match resume {
            Resume::Fresh => self.run_coder(slot, task).await?,
            Resume::AfterCoder => self.evaluate_coder(slot, None)?,
            _ => {}
        }
        if matches!(resume, Resume::Fresh | Resume::AfterCoder | Resume::Testing) {
            self.run_tests(slot, task).await?;
        }
        match resume {
            Resume::AfterReviewer => self.evaluate_review(slot)?,
            Resume::Merging => self.abort_leftovers(slot).await,
            _ => self.run_review(slot, task).await?,
        }
        self.run_merge(slot, task).await
    }

    /// Enter `phase`, persisting the snapshot before announcing it.
    async fn enter(&self, slot: &mut Slot, phase: SlotPhase) -> Result<(), Failure> {
        if slot.phase == phase {
            self.record_slot(slot)?;
            return Ok(());
        }
        let from = slot.transition(phase)?;
        self.record_slot(slot)?;
        info!(
            project = %self.config.project_id,
            task = %slot.task_id,
            from = %from,
            to = %phase,
            attempt = slot.attempt,
            "phase changed"
        );
        self.notifier.emit(OrchestratorEvent::PhaseChanged {
            task_id: slot.task_id.clone(),
            from,
            to: phase,
            attempt: slot.attempt,
        });
        Ok(())
    }

    async fn run_coder(&self, slot: &mut Slot, task: &Task) -> Result<(), Failure> {
        self.enter(slot, SlotPhase::Coding).await?;
        let dir = slot.worktree.path.clone();
        clear_result_file(&dir)?;

        let request = WorkerRequest {
            kind: WorkerKind::Coder,
            task_id: task.id.clone(),
            prompt: prompt::coder_prompt(task, slot.retry_context.as_deref(), &slot.review_issues),
            working_dir: dir,
            model: self.config.model.clone(),
        };
        let handle = self
            .deps
            .workers
            .spawn(request)
            .await
            .map_err(|source| OrchestratorError::SpawnFailed {
                kind: WorkerKind::Coder.to_string(),
                source,
            })?;
        slot.worker_pid = handle.pid;
        self.record_slot(slot)?;

        match handle.supervise(self.config.inactivity_timeout).await {
            WorkerRun::TimedOut { log, worker } => {
                slot.log = log;
                // Save what the worker wrote before it is stopped
                self.commit_wip(slot).await;
                worker.terminate(STOP_GRACE).await;
                Err(Failure::coding("inactivity timeout"))
            }
            WorkerRun::Exited { exit, log } => {
                slot.log = log;
                self.evaluate_coder(slot, Some(exit))
            }
        }
    }

    /// Judge a finished coder from its exit status (when observed) and result file.
    fn evaluate_coder(&self, slot: &mut Slot, exit: Option<WorkerExit>) -> Result<(), Failure> {
        let dir = &slot.worktree.path;
        let result = read_result_file(dir);
        if let Err(e) = clear_result_file(dir) {
            warn!(task = %slot.task_id, error = %e, "failed to remove result file");
        }

        if let Some(exit) = exit
            && !exit.success()
        {
            let summary = result
                .map(|r| r.summary)
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| exit.describe());
            return Err(Failure::coding(summary));
        }
        match result {
            Some(r) if r.is_success() => {
                slot.summary = r.summary;
                Ok(())
            }
            Some(r) if !r.summary.is_empty() => Err(Failure::coding(r.summary)),
            Some(_) => Err(Failure::coding("coder reported failure")),
            None => Err(Failure::coding("coder produced no result")),
        }
    }

    async fn run_tests(&self, slot: &mut Slot, task: &Task) -> Result<(), Failure> {
        self.enter(slot, SlotPhase::Testing).await?;
        let outcome = self
            .deps
            .tests
            .run(&slot.worktree.path)
            .await
            .map_err(|e| Failure::coding(format!("test runner error: {:#}", e)))?;
        slot.test_outcome = Some(outcome.clone());
        if !outcome.passed {
            return Err(Failure::coding(format!("tests failed: {}", outcome.summary)));
        }

        let message = format!("{}: {}", task.id, task.title);
        self.deps.git.commit_all(&slot.worktree.path, &message).await?;
        self.capture_diff(slot).await;
        Ok(())
    }

    async fn capture_diff(&self, slot: &mut Slot) {
        let branch = slot.worktree.branch.clone();
        match self.deps.git.branch_diff(&branch).await {
            Ok(diff) => slot.diff = diff,
            Err(e) => warn!(task = %slot.task_id, error = %e, "failed to capture branch diff"),
        }
        match self.deps.git.changed_files(&branch).await {
            Ok(files) => slot.changed_files = files,
            Err(e) => warn!(task = %slot.task_id, error = %e, "failed to list changed files"),
        }
    }

    async fn run_review(&self, slot: &mut Slot, task: &Task) -> Result<(), Failure> {
        self.enter(slot, SlotPhase::Review).await?;
        let dir = slot.worktree.path.clone();
        clear_result_file(&dir)?;

        let request = WorkerRequest {
            kind: WorkerKind::Reviewer,
            task_id: task.id.clone(),
            prompt: prompt::reviewer_prompt(task, &slot.summary, &slot.diff),
            working_dir: dir,
            model: self.config.model.clone(),
        };
        let handle = self
            .deps
            .workers
            .spawn(request)
            .await
            .map_err(|source| OrchestratorError::SpawnFailed {
                kind: WorkerKind::Reviewer.to_string(),
                source,
            })?;
        slot.worker_pid = handle.pid;
        self.record_slot(slot)?;

        match handle.supervise(self.config.inactivity_timeout).await {
            WorkerRun::TimedOut { worker, .. } => {
                worker.terminate(STOP_GRACE).await;
                Err(Failure::coding("inactivity timeout"))
            }
            WorkerRun::Exited { .. } => self.evaluate_review(slot),
        }
    }

    fn evaluate_review(&self, slot: &mut Slot) -> Result<(), Failure> {
        let verdict = review_verdict(&slot.worktree.path);
        if let Err(e) = clear_result_file(&slot.worktree.path) {
            warn!(task = %slot.task_id, error = %e, "failed to remove result file");
        }
        match verdict {
            ReviewVerdict::Approved => {
                slot.review_issues.clear();
                Ok(())
            }
            ReviewVerdict::Rejected { issues } => {
                let reason = format!("review rejected: {}", issues.join("; "));
                slot.review_issues = issues;
                Err(Failure::coding(reason))
            }
        }
    }

    /// Abort a rebase or merge interrupted by a restart.
    async fn abort_leftovers(&self, slot: &Slot) {
        let git = &self.deps.git;
        match git.in_progress_operation(&slot.worktree.path).await {
            Ok(Some(_)) => {
                if let Err(e) = git.abort_rebase(&slot.worktree.path).await {
                    warn!(task = %slot.task_id, error = %e, "failed to abort leftover rebase");
                }
            }
            Ok(None) => {}
            Err(e) => debug!(task = %slot.task_id, error = %e, "worktree state unknown"),
        }
    }

    async fn run_merge(&self, slot: &mut Slot, task: &Task) -> Result<Merged, Failure> {
        self.enter(slot, SlotPhase::Merging).await?;
        if slot.diff.is_empty() {
            self.capture_diff(slot).await;
        }
        let summary = if slot.summary.is_empty() {
            format!("Merged {}", slot.worktree.branch)
        } else {
            slot.summary.clone()
        };
        let request = IntegrationRequest {
            task_id: task.id.clone(),
            title: task.title.clone(),
            summary,
            branch: slot.worktree.branch.clone(),
            worktree_path: slot.worktree.path.clone(),
        };
        match self.merge.integrate(&request).await? {
            IntegrationOutcome::Merged {
                merged_at,
                close_error,
            } => Ok(Merged {
                at: merged_at,
                close_error,
            }),
            IntegrationOutcome::Requeue { reason } => Err(Failure::merge(reason)),
        }
    }

    async fn commit_wip(&self, slot: &Slot) {
        let message = format!("kiln: work in progress on {} (inactivity timeout)", slot.task_id);
        if let Err(e) = self.deps.git.commit_all(&slot.worktree.path, &message).await {
            warn!(task = %slot.task_id, error = %e, "failed to commit work in progress");
        }
    }

    async fn handle_failure(&self, slot: &mut Slot, task: &Task, failure: Failure) -> FailureAction {
        let project = self.config.project_id.as_str();
        let task_id = slot.task_id.clone();
        if let Err(e) = self.enter(slot, SlotPhase::Failed).await {
            warn!(project, task = %task_id, reason = %e.reason, "could not mark slot failed");
        }

        let reason = truncate_reason(&failure.reason);
        let attempts = match self.bump_attempts(&task_id).await {
            Ok(n) => n,
            Err(e) => {
                error!(project, task = %task_id, error = %e, "failed to bump attempt counter");
                slot.attempt
            }
        };
        warn!(project, task = %task_id, attempts, category = ?failure.category, reason = %reason, "attempt failed");
        self.comment(
            &task_id,
            &format!(
                "Attempt {} failed ({}): {}",
                attempts,
                failure.category.block_category(),
                reason
            ),
        )
        .await;
        guard(&self.state).totals.failed += 1;
        self.notifier.emit(OrchestratorEvent::TaskFailed {
            task_id: task_id.clone(),
            reason: reason.clone(),
            attempts,
        });

        let status = if reason == "inactivity timeout" {
            SessionStatus::TimedOut
        } else {
            SessionStatus::Failed
        };
        self.archive(self.session_record(slot, status, &reason)).await;

        let priority = match self.deps.tasks.get_task(&task_id).await {
            Ok(Some(current)) => current.priority,
            _ => task.priority,
        };
        let keep_branch = failure.category == FailureCategory::Merge;
        match self
            .config
            .backoff
            .decide(attempts, priority, failure.category, &reason)
        {
            BackoffDecision::Retry if failure.category == FailureCategory::Coding => {
                slot.retry_context = Some(reason);
                slot.attempt = attempts + 1;
                if let Err(e) = self.record_slot(slot) {
                    warn!(project, task = %task_id, error = %e, "failed to persist retry");
                }
                info!(project, task = %task_id, attempt = slot.attempt, "retrying in slot");
                FailureAction::RetryInSlot
            }
            BackoffDecision::Retry => {
                self.release(slot, keep_branch).await;
                self.requeue(&task_id, TaskUpdate::requeue(), &reason).await;
                FailureAction::Released
            }
            BackoffDecision::Demote { new_priority } => {
                self.release(slot, keep_branch).await;
                info!(project, task = %task_id, priority = new_priority, "demoting");
                self.requeue(
                    &task_id,
                    TaskUpdate::requeue().priority(new_priority),
                    &format!("demoted to priority {} after {} attempts", new_priority, attempts),
                )
                .await;
                FailureAction::Released
            }
            BackoffDecision::Block { reason } => {
                self.release(slot, keep_branch).await;
                if let Err(e) = self.block(&task_id, &reason).await {
                    error!(project, task = %task_id, error = %e, "failed to block task");
                }
                FailureAction::Released
            }
        }
    }

    async fn bump_attempts(&self, task_id: &str) -> anyhow::Result<u32> {
        let attempts = self.deps.tasks.attempt_count(task_id).await? + 1;
        self.deps.tasks.set_attempt_count(task_id, attempts).await?;
        Ok(attempts)
    }

    async fn requeue(&self, task_id: &str, update: TaskUpdate, reason: &str) {
        if let Err(e) = self.deps.tasks.update_task(task_id, update).await {
            error!(project = %self.config.project_id, task = task_id, error = %e, "failed to requeue task");
            return;
        }
        self.notifier.emit(OrchestratorEvent::TaskRequeued {
            task_id: task_id.to_string(),
            reason: reason.to_string(),
        });
    }

    /// Mark a task blocked with a fully formatted `"<Category>: <detail>"` reason.
    pub(super) async fn block(&self, task_id: &str, reason: &str) -> anyhow::Result<()> {
        self.deps
            .tasks
            .update_task(
                task_id,
                TaskUpdate::default()
                    .status(TaskStatus::Blocked)
                    .assignee(None)
                    .block_reason(Some(reason.to_string())),
            )
            .await?;
        self.deps.tasks.add_label(task_id, BLOCKED_LABEL).await?;
        warn!(project = %self.config.project_id, task = task_id, reason, "task blocked");
        self.notifier.emit(OrchestratorEvent::TaskBlocked {
            task_id: task_id.to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Drop the worktree (and the branch unless kept) and forget the slot.
    async fn release(&self, slot: &Slot, keep_branch: bool) {
        self.cleanup_git(slot, keep_branch).await;
        self.forget_slot(&slot.task_id);
    }

    pub(super) async fn cleanup_git(&self, slot: &Slot, keep_branch: bool) {
        if let Err(e) = self.deps.git.remove_worktree(&slot.worktree.path).await {
            warn!(task = %slot.task_id, error = %e, "failed to remove worktree");
        }
        if !keep_branch
            && let Err(e) = self.deps.git.delete_branch(&slot.worktree.branch).await
        {
            warn!(task = %slot.task_id, error = %e, "failed to delete branch");
        }
    }

    pub(super) fn forget_slot(&self, task_id: &str) {
        guard(&self.state).slots.remove(task_id);
        if let Err(e) = self.persist() {
            error!(project = %self.config.project_id, task = task_id, error = %e, "failed to persist snapshot");
        }
    }

    async fn complete(self: &Arc<Self>, mut slot: Slot, task: &Task, merged: Merged) {
        let project = self.config.project_id.as_str();
        if let Err(e) = self.enter(&mut slot, SlotPhase::Complete).await {
            warn!(project, task = %slot.task_id, reason = %e.reason, "could not mark slot complete");
        }
        guard(&self.state).totals.completed += 1;
        info!(project, task = %slot.task_id, attempt = slot.attempt, "task complete");
        self.notifier.emit(OrchestratorEvent::TaskCompleted {
            task_id: slot.task_id.clone(),
            merged_at: merged.at,
        });

        // Already on trunk: park for a human rather than requeue
        if let Some(close_error) = merged.close_error {
            self.comment(
                &task.id,
                &format!(
                    "Attempt {} merged into trunk but the task could not be closed: {}",
                    slot.attempt, close_error
                ),
            )
            .await;
            let reason = BlockCategory::HumanFeedback.reason("merged into trunk, close this task");
            if let Err(e) = self.block(&task.id, &reason).await {
                error!(project, task = %task.id, error = %e, "failed to park merged task");
            }
        }

        let this = Arc::clone(self);
        let effects_slot = slot.clone();
        let effects_task = task.clone();
        let handle = tokio::spawn(async move { this.post_merge(effects_slot, effects_task).await });
        {
            let mut effects = guard(&self.effects);
            effects.retain(|h| !h.is_finished());
            effects.push(handle);
        }

        self.release(&slot, false).await;
    }

    /// Side effects of a merge. Failures here are logged and never reopen
    /// the task.
    async fn post_merge(self: Arc<Self>, slot: Slot, task: Task) {
        let summary = if slot.summary.is_empty() { "merged" } else { slot.summary.as_str() };
        self.comment(
            &task.id,
            &format!("Attempt {} merged into trunk: {}", slot.attempt, summary),
        )
        .await;
        self.archive(self.session_record(&slot, SessionStatus::Completed, summary)).await;

        if !slot.changed_files.is_empty() {
            let files: Vec<String> = slot
                .changed_files
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            info!(task = %task.id, count = files.len(), files = ?files, "changed files");
        }

        if let Some(command) = self.config.deploy_command.as_deref() {
            self.run_deploy(command, &task.id).await;
        }

        if let Some(epic_id) = task.parent() {
            self.check_epic(epic_id).await;
        }
    }

    async fn run_deploy(&self, command: &str, task_id: &str) {
        let output = tokio::process::Command::new("sh")
            .args(["-c", command])
            .current_dir(self.deps.git.repo_root())
            .env("KILN_TASK_ID", task_id)
            .output()
            .await;
        match output {
            Ok(out) if out.status.success() => info!(task = task_id, "deploy triggered"),
            Ok(out) => warn!(
                task = task_id,
                status = %out.status,
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "deploy command failed"
            ),
            Err(e) => warn!(task = task_id, error = %e, "failed to run deploy command"),
        }
    }

    /// Run a final review when the last child of an epic closes.
    async fn check_epic(&self, epic_id: &str) {
        let project = self.config.project_id.as_str();
        let tasks = match self.deps.tasks.list_tasks(project).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(project, epic = epic_id, error = %e, "epic check failed");
                return;
            }
        };
        let Some(epic) = tasks.iter().find(|t| t.id == epic_id) else {
            return;
        };
        if epic.status == TaskStatus::Closed {
            return;
        }
        let children: Vec<Task> = tasks
            .iter()
            .filter(|t| t.parent().map(String::as_str) == Some(epic_id))
            .cloned()
            .collect();
        if children.is_empty() || children.iter().any(|c| c.status != TaskStatus::Closed) {
            return;
        }
        if !guard(&self.reviewed_epics).insert(epic_id.to_string()) {
            return;
        }

        info!(project, epic = epic_id, "all children closed, running final review");
        let outcome = match self.run_epic_review(epic, &children).await {
            Ok(ReviewVerdict::Approved) => "approved".to_string(),
            Ok(ReviewVerdict::Rejected { issues }) => format!("issues: {}", issues.join("; ")),
            Err(e) => {
                warn!(project, epic = epic_id, error = %e, "final review failed to run");
                format!("review did not run: {:#}", e)
            }
        };
        self.comment(epic_id, &format!("Final review of completed epic: {}", outcome))
            .await;
        self.notifier.emit(OrchestratorEvent::EpicReady {
            epic_id: epic_id.to_string(),
        });
    }

    /// The reviewer gets its own worktree of trunk; the main checkout
    /// belongs to the merge coordinator.
    async fn run_epic_review(&self, epic: &Task, children: &[Task]) -> anyhow::Result<ReviewVerdict> {
        let worktree = self.deps.git.create_worktree(&epic.id).await?;
        let verdict = self.review_epic_in(&worktree.path, epic, children).await;
        if let Err(e) = self.deps.git.remove_worktree(&worktree.path).await {
            warn!(epic = %epic.id, error = %e, "failed to remove epic review worktree");
        }
        if let Err(e) = self.deps.git.delete_branch(&worktree.branch).await {
            warn!(epic = %epic.id, error = %e, "failed to delete epic review branch");
        }
        verdict
    }

    async fn review_epic_in(
        &self,
        dir: &Path,
        epic: &Task,
        children: &[Task],
    ) -> anyhow::Result<ReviewVerdict> {
        clear_result_file(dir)?;
        let handle = self
            .deps
            .workers
            .spawn(WorkerRequest {
                kind: WorkerKind::Reviewer,
                task_id: epic.id.clone(),
                prompt: prompt::epic_review_prompt(epic, children),
                working_dir: dir.to_path_buf(),
                model: self.config.model.clone(),
            })
            .await?;
        if let WorkerRun::TimedOut { worker, .. } = handle.supervise(self.config.inactivity_timeout).await {
            worker.terminate(STOP_GRACE).await;
        }
        Ok(review_verdict(dir))
    }

    fn session_record(&self, slot: &Slot, status: SessionStatus, summary: &str) -> SessionRecord {
        let mut record = SessionRecord::new(
            &self.config.project_id,
            &slot.task_id,
            WorkerKind::Coder,
            &slot.worktree.branch,
        );
        record.model = self.config.model.clone();
        record.attempt = slot.attempt;
        record.status = status;
        record.summary = summary.to_string();
        record.log = slot.log.clone();
        record.diff = slot.diff.clone();
        record.changed_files = slot.changed_files.clone();
        if let Some(outcome) = &slot.test_outcome {
            record.tests_passed = Some(outcome.passed);
            record.test_summary = outcome.summary.clone();
        }
        record.started_at = slot.started_at;
        record
    }

    pub(super) async fn archive(&self, record: SessionRecord) {
        let task = record.task_id.clone();
        match self.deps.archive.record(record).await {
            Ok(path) => debug!(task = %task, path = %path.display(), "session archived"),
            Err(e) => warn!(task = %task, error = %e, "failed to archive session"),
        }
    }

    pub(super) async fn comment(&self, task_id: &str, body: &str) {
        if let Err(e) = self
            .deps
            .tasks
            .add_comment(task_id, &self.config.agent_name, body)
            .await
        {
            warn!(task = task_id, error = %e, "failed to comment on task");
        }
    }

    pub(super) fn record_slot(&self, slot: &Slot) -> Result<(), SnapshotError> {
        guard(&self.state)
            .slots
            .insert(slot.task_id.clone(), slot.to_snapshot());
        self.persist()
    }

    pub(super) fn persist(&self) -> Result<(), SnapshotError> {
        let state = guard(&self.state);
        let snapshot = ProjectSnapshot::new(
            &self.config.project_id,
            state.slots.values().cloned().collect(),
            state.totals,
        );
        self.snapshots.store(&snapshot)
    }

    /// Record feedback on a task. Feedback answers a human-feedback block, so
    /// such a block is lifted and the loop nudged.
    pub async fn submit_feedback(
        &self,
        task_id: &str,
        author: &str,
        feedback: &str,
    ) -> Result<(), OrchestratorError> {
        let task = self.require_task(task_id).await?;
        self.deps.tasks.add_comment(task_id, author, feedback).await?;
        let awaiting_human = task
            .block_reason
            .as_deref()
            .and_then(BlockCategory::from_reason)
            == Some(BlockCategory::HumanFeedback);
        if task.is_blocked() && awaiting_human {
            self.clear_block(task_id, None).await?;
            info!(project = %self.config.project_id, task = task_id, "feedback received, unblocked");
        }
        self.nudge();
        Ok(())
    }

    /// Park a task until a human answers `question`.
    pub async fn request_human_feedback(
        &self,
        task_id: &str,
        question: &str,
    ) -> Result<(), OrchestratorError> {
        self.require_task(task_id).await?;
        self.comment(task_id, &format!("Needs human input: {}", question))
            .await;
        self.block(task_id, &BlockCategory::HumanFeedback.reason(question))
            .await?;
        Ok(())
    }

    /// Lift any block and return the task to the backlog.
    pub async fn unblock(&self, task_id: &str) -> Result<(), OrchestratorError> {
        let task = self.require_task(task_id).await?;
        if !task.is_blocked() {
            debug!(task = task_id, "unblock requested for task that is not blocked");
        }
        self.clear_block(task_id, None).await?;
        self.comment(task_id, "Unblocked manually").await;
        self.nudge();
        Ok(())
    }

    pub(super) async fn clear_block(
        &self,
        task_id: &str,
        auto_retry_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        self.deps.tasks.remove_label(task_id, BLOCKED_LABEL).await?;
        let mut update = TaskUpdate::requeue().block_reason(None);
        if auto_retry_at.is_some() {
            update = update.last_auto_retry(auto_retry_at);
        }
        self.deps.tasks.update_task(task_id, update).await?;
        Ok(())
    }

    async fn require_task(&self, task_id: &str) -> Result<Task, OrchestratorError> {
        self.deps
            .tasks
            .get_task(task_id)
            .await?
            .ok_or_else(|| {
                TrackerError::TaskNotFound {
                    id: task_id.to_string(),
                }
                .into()
            })
    }

    pub fn status(&self) -> OrchestratorStatus {
        let state = guard(&self.state);
        OrchestratorStatus {
            project_id: self.config.project_id.clone(),
            running: guard(&self.loop_handle).is_some() && !self.shutdown.is_cancelled(),
            slots: state.slots.values().cloned().collect(),
            totals: state.totals,
            push_pending: self.merge.push_pending(),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<OrchestratorEvent> {
        self.notifier.subscribe()
    }

    /// Stop dispatching and abort slot drivers. The snapshot is left as is so
    /// the next start recovers in-flight work.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = guard(&self.loop_handle).take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(project = %self.config.project_id, error = %e, "dispatch loop ended abnormally");
        }
        self.drivers.lock().await.abort_all();
        self.wait_for_slots().await;
        self.merge.wait_for_push().await;
        info!(project = %self.config.project_id, "shutdown complete");
    }
}
