//! In-memory fakes of every orchestrator collaborator.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use kiln::archive::{SessionArchive, SessionRecord};
use kiln::events::OrchestratorEvent;
use kiln::git::{GitStep, InProgressOp, PushResult, Worktree, WorktreeManager, branch_name};
use kiln::orchestrator::{
    Collaborators, OrchestratorConfig, ProjectOrchestrator, TestOutcome, TestRunner,
};
use kiln::tracker::{MemoryTaskStore, NewTask, Task, TaskStore, TaskUpdate};
use kiln::worker::{
    ProcessProbe, RESULT_FILE, WorkerExit, WorkerHandle, WorkerKind, WorkerRequest, WorkerSpawner,
};

pub const PROJECT: &str = "demo";

/// One ordered record of side effects, shared across fakes so tests can
/// assert the order of git, worker and tracker operations.
#[derive(Clone, Default)]
pub struct OpLog(Arc<Mutex<Vec<String>>>);

impl OpLog {
    pub fn push(&self, op: String) {
        self.0.lock().unwrap().push(op);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Index of the first entry starting with `prefix`.
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.entries().iter().position(|op| op.starts_with(prefix))
    }
}

// ---------------------------------------------------------------------------
// Git
// ---------------------------------------------------------------------------

#[derive(Default)]
struct GitScript {
    rebase: VecDeque<GitStep>,
    continue_rebase: VecDeque<GitStep>,
    merge: VecDeque<GitStep>,
    pull: VecDeque<GitStep>,
    push: VecDeque<PushResult>,
}

pub struct FakeGit {
    root: PathBuf,
    ops: OpLog,
    branches: Mutex<HashSet<String>>,
    in_progress: Mutex<HashMap<PathBuf, InProgressOp>>,
    script: Mutex<GitScript>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl FakeGit {
    pub fn new(root: &Path, ops: OpLog) -> Self {
        Self {
            root: root.to_path_buf(),
            ops,
            branches: Mutex::new(HashSet::new()),
            in_progress: Mutex::new(HashMap::new()),
            script: Mutex::new(GitScript::default()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.entries()
    }

    pub fn has_op(&self, prefix: &str) -> bool {
        self.ops().iter().any(|op| op.starts_with(prefix))
    }

    pub fn count_ops(&self, prefix: &str) -> usize {
        self.ops().iter().filter(|op| op.starts_with(prefix)).count()
    }

    pub fn has_branch(&self, branch: &str) -> bool {
        self.branches.lock().unwrap().contains(branch)
    }

    pub fn add_branch(&self, branch: &str) {
        self.branches.lock().unwrap().insert(branch.to_string());
    }

    pub fn set_in_progress(&self, dir: &Path, op: InProgressOp) {
        self.in_progress.lock().unwrap().insert(dir.to_path_buf(), op);
    }

    pub fn script_rebase(&self, step: GitStep) {
        self.script.lock().unwrap().rebase.push_back(step);
    }

    pub fn script_continue_rebase(&self, step: GitStep) {
        self.script.lock().unwrap().continue_rebase.push_back(step);
    }

    pub fn script_merge(&self, step: GitStep) {
        self.script.lock().unwrap().merge.push_back(step);
    }

    pub fn script_pull(&self, step: GitStep) {
        self.script.lock().unwrap().pull.push_back(step);
    }

    pub fn script_push(&self, result: PushResult) {
        self.script.lock().unwrap().push.push_back(result);
    }

    /// Highest number of trunk-mutating operations seen running at once.
    pub fn max_concurrent_trunk_ops(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn log(&self, op: String) {
        self.ops.push(op);
    }

    async fn trunk_op(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn conflict_marks(&self, dir: &Path, step: &GitStep, op: InProgressOp) {
        if !step.is_clean() {
            self.set_in_progress(dir, op);
        }
    }
}

#[async_trait]
impl WorktreeManager for FakeGit {
    fn repo_root(&self) -> &Path {
        &self.root
    }

    fn trunk(&self) -> &str {
        "main"
    }

    async fn create_worktree(&self, task_id: &str) -> Result<Worktree> {
        let branch = branch_name(task_id);
        let path = self.root.join(".kiln/worktrees").join(task_id);
        std::fs::create_dir_all(&path)?;
        self.branches.lock().unwrap().insert(branch.clone());
        self.log(format!("create_worktree {}", task_id));
        Ok(Worktree { path, branch })
    }

    async fn remove_worktree(&self, path: &Path) -> Result<()> {
        let _ = std::fs::remove_dir_all(path);
        self.log(format!("remove_worktree {}", path.display()));
        Ok(())
    }

    async fn delete_branch(&self, branch: &str) -> Result<()> {
        self.branches.lock().unwrap().remove(branch);
        self.log(format!("delete_branch {}", branch));
        Ok(())
    }

    async fn commit_all(&self, _dir: &Path, message: &str) -> Result<bool> {
        self.log(format!("commit {}", message));
        Ok(true)
    }

    async fn refresh_trunk(&self) -> Result<()> {
        self.log("refresh_trunk".to_string());
        Ok(())
    }

    async fn rebase_onto_trunk(&self, worktree: &Path) -> Result<GitStep> {
        let step = self.script.lock().unwrap().rebase.pop_front().unwrap_or(GitStep::Clean);
        self.conflict_marks(worktree, &step, InProgressOp::Rebase);
        self.log("rebase".to_string());
        Ok(step)
    }

    async fn continue_rebase(&self, dir: &Path) -> Result<GitStep> {
        let step = self
            .script
            .lock()
            .unwrap()
            .continue_rebase
            .pop_front()
            .unwrap_or(GitStep::Clean);
        if step.is_clean() {
            self.in_progress.lock().unwrap().remove(dir);
        }
        self.log("continue_rebase".to_string());
        Ok(step)
    }

    async fn abort_rebase(&self, dir: &Path) -> Result<()> {
        self.in_progress.lock().unwrap().remove(dir);
        self.log("abort_rebase".to_string());
        Ok(())
    }

    async fn merge_into_trunk(&self, branch: &str, _message: &str) -> Result<GitStep> {
        self.trunk_op().await;
        let step = self.script.lock().unwrap().merge.pop_front().unwrap_or(GitStep::Clean);
        let root = self.root.clone();
        self.conflict_marks(&root, &step, InProgressOp::Merge);
        self.log(format!("merge {}", branch));
        Ok(step)
    }

    async fn continue_merge(&self) -> Result<GitStep> {
        self.in_progress.lock().unwrap().remove(&self.root);
        self.log("continue_merge".to_string());
        Ok(GitStep::Clean)
    }

    async fn abort_merge(&self) -> Result<()> {
        self.in_progress.lock().unwrap().remove(&self.root);
        self.log("abort_merge".to_string());
        Ok(())
    }

    async fn in_progress_operation(&self, dir: &Path) -> Result<Option<InProgressOp>> {
        Ok(self.in_progress.lock().unwrap().get(dir).copied())
    }

    async fn push_trunk(&self) -> Result<PushResult> {
        self.trunk_op().await;
        let result = self
            .script
            .lock()
            .unwrap()
            .push
            .pop_front()
            .unwrap_or(PushResult::Pushed);
        self.log("push".to_string());
        Ok(result)
    }

    async fn pull_rebase_trunk(&self) -> Result<GitStep> {
        self.trunk_op().await;
        let step = self.script.lock().unwrap().pull.pop_front().unwrap_or(GitStep::Clean);
        let root = self.root.clone();
        self.conflict_marks(&root, &step, InProgressOp::Rebase);
        self.log("pull_rebase".to_string());
        Ok(step)
    }

    async fn branch_diff(&self, branch: &str) -> Result<String> {
        if self.has_branch(branch) {
            Ok(format!("diff --git a/src/lib.rs b/src/lib.rs\n+// work on {}\n", branch))
        } else {
            Ok(String::new())
        }
    }

    async fn changed_files(&self, branch: &str) -> Result<Vec<PathBuf>> {
        if self.has_branch(branch) {
            Ok(vec![PathBuf::from("src/lib.rs")])
        } else {
            Ok(Vec::new())
        }
    }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Script {
    /// Result file `success` with the summary, exit 0.
    Success(String),
    /// Result file `failure` with the summary, exit 0.
    Failure(String),
    Approve,
    Reject(Vec<String>),
    /// Exit 0 without writing a result file.
    Silent,
    /// Exit with a code and no result file.
    Exit(i32),
    /// Never print, and exit only when killed.
    Hang,
}

#[derive(Default)]
struct WorkerScripts {
    coder: VecDeque<Script>,
    reviewer: VecDeque<Script>,
    merger: VecDeque<Script>,
    coder_default: Option<Script>,
}

#[derive(Default)]
pub struct FakeWorkers {
    scripts: Mutex<WorkerScripts>,
    requests: Mutex<Vec<WorkerRequest>>,
    next_pid: AtomicU32,
    ops: OpLog,
}

impl FakeWorkers {
    pub fn new(ops: OpLog) -> Self {
        Self {
            ops,
            ..Self::default()
        }
    }

    pub fn script(&self, kind: WorkerKind, script: Script) {
        let mut scripts = self.scripts.lock().unwrap();
        match kind {
            WorkerKind::Coder => scripts.coder.push_back(script),
            WorkerKind::Reviewer => scripts.reviewer.push_back(script),
            WorkerKind::Merger => scripts.merger.push_back(script),
        }
    }

    /// Coder behavior once the scripted queue is empty.
    pub fn coder_default(&self, script: Script) {
        self.scripts.lock().unwrap().coder_default = Some(script);
    }

    pub fn requests(&self) -> Vec<WorkerRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_of(&self, kind: WorkerKind) -> Vec<WorkerRequest> {
        self.requests().into_iter().filter(|r| r.kind == kind).collect()
    }

    fn next_script(&self, kind: WorkerKind) -> Script {
        let mut scripts = self.scripts.lock().unwrap();
        match kind {
            WorkerKind::Coder => scripts
                .coder
                .pop_front()
                .or_else(|| scripts.coder_default.clone())
                .unwrap_or_else(|| Script::Success("implemented".to_string())),
            WorkerKind::Reviewer => scripts.reviewer.pop_front().unwrap_or(Script::Approve),
            WorkerKind::Merger => scripts
                .merger
                .pop_front()
                .unwrap_or_else(|| Script::Success("resolved".to_string())),
        }
    }
}

fn write_result(dir: &Path, json: serde_json::Value) {
    let path = dir.join(RESULT_FILE);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, json.to_string()).unwrap();
}

#[async_trait]
impl WorkerSpawner for FakeWorkers {
    async fn spawn(&self, request: WorkerRequest) -> Result<WorkerHandle> {
        let script = self.next_script(request.kind);
        let dir = request.working_dir.clone();
        self.requests.lock().unwrap().push(request.clone());

        let code = match &script {
            Script::Success(summary) => {
                write_result(&dir, serde_json::json!({"status": "success", "summary": summary}));
                Some(0)
            }
            Script::Failure(summary) => {
                write_result(&dir, serde_json::json!({"status": "failure", "summary": summary}));
                Some(0)
            }
            Script::Approve => {
                write_result(&dir, serde_json::json!({"status": "approved"}));
                Some(0)
            }
            Script::Reject(issues) => {
                write_result(&dir, serde_json::json!({"status": "rejected", "issues": issues}));
                Some(0)
            }
            Script::Silent => Some(0),
            Script::Exit(code) => Some(*code),
            Script::Hang => None,
        };

        let pid = 10_000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let kill = CancellationToken::new();
        match code {
            Some(code) => {
                let _ = out_tx.send(format!("{} working on {}", request.kind, request.task_id));
                let _ = exit_tx.send(WorkerExit { code: Some(code) });
            }
            None => {
                let killed = kill.clone();
                let ops = self.ops.clone();
                let name = format!("kill {} {}", request.kind, request.task_id);
                tokio::spawn(async move {
                    killed.cancelled().await;
                    ops.push(name);
                    let _ = exit_tx.send(WorkerExit { code: None });
                });
            }
        }
        Ok(WorkerHandle::new(Some(pid), out_rx, exit_rx, kill))
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Task store the orchestrator sees: logs closes into the shared [`OpLog`]
/// and can be told to fail them.
pub struct TrackedTasks {
    inner: Arc<MemoryTaskStore>,
    ops: OpLog,
    close_failures: AtomicUsize,
}

impl TrackedTasks {
    /// Fail the next `n` calls to `close_task`.
    pub fn fail_close(&self, n: usize) {
        self.close_failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl TaskStore for TrackedTasks {
    async fn list_tasks(&self, project: &str) -> Result<Vec<Task>> {
        self.inner.list_tasks(project).await
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        self.inner.get_task(id).await
    }

    async fn create_task(&self, project: &str, task: NewTask) -> Result<Task> {
        self.inner.create_task(project, task).await
    }

    async fn update_task(&self, id: &str, update: TaskUpdate) -> Result<Task> {
        self.inner.update_task(id, update).await
    }

    async fn close_task(&self, id: &str, reason: &str) -> Result<Task> {
        let failing = self
            .close_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            self.ops.push(format!("close_failed {}", id));
            anyhow::bail!("tracker unavailable");
        }
        self.ops.push(format!("close {}", id));
        self.inner.close_task(id, reason).await
    }

    async fn list_ready(&self, project: &str) -> Result<Vec<Task>> {
        self.inner.list_ready(project).await
    }

    async fn blockers_closed(&self, id: &str) -> Result<bool> {
        self.inner.blockers_closed(id).await
    }

    async fn attempt_count(&self, id: &str) -> Result<u32> {
        self.inner.attempt_count(id).await
    }

    async fn set_attempt_count(&self, id: &str, count: u32) -> Result<()> {
        self.inner.set_attempt_count(id, count).await
    }

    async fn add_label(&self, id: &str, label: &str) -> Result<()> {
        self.inner.add_label(id, label).await
    }

    async fn remove_label(&self, id: &str, label: &str) -> Result<()> {
        self.inner.remove_label(id, label).await
    }

    async fn add_comment(&self, id: &str, author: &str, body: &str) -> Result<()> {
        self.inner.add_comment(id, author, body).await
    }

    async fn delete_project(&self, project: &str) -> Result<usize> {
        self.inner.delete_project(project).await
    }
}

// ---------------------------------------------------------------------------
// Tests, archive, probe
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeTests {
    outcomes: Mutex<VecDeque<TestOutcome>>,
    runs: AtomicUsize,
}

impl FakeTests {
    pub fn fail_next(&self, summary: &str) {
        self.outcomes.lock().unwrap().push_back(TestOutcome {
            passed: false,
            summary: summary.to_string(),
        });
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TestRunner for FakeTests {
    async fn run(&self, _worktree: &Path) -> Result<TestOutcome> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(TestOutcome {
                passed: true,
                summary: "ok".to_string(),
            }))
    }
}

#[derive(Default)]
pub struct FakeArchive {
    records: Mutex<Vec<SessionRecord>>,
}

impl FakeArchive {
    pub fn records(&self) -> Vec<SessionRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionArchive for FakeArchive {
    async fn record(&self, record: SessionRecord) -> Result<PathBuf> {
        let path = PathBuf::from(format!("{}.json", record.id));
        self.records.lock().unwrap().push(record);
        Ok(path)
    }
}

#[derive(Default)]
pub struct FakeProbe {
    alive: Mutex<HashSet<u32>>,
}

impl FakeProbe {
    pub fn set_alive(&self, pid: u32, alive: bool) {
        let mut set = self.alive.lock().unwrap();
        if alive {
            set.insert(pid);
        } else {
            set.remove(&pid);
        }
    }
}

impl ProcessProbe for FakeProbe {
    fn is_alive(&self, pid: u32) -> bool {
        self.alive.lock().unwrap().contains(&pid)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub dir: TempDir,
    pub ops: OpLog,
    pub tasks: Arc<MemoryTaskStore>,
    pub tracked: Arc<TrackedTasks>,
    pub git: Arc<FakeGit>,
    pub workers: Arc<FakeWorkers>,
    pub tests: Arc<FakeTests>,
    pub archive: Arc<FakeArchive>,
    pub probe: Arc<FakeProbe>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(MemoryTaskStore::new())
    }

    pub fn with_store(store: MemoryTaskStore) -> Self {
        let dir = TempDir::new().unwrap();
        Self::in_dir(dir, store)
    }

    pub fn in_dir(dir: TempDir, store: MemoryTaskStore) -> Self {
        let ops = OpLog::default();
        let tasks = Arc::new(store);
        let tracked = Arc::new(TrackedTasks {
            inner: Arc::clone(&tasks),
            ops: ops.clone(),
            close_failures: AtomicUsize::new(0),
        });
        let git = Arc::new(FakeGit::new(dir.path(), ops.clone()));
        Self {
            dir,
            ops: ops.clone(),
            tasks,
            tracked,
            git,
            workers: Arc::new(FakeWorkers::new(ops)),
            tests: Arc::new(FakeTests::default()),
            archive: Arc::new(FakeArchive::default()),
            probe: Arc::new(FakeProbe::default()),
        }
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.path().join(".kiln/snapshot.json")
    }

    pub fn config(&self) -> OrchestratorConfig {
        OrchestratorConfig::new(PROJECT, self.snapshot_path())
            .with_inactivity_timeout(Duration::from_secs(5))
            .with_recovery_poll(Duration::from_millis(10))
    }

    pub fn orchestrator(&self, config: OrchestratorConfig) -> Arc<ProjectOrchestrator> {
        ProjectOrchestrator::new(
            config,
            Collaborators {
                tasks: self.tracked.clone(),
                git: self.git.clone(),
                workers: self.workers.clone(),
                tests: self.tests.clone(),
                archive: self.archive.clone(),
                probe: self.probe.clone(),
            },
        )
    }

    pub async fn add(&self, task: NewTask) -> Task {
        self.tasks.create_task(PROJECT, task).await.unwrap()
    }

    pub async fn task(&self, id: &str) -> Task {
        self.tasks.get_task(id).await.unwrap().unwrap()
    }

    pub async fn comments(&self, id: &str) -> Vec<String> {
        self.task(id).await.comments.into_iter().map(|c| c.body).collect()
    }
}

/// Everything emitted so far.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<OrchestratorEvent>) -> Vec<OrchestratorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
