//! External worker processes: coder, reviewer and merger.
//!
//! A worker is anything that can be spawned with a prompt in a working
//! directory, streams output while it runs, and exits. Structured results are
//! exchanged through a JSON file the worker writes before exiting.

pub mod process;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::timer::InactivityTimer;

pub use process::ProcessSpawner;

/// Location of the result file relative to the worker's working directory.
pub const RESULT_FILE: &str = ".kiln/result.json";

/// How long a killed worker gets to exit before it is abandoned.
pub const STOP_GRACE: Duration = Duration::from_secs(10);

/// Cap on the log text retained per worker run.
const MAX_LOG_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Coder,
    Reviewer,
    Merger,
}

impl WorkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coder => "coder",
            Self::Reviewer => "reviewer",
            Self::Merger => "merger",
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub kind: WorkerKind,
    pub task_id: String,
    pub prompt: String,
    pub working_dir: PathBuf,
    pub model: Option<String>,
}

/// Terminal status of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// `None` when killed by a signal or when the exit could not be observed.
    pub code: Option<i32>,
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn describe(&self) -> String {
        match self.code {
            Some(code) => format!("worker exited with status {}", code),
            None => "worker terminated without an exit status".to_string(),
        }
    }
}

/// A running worker.
pub struct WorkerHandle {
    pub pid: Option<u32>,
    /// Output chunks as they arrive. Closes when the worker's streams close.
    pub output: mpsc::UnboundedReceiver<String>,
    /// Resolves exactly once with the exit status.
    pub exit: oneshot::Receiver<WorkerExit>,
    kill: CancellationToken,
}

/// How a supervised worker run ended.
#[derive(Debug)]
pub enum WorkerRun {
    Exited { exit: WorkerExit, log: String },
    /// No output for the whole inactivity window. The worker is still running
    /// until the caller stops it.
    TimedOut { log: String, worker: StalledWorker },
}

/// A worker that went quiet. Whatever it left on disk is untouched until
/// [`terminate`](Self::terminate) is called.
#[derive(Debug)]
pub struct StalledWorker {
    pub pid: Option<u32>,
    exit: oneshot::Receiver<WorkerExit>,
    kill: CancellationToken,
}

impl StalledWorker {
    /// Kill the worker and wait up to `grace` for it to exit.
    pub async fn terminate(self, grace: Duration) -> Option<WorkerExit> {
        self.kill.cancel();
        match tokio::time::timeout(grace, self.exit).await {
            Ok(exit) => {
                let exit = exit.unwrap_or(WorkerExit { code: None });
                debug!(pid = ?self.pid, code = ?exit.code, "stalled worker stopped");
                Some(exit)
            }
            Err(_) => {
                warn!(pid = ?self.pid, grace_secs = grace.as_secs(), "worker still running after kill");
                None
            }
        }
    }
}

impl WorkerHandle {
    pub fn new(
        pid: Option<u32>,
        output: mpsc::UnboundedReceiver<String>,
        exit: oneshot::Receiver<WorkerExit>,
        kill: CancellationToken,
    ) -> Self {
        Self {
            pid,
            output,
            exit,
            kill,
        }
    }

    pub fn kill(&self) {
        self.kill.cancel();
    }

    /// Collect output until the worker exits or goes quiet for `timeout`.
    ///
    /// Each output chunk resets the inactivity timer. A quiet worker is not
    /// killed here; the caller gets it back in [`WorkerRun::TimedOut`].
    pub async fn supervise(mut self, timeout: Duration) -> WorkerRun {
        let mut timer = InactivityTimer::new(timeout);
        let mut log = String::new();
        let mut output_open = true;

        loop {
            tokio::select! {
                chunk = self.output.recv(), if output_open => match chunk {
                    Some(chunk) => {
                        timer.touch();
                        append_log(&mut log, &chunk);
                    }
                    None => output_open = false,
                },
                exit = &mut self.exit => {
                    timer.cancel();
                    // Drain anything buffered before the exit was reported
                    while let Ok(chunk) = self.output.try_recv() {
                        append_log(&mut log, &chunk);
                    }
                    let exit = exit.unwrap_or(WorkerExit { code: None });
                    debug!(pid = ?self.pid, code = ?exit.code, "worker exited");
                    return WorkerRun::Exited { exit, log };
                }
                _ = timer.fired() => break,
            }
        }

        warn!(pid = ?self.pid, timeout_secs = timeout.as_secs(), "worker inactive");
        WorkerRun::TimedOut {
            log,
            worker: StalledWorker {
                pid: self.pid,
                exit: self.exit,
                kill: self.kill,
            },
        }
    }
}

fn append_log(log: &mut String, chunk: &str) {
    if log.len() >= MAX_LOG_BYTES {
        return;
    }
    log.push_str(chunk);
    if !chunk.ends_with('\n') {
        log.push('\n');
    }
}

/// Spawns worker processes.
/// Real implementation: `ProcessSpawner`. Tests use scripted fakes.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self, request: WorkerRequest) -> Result<WorkerHandle>;
}

/// Structured result a worker leaves in [`RESULT_FILE`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResult {
    /// `success`/`failure` for coders and mergers, `approved`/`rejected` for
    /// reviewers.
    pub status: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewVerdict {
    Approved,
    Rejected { issues: Vec<String> },
}

impl WorkerResult {
    pub fn is_success(&self) -> bool {
        self.status.eq_ignore_ascii_case("success")
    }

    pub fn verdict(&self) -> Option<ReviewVerdict> {
        if self.status.eq_ignore_ascii_case("approved") {
            Some(ReviewVerdict::Approved)
        } else if self.status.eq_ignore_ascii_case("rejected") {
            let mut issues = self.issues.clone();
            if issues.is_empty() && !self.summary.is_empty() {
                issues.push(self.summary.clone());
            }
            Some(ReviewVerdict::Rejected { issues })
        } else {
            None
        }
    }
}

/// Read the result file. Missing or malformed files yield `None`.
pub fn read_result_file(dir: &Path) -> Option<WorkerResult> {
    let path = dir.join(RESULT_FILE);
    let content = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&content) {
        Ok(result) => Some(result),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "malformed worker result file");
            None
        }
    }
}

/// Remove a stale result file before spawning a new worker.
pub fn clear_result_file(dir: &Path) -> Result<()> {
    match std::fs::remove_file(dir.join(RESULT_FILE)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Review outcome from the result file; absent or malformed means rejected.
pub fn review_verdict(dir: &Path) -> ReviewVerdict {
    read_result_file(dir)
        .and_then(|r| r.verdict())
        .unwrap_or_else(|| ReviewVerdict::Rejected {
            issues: vec!["review produced no verdict".to_string()],
        })
}

/// Checks whether a process from an earlier run is still alive.
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probe using `kill(pid, 0)`.
pub struct LibcProbe;

impl ProcessProbe for LibcProbe {
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // SAFETY: signal 0 performs permission and existence checks only.
        let rc = unsafe { libc::kill(pid, 0) };
        if rc == 0 {
            return true;
        }
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}
