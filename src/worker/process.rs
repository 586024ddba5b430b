use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{WorkerExit, WorkerHandle, WorkerRequest, WorkerSpawner};

/// Spawns workers as local processes.
///
/// The command line is `<command> <args...> [--model <model>] <prompt>`.
/// The worker kind and task id are exported as `KILN_WORKER_KIND` and
/// `KILN_TASK_ID`. Workers outlive the orchestrator process so a restart can
/// adopt them.
pub struct ProcessSpawner {
    command: String,
    args: Vec<String>,
}

impl ProcessSpawner {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self, request: WorkerRequest) -> Result<WorkerHandle> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        if let Some(model) = &request.model {
            cmd.args(["--model", model]);
        }
        cmd.arg(&request.prompt)
            .current_dir(&request.working_dir)
            .env("KILN_WORKER_KIND", request.kind.as_str())
            .env("KILN_TASK_ID", &request.task_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {} worker '{}'", request.kind, self.command))?;
        let pid = child.id();
        info!(kind = %request.kind, task = %request.task_id, pid = ?pid, "worker spawned");

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, out_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, out_tx);
        }

        let (exit_tx, exit_rx) = oneshot::channel();
        let kill = CancellationToken::new();
        let kill_signal = kill.clone();
        let kind = request.kind;
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_signal.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!(kind = %kind, pid = ?pid, error = %e, "failed to kill worker");
                    }
                    child.wait().await
                }
            };
            let exit = match status {
                Ok(status) => WorkerExit {
                    code: status.code(),
                },
                Err(e) => {
                    warn!(kind = %kind, pid = ?pid, error = %e, "failed to wait for worker");
                    WorkerExit { code: None }
                }
            };
            debug!(kind = %kind, pid = ?pid, code = ?exit.code, "worker process finished");
            let _ = exit_tx.send(exit);
        });

        Ok(WorkerHandle::new(pid, out_rx, exit_rx, kill))
    }
}
