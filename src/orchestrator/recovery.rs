//! Startup recovery and the blocked-task sweep.
//!
//! On start the last snapshot is reconciled against reality. A slot whose
//! worker is still alive is adopted; any other slot is treated as crashed:
//! its work is archived and discarded and the task goes back to the backlog.
//! Every step is safe to repeat, so a crash during recovery only means the
//! next start finishes the job.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::engine::{ProjectOrchestrator, Resume, guard};
use super::slot::{Slot, SlotPhase};
use crate::archive::{SessionRecord, SessionStatus};
use crate::errors::OrchestratorError;
use crate::events::OrchestratorEvent;
use crate::git::InProgressOp;
use crate::snapshot::SlotSnapshot;
use crate::tracker::{Task, TaskStatus, TaskUpdate};
use crate::worker::WorkerKind;

/// What a recovery pass did, by task id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub adopted: Vec<String>,
    pub requeued: Vec<String>,
    pub finished: Vec<String>,
    pub orphans: Vec<String>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.adopted.is_empty()
            && self.requeued.is_empty()
            && self.finished.is_empty()
            && self.orphans.is_empty()
    }
}

impl ProjectOrchestrator {
    /// Reconcile the persisted snapshot with worker processes and the tracker.
    pub async fn recover(self: &Arc<Self>) -> Result<RecoveryReport, OrchestratorError> {
        let project = self.config.project_id.clone();
        let mut report = RecoveryReport::default();
        self.repair_main_checkout().await;

        if let Some(snapshot) = self.snapshots.load() {
            info!(project = %project, slots = snapshot.slots.len(), "recovering from snapshot");
            {
                let mut state = guard(&self.state);
                state.totals = snapshot.totals;
                state.slots = snapshot
                    .slots
                    .iter()
                    .map(|s| (s.task_id.clone(), s.clone()))
                    .collect();
            }

            for snap in snapshot.slots {
                let task = self.deps.tasks.get_task(&snap.task_id).await?;
                let closed = task.as_ref().is_some_and(|t| t.status == TaskStatus::Closed);
                let alive = snap.worker_pid.is_some_and(|pid| self.deps.probe.is_alive(pid));

                match task {
                    _ if closed || snap.phase == SlotPhase::Complete => {
                        self.finish_closed(&snap).await;
                        report.finished.push(snap.task_id);
                    }
                    Some(task) if alive => {
                        let slot = Slot::from_snapshot(&snap);
                        self.notifier.emit(OrchestratorEvent::SlotRecovered {
                            task_id: snap.task_id.clone(),
                            phase: snap.phase,
                            adopted: true,
                        });
                        info!(project = %project, task = %snap.task_id, phase = %snap.phase, pid = ?snap.worker_pid, "adopting slot");
                        self.spawn_adopted(slot, task).await;
                        report.adopted.push(snap.task_id);
                    }
                    _ => {
                        self.requeue_crashed(&snap).await;
                        report.requeued.push(snap.task_id);
                    }
                }
            }
        }

        report.orphans = self.sweep_orphans().await?;
        if !report.is_empty() {
            info!(
                project = %project,
                adopted = report.adopted.len(),
                requeued = report.requeued.len(),
                finished = report.finished.len(),
                orphans = report.orphans.len(),
                "recovery complete"
            );
        }
        Ok(report)
    }

    async fn spawn_adopted(self: &Arc<Self>, slot: Slot, task: Task) {
        let resume = resume_point(slot.phase);
        let pid = slot.worker_pid;
        let this = Arc::clone(self);
        self.spawn_task(async move {
            if let Some(pid) = pid
                && !this.wait_for_exit(pid).await
            {
                return;
            }
            this.drive_slot(slot, task, resume).await;
        })
        .await;
    }

    /// Poll until `pid` is gone. Returns false when shutdown interrupts.
    async fn wait_for_exit(&self, pid: u32) -> bool {
        while self.deps.probe.is_alive(pid) {
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = tokio::time::sleep(self.config.recovery_poll) => {}
            }
        }
        debug!(project = %self.config.project_id, pid, "adopted worker exited");
        true
    }

    /// The merged work is already on trunk; only local leftovers remain.
    async fn finish_closed(&self, snap: &SlotSnapshot) {
        let slot = Slot::from_snapshot(snap);
        self.forget_slot(&snap.task_id);
        self.cleanup_git(&slot, false).await;
        info!(project = %self.config.project_id, task = %snap.task_id, "cleared slot of closed task");
    }

    /// Discard a slot whose worker died with the previous process.
    async fn requeue_crashed(&self, snap: &SlotSnapshot) {
        let project = self.config.project_id.as_str();
        let slot = Slot::from_snapshot(snap);
        self.forget_slot(&snap.task_id);

        let diff = match self.deps.git.branch_diff(&snap.branch).await {
            Ok(diff) => diff,
            Err(e) => {
                warn!(project, task = %snap.task_id, error = %e, "could not capture partial diff");
                String::new()
            }
        };
        let mut record = SessionRecord::new(project, &snap.task_id, WorkerKind::Coder, &snap.branch);
        record.status = SessionStatus::Recovered;
        record.attempt = snap.attempt;
        record.started_at = snap.started_at;
        record.summary = format!("interrupted in phase {}", snap.phase);
        record.diff = diff;
        self.archive(record).await;

        self.cleanup_git(&slot, false).await;

        self.comment(
            &snap.task_id,
            &format!(
                "Recovered after restart: attempt {} was in phase {} with no live worker. \
                 Partial work was archived and the task requeued.",
                snap.attempt, snap.phase
            ),
        )
        .await;
        if let Err(e) = self
            .deps
            .tasks
            .update_task(&snap.task_id, TaskUpdate::requeue())
            .await
        {
            warn!(project, task = %snap.task_id, error = %e, "failed to requeue crashed task");
        }

        guard(&self.state).totals.failed += 1;
        if let Err(e) = self.persist() {
            warn!(project, error = %e, "failed to persist snapshot");
        }
        warn!(project, task = %snap.task_id, phase = %snap.phase, "requeued crashed slot");
        self.notifier.emit(OrchestratorEvent::SlotRecovered {
            task_id: snap.task_id.clone(),
            phase: snap.phase,
            adopted: false,
        });
    }

    /// Release tasks claimed by this agent that have no slot behind them.
    async fn sweep_orphans(&self) -> Result<Vec<String>, OrchestratorError> {
        let project = self.config.project_id.as_str();
        let tasks = self.deps.tasks.list_tasks(project).await?;
        let mut released = Vec::new();
        for task in tasks {
            let ours = task.assignee.as_deref() == Some(self.config.agent_name.as_str());
            if task.status != TaskStatus::InProgress || !ours {
                continue;
            }
            if guard(&self.state).slots.contains_key(&task.id) {
                continue;
            }
            self.deps.tasks.update_task(&task.id, TaskUpdate::requeue()).await?;
            self.comment(&task.id, "Released claim left behind by a previous run")
                .await;
            warn!(project, task = %task.id, "released orphaned claim");
            released.push(task.id);
        }
        Ok(released)
    }

    /// An interrupted merge in the main checkout would break every later one.
    async fn repair_main_checkout(&self) {
        let git = &self.deps.git;
        let root = git.repo_root().to_path_buf();
        let outcome = match git.in_progress_operation(&root).await {
            Ok(Some(InProgressOp::Merge)) => git.abort_merge().await,
            Ok(Some(InProgressOp::Rebase)) => git.abort_rebase(&root).await,
            Ok(None) => return,
            Err(e) => {
                debug!(project = %self.config.project_id, error = %e, "could not inspect main checkout");
                return;
            }
        };
        match outcome {
            Ok(()) => warn!(project = %self.config.project_id, "aborted interrupted operation in main checkout"),
            Err(e) => warn!(project = %self.config.project_id, error = %e, "failed to clean main checkout"),
        }
    }

    /// Unblock technical failures whose cooldown has passed. Human-feedback
    /// blocks are left alone.
    pub async fn auto_retry_sweep(&self) -> Result<usize, OrchestratorError> {
        let project = self.config.project_id.as_str();
        let now = Utc::now();
        let mut retried = 0;
        for task in self.deps.tasks.list_tasks(project).await? {
            if !self.config.backoff.auto_retry_eligible(&task, now) {
                continue;
            }
            let reason = task.block_reason.clone().unwrap_or_default();
            self.clear_block(&task.id, Some(now)).await?;
            self.comment(
                &task.id,
                &format!("Automatically retrying after cooldown. Previous block: {}", reason),
            )
            .await;
            info!(project, task = %task.id, "auto-retrying blocked task");
            self.notifier.emit(OrchestratorEvent::TaskRequeued {
                task_id: task.id.clone(),
                reason: "auto-retry after cooldown".to_string(),
            });
            retried += 1;
        }
        if retried > 0 {
            self.nudge();
        }
        Ok(retried)
    }
}

/// Where an adopted slot resumes once its worker has exited.
fn resume_point(phase: SlotPhase) -> Resume {
    match phase {
        SlotPhase::Assigned | SlotPhase::Failed | SlotPhase::Complete => Resume::Fresh,
        SlotPhase::Coding => Resume::AfterCoder,
        SlotPhase::Testing => Resume::Testing,
        SlotPhase::Review => Resume::AfterReviewer,
        SlotPhase::Merging => Resume::Merging,
    }
}
