use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::testing::TestOutcome;
use crate::errors::OrchestratorError;
use crate::git::Worktree;
use crate::snapshot::SlotSnapshot;

/// Lifecycle of one in-flight task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotPhase {
    Assigned,
    Coding,
    Testing,
    Review,
    Merging,
    Complete,
    Failed,
}

impl SlotPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assigned => "assigned",
            Self::Coding => "coding",
            Self::Testing => "testing",
            Self::Review => "review",
            Self::Merging => "merging",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Valid edges: the forward pipeline, any non-terminal phase to
    /// `failed`, and `failed` back to `coding` for an in-slot retry.
    pub fn can_transition_to(&self, to: SlotPhase) -> bool {
        use SlotPhase::*;
        matches!(
            (self, to),
            (Assigned, Coding)
                | (Coding, Testing)
                | (Testing, Review)
                | (Review, Merging)
                | (Merging, Complete)
                | (Failed, Coding)
        ) || (!self.is_terminal() && to == Failed)
    }
}

impl fmt::Display for SlotPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-memory state of an orchestration slot. Only the fields in
/// [`SlotSnapshot`] survive a restart.
#[derive(Debug, Clone)]
pub struct Slot {
    pub task_id: String,
    pub phase: SlotPhase,
    pub attempt: u32,
    pub worktree: Worktree,
    pub worker_pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub phase_started_at: DateTime<Utc>,
    /// Why the previous attempt failed; fed into the next coding prompt.
    pub retry_context: Option<String>,
    pub review_issues: Vec<String>,
    pub summary: String,
    pub log: String,
    pub diff: String,
    pub changed_files: Vec<PathBuf>,
    pub test_outcome: Option<TestOutcome>,
}

impl Slot {
    pub fn new(task_id: &str, worktree: Worktree, attempt: u32) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.to_string(),
            phase: SlotPhase::Assigned,
            attempt,
            worktree,
            worker_pid: None,
            started_at: now,
            phase_started_at: now,
            retry_context: None,
            review_issues: Vec::new(),
            summary: String::new(),
            log: String::new(),
            diff: String::new(),
            changed_files: Vec::new(),
            test_outcome: None,
        }
    }

    pub fn from_snapshot(snapshot: &SlotSnapshot) -> Self {
        Self {
            task_id: snapshot.task_id.clone(),
            phase: snapshot.phase,
            attempt: snapshot.attempt,
            worktree: Worktree {
                path: snapshot.worktree_path.clone(),
                branch: snapshot.branch.clone(),
            },
            worker_pid: snapshot.worker_pid,
            started_at: snapshot.started_at,
            phase_started_at: snapshot.phase_started_at,
            retry_context: None,
            review_issues: Vec::new(),
            summary: String::new(),
            log: String::new(),
            diff: String::new(),
            changed_files: Vec::new(),
            test_outcome: None,
        }
    }

    pub fn to_snapshot(&self) -> SlotSnapshot {
        SlotSnapshot {
            task_id: self.task_id.clone(),
            phase: self.phase,
            branch: self.worktree.branch.clone(),
            worktree_path: self.worktree.path.clone(),
            worker_pid: self.worker_pid,
            attempt: self.attempt,
            started_at: self.started_at,
            phase_started_at: self.phase_started_at,
        }
    }

    /// Move to `to`, returning the phase left behind.
    pub fn transition(&mut self, to: SlotPhase) -> Result<SlotPhase, OrchestratorError> {
        let from = self.phase;
        if !from.can_transition_to(to) {
            return Err(OrchestratorError::InvalidTransition {
                task_id: self.task_id.clone(),
                from,
                to,
            });
        }
        self.phase = to;
        self.phase_started_at = Utc::now();
        self.worker_pid = None;
        Ok(from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> Slot {
        Slot::new(
            "kl-1",
            Worktree {
                path: PathBuf::from("/tmp/wt/kl-1"),
                branch: "kiln/kl-1".into(),
            },
            1,
        )
    }

    #[test]
    fn test_forward_pipeline_is_valid() {
        let mut s = slot();
        for to in [
            SlotPhase::Coding,
            SlotPhase::Testing,
            SlotPhase::Review,
            SlotPhase::Merging,
            SlotPhase::Complete,
        ] {
            s.transition(to).unwrap();
        }
        assert_eq!(s.phase, SlotPhase::Complete);
    }

    #[test]
    fn test_any_live_phase_can_fail() {
        for from in [
            SlotPhase::Assigned,
            SlotPhase::Coding,
            SlotPhase::Testing,
            SlotPhase::Review,
            SlotPhase::Merging,
        ] {
            assert!(from.can_transition_to(SlotPhase::Failed), "{}", from);
        }
        assert!(!SlotPhase::Complete.can_transition_to(SlotPhase::Failed));
        assert!(!SlotPhase::Failed.can_transition_to(SlotPhase::Failed));
    }

    #[test]
    fn test_skipping_phases_is_rejected() {
        let mut s = slot();
        let err = s.transition(SlotPhase::Merging).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));
        assert_eq!(s.phase, SlotPhase::Assigned);
    }

    #[test]
    fn test_failed_slot_retries_into_coding() {
        let mut s = slot();
        s.transition(SlotPhase::Coding).unwrap();
        s.worker_pid = Some(99);
        s.transition(SlotPhase::Failed).unwrap();
        assert!(s.worker_pid.is_none());
        assert_eq!(s.transition(SlotPhase::Coding).unwrap(), SlotPhase::Failed);
    }

    #[test]
    fn test_snapshot_roundtrip_keeps_location() {
        let mut s = slot();
        s.transition(SlotPhase::Coding).unwrap();
        s.worker_pid = Some(1234);
        let restored = Slot::from_snapshot(&s.to_snapshot());
        assert_eq!(restored.phase, SlotPhase::Coding);
        assert_eq!(restored.worker_pid, Some(1234));
        assert_eq!(restored.worktree, s.worktree);
    }

    #[test]
    fn test_phase_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&SlotPhase::Merging).unwrap(), "\"merging\"");
        assert_eq!(SlotPhase::Review.to_string(), "review");
    }
}
