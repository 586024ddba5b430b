//! Typed error hierarchy for kiln.
//!
//! Four top-level enums cover the subsystems:
//! - `OrchestratorError`: slot state machine and scheduling loop failures
//! - `TrackerError`: task store lookups and updates
//! - `IntegrationError`: merge coordinator infrastructure failures
//! - `SnapshotError`: snapshot persistence failures

use thiserror::Error;

use crate::orchestrator::SlotPhase;

/// Errors from the orchestrator subsystem.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid slot transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: SlotPhase,
        to: SlotPhase,
    },

    #[error("Task {task_id} already occupies a slot")]
    SlotOccupied { task_id: String },

    #[error("Project {project_id} is not registered")]
    UnknownProject { project_id: String },

    #[error("Project {project_id} is locked by another kiln instance ({path})")]
    ProjectLocked {
        project_id: String,
        path: std::path::PathBuf,
    },

    #[error("Failed to spawn {kind} worker: {source}")]
    SpawnFailed {
        kind: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Integration(#[from] IntegrationError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the task store.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Task {id} not found")]
    TaskNotFound { id: String },

    #[error("Task store lock poisoned")]
    LockPoisoned,

    #[error("Failed to persist task store at {path}: {source}")]
    PersistFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid task data: {0}")]
    Invalid(String),
}

/// Errors from the merge coordinator that are not plain conflicts.
///
/// Conflicts are an expected outcome and are reported through
/// `IntegrationOutcome::Requeue`, not through this type.
#[derive(Debug, Error)]
pub enum IntegrationError {
    #[error("Failed to commit outstanding work in {path}: {source}")]
    CommitFailed {
        path: std::path::PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to refresh trunk '{trunk}': {source}")]
    TrunkRefreshFailed {
        trunk: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Git {operation} failed for branch {branch}: {source}")]
    Git {
        operation: &'static str,
        branch: String,
        #[source]
        source: anyhow::Error,
    },

}

/// Errors from snapshot persistence.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Failed to write snapshot at {path}: {source}")]
    WriteFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove snapshot at {path}: {source}")]
    RemoveFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
}
