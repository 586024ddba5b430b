//! Durable per-project orchestration snapshot.
//!
//! The snapshot is rewritten after every slot phase transition and is the only
//! thing read at startup to decide what to recover. A missing file means the
//! project was idle. Anything unreadable is treated the same as missing.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::SnapshotError;
use crate::orchestrator::SlotPhase;

/// Bumped whenever the on-disk layout changes incompatibly.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Resume information for one in-flight task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotSnapshot {
    pub task_id: String,
    pub phase: SlotPhase,
    pub branch: String,
    pub worktree_path: PathBuf,
    #[serde(default)]
    pub worker_pid: Option<u32>,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub phase_started_at: DateTime<Utc>,
}

/// Running totals for a project since the orchestrator started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTotals {
    pub completed: u64,
    pub failed: u64,
    pub queue_depth: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub version: u32,
    pub project_id: String,
    pub slots: Vec<SlotSnapshot>,
    pub totals: RunTotals,
    pub updated_at: DateTime<Utc>,
}

impl ProjectSnapshot {
    pub fn new(project_id: &str, slots: Vec<SlotSnapshot>, totals: RunTotals) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            project_id: project_id.to_string(),
            slots,
            totals,
            updated_at: Utc::now(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.slots.is_empty()
    }
}

pub struct SnapshotStore {
    path: PathBuf,
    project_id: String,
}

impl SnapshotStore {
    pub fn new(path: PathBuf, project_id: &str) -> Self {
        Self {
            path,
            project_id: project_id.to_string(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the last snapshot.
    ///
    /// Returns `None` when the file is absent, unparsable, from another
    /// version, or belongs to another project.
    pub fn load(&self) -> Option<ProjectSnapshot> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "unreadable snapshot, treating as idle");
                return None;
            }
        };

        let snapshot: ProjectSnapshot = match serde_json::from_str(&content) {
            Ok(s) => s,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "corrupt snapshot, treating as idle");
                return None;
            }
        };

        if snapshot.version != SNAPSHOT_VERSION {
            warn!(
                found = snapshot.version,
                expected = SNAPSHOT_VERSION,
                "snapshot version mismatch, treating as idle"
            );
            return None;
        }
        if snapshot.project_id != self.project_id {
            warn!(
                found = %snapshot.project_id,
                expected = %self.project_id,
                "snapshot belongs to another project, ignoring"
            );
            return None;
        }
        Some(snapshot)
    }

    /// Write atomically: temp file, fsync, rename.
    pub fn save(&self, snapshot: &ProjectSnapshot) -> Result<(), SnapshotError> {
        let json = serde_json::to_string_pretty(snapshot)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| SnapshotError::WriteFailed {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        let write_tmp = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()
        };
        write_tmp().map_err(|source| SnapshotError::WriteFailed {
            path: tmp_path.clone(),
            source,
        })?;
        fs::rename(&tmp_path, &self.path).map_err(|source| SnapshotError::WriteFailed {
            path: self.path.clone(),
            source,
        })?;

        debug!(path = %self.path.display(), slots = snapshot.slots.len(), "snapshot written");
        Ok(())
    }

    /// Delete the snapshot file. Clearing an already-missing snapshot is fine.
    pub fn clear(&self) -> Result<(), SnapshotError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "snapshot cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SnapshotError::RemoveFailed {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Save when slots remain, otherwise delete the file.
    pub fn store(&self, snapshot: &ProjectSnapshot) -> Result<(), SnapshotError> {
        if snapshot.is_idle() {
            self.clear()
        } else {
            self.save(snapshot)
        }
    }
}
