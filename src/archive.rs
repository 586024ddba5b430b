//! Run records for finished worker sessions.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::git::slugify;
use crate::worker::WorkerKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Completed,
    Failed,
    TimedOut,
    Recovered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub project_id: String,
    pub task_id: String,
    pub worker: WorkerKind,
    pub model: Option<String>,
    pub branch: String,
    pub attempt: u32,
    pub status: SessionStatus,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub log: String,
    #[serde(default)]
    pub diff: String,
    #[serde(default)]
    pub changed_files: Vec<PathBuf>,
    pub tests_passed: Option<bool>,
    #[serde(default)]
    pub test_summary: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(project_id: &str, task_id: &str, worker: WorkerKind, branch: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id: project_id.to_string(),
            task_id: task_id.to_string(),
            worker,
            model: None,
            branch: branch.to_string(),
            attempt: 0,
            status: SessionStatus::Completed,
            summary: String::new(),
            log: String::new(),
            diff: String::new(),
            changed_files: Vec::new(),
            tests_passed: None,
            test_summary: String::new(),
            started_at: now,
            finished_at: now,
        }
    }
}

/// Long-term storage for session records.
#[async_trait]
pub trait SessionArchive: Send + Sync {
    /// Store a record; returns where it went.
    async fn record(&self, record: SessionRecord) -> Result<PathBuf>;
}

/// Writes one pretty-printed JSON file per session.
pub struct FileArchive {
    dir: PathBuf,
}

impl FileArchive {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    /// Archived records, oldest first.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.dir)
            .context("Failed to read sessions directory")?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();
        Ok(files)
    }

    pub fn load(&self, path: &Path) -> Result<SessionRecord> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read session record {}", path.display()))?;
        serde_json::from_str(&content).context("Failed to parse session record")
    }
}

#[async_trait]
impl SessionArchive for FileArchive {
    async fn record(&self, record: SessionRecord) -> Result<PathBuf> {
        let filename = format!(
            "{}_{}_{}.json",
            record.started_at.format("%Y-%m-%dT%H-%M-%S"),
            slugify(&record.task_id, 40),
            &record.id.simple().to_string()[..8]
        );
        let path = self.dir.join(filename);
        let json = serde_json::to_string_pretty(&record).context("Failed to serialize session record")?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .context("Failed to create sessions directory")?;
        tokio::fs::write(&path, json)
            .await
            .context("Failed to write session record")?;
        Ok(path)
    }
}
