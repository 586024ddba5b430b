use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::readiness;
use super::{
    ATTEMPTS_LABEL_PREFIX, Comment, NewTask, Task, TaskStatus, TaskStore, TaskUpdate,
};
use crate::errors::TrackerError;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    next_id: u64,
    tasks: Vec<Task>,
}

/// Task store kept in memory, optionally mirrored to a JSON file after every
/// mutation. Insertion order is preserved and used as the readiness tie-break.
#[derive(Clone)]
pub struct MemoryTaskStore {
    inner: Arc<Mutex<StoreData>>,
    path: Option<PathBuf>,
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreData::default())),
            path: None,
        }
    }

    /// Open a file-backed store. A missing file starts empty.
    pub fn open(path: &Path) -> Result<Self> {
        let data = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read task file: {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse task file: {}", path.display()))?
        } else {
            StoreData::default()
        };
        Ok(Self {
            inner: Arc::new(Mutex::new(data)),
            path: Some(path.to_path_buf()),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreData>, TrackerError> {
        self.inner.lock().map_err(|_| TrackerError::LockPoisoned)
    }

    fn persist(&self, data: &StoreData) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(data).context("Failed to serialize tasks")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|source| TrackerError::PersistFailed {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, path).map_err(|source| TrackerError::PersistFailed {
            path: path.clone(),
            source,
        })?;
        Ok(())
    }

    /// Apply `f` to one task, stamp `updated_at`, persist, and return a copy.
    fn mutate<F>(&self, id: &str, f: F) -> Result<Task>
    where
        F: FnOnce(&mut Task),
    {
        let mut data = self.lock()?;
        let task = data
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| TrackerError::TaskNotFound { id: id.to_string() })?;
        f(task);
        task.updated_at = Utc::now();
        let updated = task.clone();
        self.persist(&data)?;
        Ok(updated)
    }

    fn project_tasks(&self, project: &str) -> Result<Vec<Task>> {
        let data = self.lock()?;
        Ok(data
            .tasks
            .iter()
            .filter(|t| t.project_id == project)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn list_tasks(&self, project: &str) -> Result<Vec<Task>> {
        self.project_tasks(project)
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let data = self.lock()?;
        Ok(data.tasks.iter().find(|t| t.id == id).cloned())
    }

    async fn create_task(&self, project: &str, new: NewTask) -> Result<Task> {
        let mut data = self.lock()?;
        data.next_id += 1;
        let id = new.id.unwrap_or_else(|| format!("kl-{}", data.next_id));
        if data.tasks.iter().any(|t| t.id == id) {
            return Err(TrackerError::Invalid(format!("duplicate task id {}", id)).into());
        }
        let now = Utc::now();
        let task = Task {
            id,
            project_id: project.to_string(),
            title: new.title,
            description: new.description,
            status: TaskStatus::Open,
            kind: new.kind,
            priority: new.priority,
            assignee: None,
            dependencies: new.dependencies,
            labels: new.labels,
            block_reason: None,
            last_auto_retry: None,
            close_reason: None,
            comments: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        data.tasks.push(task.clone());
        self.persist(&data)?;
        Ok(task)
    }

    async fn update_task(&self, id: &str, update: TaskUpdate) -> Result<Task> {
        self.mutate(id, |task| {
            if let Some(status) = update.status {
                task.status = status;
            }
            if let Some(assignee) = update.assignee {
                task.assignee = assignee;
            }
            if let Some(priority) = update.priority {
                task.priority = priority;
            }
            if let Some(reason) = update.block_reason {
                task.block_reason = reason;
            }
            if let Some(at) = update.last_auto_retry {
                task.last_auto_retry = at;
            }
        })
    }

    async fn close_task(&self, id: &str, reason: &str) -> Result<Task> {
        self.mutate(id, |task| {
            task.status = TaskStatus::Closed;
            task.assignee = None;
            task.close_reason = Some(reason.to_string());
        })
    }

    async fn list_ready(&self, project: &str) -> Result<Vec<Task>> {
        let tasks = self.project_tasks(project)?;
        Ok(readiness::ready_tasks(&tasks))
    }

    async fn blockers_closed(&self, id: &str) -> Result<bool> {
        let data = self.lock()?;
        Ok(readiness::blockers_closed(&data.tasks, id))
    }

    async fn attempt_count(&self, id: &str) -> Result<u32> {
        let data = self.lock()?;
        let task = data
            .tasks
            .iter()
            .find(|t| t.id == id)
            .ok_or_else(|| TrackerError::TaskNotFound { id: id.to_string() })?;
        Ok(task.attempts_from_labels())
    }

    async fn set_attempt_count(&self, id: &str, count: u32) -> Result<()> {
        self.mutate(id, |task| {
            task.labels.retain(|l| !l.starts_with(ATTEMPTS_LABEL_PREFIX));
            task.labels.push(format!("{}{}", ATTEMPTS_LABEL_PREFIX, count));
        })?;
        Ok(())
    }

    async fn add_label(&self, id: &str, label: &str) -> Result<()> {
        self.mutate(id, |task| {
            if !task.has_label(label) {
                task.labels.push(label.to_string());
            }
        })?;
        Ok(())
    }

    async fn remove_label(&self, id: &str, label: &str) -> Result<()> {
        self.mutate(id, |task| task.labels.retain(|l| l != label))?;
        Ok(())
    }

    async fn add_comment(&self, id: &str, author: &str, body: &str) -> Result<()> {
        self.mutate(id, |task| {
            task.comments.push(Comment {
                author: author.to_string(),
                body: body.to_string(),
                created_at: Utc::now(),
            })
        })?;
        Ok(())
    }

    async fn delete_project(&self, project: &str) -> Result<usize> {
        let mut data = self.lock()?;
        let before = data.tasks.len();
        data.tasks.retain(|t| t.project_id != project);
        let removed = before - data.tasks.len();
        self.persist(&data)?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{BLOCKED_LABEL, Dependency, TaskKind};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_create_assigns_sequential_ids() {
        let store = MemoryTaskStore::new();
        let a = store.create_task("p", NewTask::new("first")).await.unwrap();
        let b = store.create_task("p", NewTask::new("second")).await.unwrap();
        assert_eq!(a.id, "kl-1");
        assert_eq!(b.id, "kl-2");
        assert_eq!(a.status, TaskStatus::Open);
    }

    #[tokio::test]
    async fn test_duplicate_explicit_id_rejected() {
        let store = MemoryTaskStore::new();
        store
            .create_task("p", NewTask::new("a").with_id("x"))
            .await
            .unwrap();
        let err = store
            .create_task("p", NewTask::new("b").with_id("x"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[tokio::test]
    async fn test_attempt_counter_lives_in_label() {
        let store = MemoryTaskStore::new();
        let task = store.create_task("p", NewTask::new("a")).await.unwrap();
        assert_eq!(store.attempt_count(&task.id).await.unwrap(), 0);
        store.set_attempt_count(&task.id, 1).await.unwrap();
        store.set_attempt_count(&task.id, 2).await.unwrap();
        assert_eq!(store.attempt_count(&task.id).await.unwrap(), 2);
        let task = store.get_task(&task.id).await.unwrap().unwrap();
        let counters: Vec<_> = task
            .labels
            .iter()
            .filter(|l| l.starts_with(ATTEMPTS_LABEL_PREFIX))
            .collect();
        assert_eq!(counters, vec!["attempts:2"]);
    }

    #[tokio::test]
    async fn test_update_clears_nullable_fields() {
        let store = MemoryTaskStore::new();
        let task = store.create_task("p", NewTask::new("a")).await.unwrap();
        store
            .update_task(
                &task.id,
                TaskUpdate::default()
                    .status(TaskStatus::InProgress)
                    .assignee(Some("agent".into())),
            )
            .await
            .unwrap();
        let task = store.update_task(&task.id, TaskUpdate::requeue()).await.unwrap();
        assert_eq!(task.status, TaskStatus::Open);
        assert!(task.assignee.is_none());
    }

    #[tokio::test]
    async fn test_list_ready_respects_labels_and_blockers() {
        let store = MemoryTaskStore::new();
        let a = store.create_task("p", NewTask::new("a")).await.unwrap();
        let b = store
            .create_task(
                "p",
                NewTask::new("b").with_dependency(Dependency::blocked_by(a.id.clone())),
            )
            .await
            .unwrap();
        let ready = store.list_ready("p").await.unwrap();
        assert_eq!(ready.len(), 1);
        assert!(!store.blockers_closed(&b.id).await.unwrap());

        store.close_task(&a.id, "done").await.unwrap();
        assert!(store.blockers_closed(&b.id).await.unwrap());
        store.add_label(&b.id, BLOCKED_LABEL).await.unwrap();
        assert!(store.list_ready("p").await.unwrap().is_empty());
        store.remove_label(&b.id, BLOCKED_LABEL).await.unwrap();
        assert_eq!(store.list_ready("p").await.unwrap()[0].id, b.id);
    }

    #[tokio::test]
    async fn test_file_backed_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        {
            let store = MemoryTaskStore::open(&path).unwrap();
            let epic = store
                .create_task("p", NewTask::new("epic").with_kind(TaskKind::Epic))
                .await
                .unwrap();
            store.add_comment(&epic.id, "kiln", "hello").await.unwrap();
        }
        let store = MemoryTaskStore::open(&path).unwrap();
        let tasks = store.list_tasks("p").await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].comments[0].body, "hello");
        // Id sequence continues after reopen
        let next = store.create_task("p", NewTask::new("next")).await.unwrap();
        assert_eq!(next.id, "kl-2");
    }

    #[tokio::test]
    async fn test_delete_project_only_touches_that_project() {
        let store = MemoryTaskStore::new();
        store.create_task("p", NewTask::new("a")).await.unwrap();
        store.create_task("q", NewTask::new("b")).await.unwrap();
        assert_eq!(store.delete_project("p").await.unwrap(), 1);
        assert!(store.list_tasks("p").await.unwrap().is_empty());
        assert_eq!(store.list_tasks("q").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_task_is_typed_error() {
        let store = MemoryTaskStore::new();
        let err = store.close_task("nope", "x").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TrackerError>(),
            Some(TrackerError::TaskNotFound { .. })
        ));
    }
}
