//! Task tracker interface.
//!
//! The tracker owns tasks; kiln only reads and mutates them through the
//! [`TaskStore`] trait. The readiness policy in [`readiness`] is pure and is
//! shared by every store implementation, so selection behaves the same no
//! matter where tasks live.

pub mod memory;
pub mod readiness;

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use memory::MemoryTaskStore;
pub use readiness::{blockers_closed, ready_tasks};

pub type TaskId = String;
pub type ProjectId = String;

/// Label marking a task as needing a human before it can be scheduled again.
pub const BLOCKED_LABEL: &str = "blocked";

/// Prefix of the label that stores the durable cumulative-attempt counter.
pub const ATTEMPTS_LABEL_PREFIX: &str = "attempts:";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Open,
    InProgress,
    Blocked,
    Closed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "in_progress" => Ok(Self::InProgress),
            "blocked" => Ok(Self::Blocked),
            "closed" => Ok(Self::Closed),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    #[default]
    Task,
    Bug,
    Epic,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Bug => "bug",
            Self::Epic => "epic",
        }
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(Self::Task),
            "bug" => Ok(Self::Bug),
            "epic" => Ok(Self::Epic),
            _ => Err(format!("Invalid task kind: {}", s)),
        }
    }
}

/// Edge type between two tasks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DependencyKind {
    /// `target` must close before this task may start.
    Blocks,
    /// `target` is the epic containing this task.
    ParentChild,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dependency {
    pub kind: DependencyKind,
    pub target: TaskId,
}

impl Dependency {
    pub fn blocked_by(target: impl Into<TaskId>) -> Self {
        Self {
            kind: DependencyKind::Blocks,
            target: target.into(),
        }
    }

    pub fn child_of(epic: impl Into<TaskId>) -> Self {
        Self {
            kind: DependencyKind::ParentChild,
            target: epic.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Comment {
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub project_id: ProjectId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    pub kind: TaskKind,
    pub priority: u8,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub block_reason: Option<String>,
    #[serde(default)]
    pub last_auto_retry: Option<DateTime<Utc>>,
    #[serde(default)]
    pub close_reason: Option<String>,
    #[serde(default)]
    pub comments: Vec<Comment>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    /// Whether the `blocked` label is set.
    pub fn is_flagged_blocked(&self) -> bool {
        self.has_label(BLOCKED_LABEL)
    }

    /// Blocked either by status or by label.
    pub fn is_blocked(&self) -> bool {
        self.status == TaskStatus::Blocked || self.is_flagged_blocked()
    }

    pub fn blockers(&self) -> impl Iterator<Item = &TaskId> {
        self.dependencies
            .iter()
            .filter(|d| d.kind == DependencyKind::Blocks)
            .map(|d| &d.target)
    }

    /// The containing epic, if any.
    pub fn parent(&self) -> Option<&TaskId> {
        self.dependencies
            .iter()
            .find(|d| d.kind == DependencyKind::ParentChild)
            .map(|d| &d.target)
    }

    /// Counter value parsed from the `attempts:<n>` label (0 when absent).
    pub fn attempts_from_labels(&self) -> u32 {
        self.labels
            .iter()
            .filter_map(|l| l.strip_prefix(ATTEMPTS_LABEL_PREFIX))
            .filter_map(|n| n.parse::<u32>().ok())
            .max()
            .unwrap_or(0)
    }
}

/// Fields for creating a task.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub id: Option<TaskId>,
    pub title: String,
    pub description: String,
    pub kind: TaskKind,
    pub priority: u8,
    pub dependencies: Vec<Dependency>,
    pub labels: Vec<String>,
}

impl NewTask {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            priority: 2,
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_kind(mut self, kind: TaskKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependency(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Partial update. `None` leaves a field untouched; for nullable fields
/// `Some(None)` clears the value.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub assignee: Option<Option<String>>,
    pub priority: Option<u8>,
    pub block_reason: Option<Option<String>>,
    pub last_auto_retry: Option<Option<DateTime<Utc>>>,
}

impl TaskUpdate {
    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn assignee(mut self, assignee: Option<String>) -> Self {
        self.assignee = Some(assignee);
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn block_reason(mut self, reason: Option<String>) -> Self {
        self.block_reason = Some(reason);
        self
    }

    pub fn last_auto_retry(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.last_auto_retry = Some(at);
        self
    }

    /// Return a task to the open backlog with nobody assigned.
    pub fn requeue() -> Self {
        Self::default().status(TaskStatus::Open).assignee(None)
    }
}

/// Abstraction over the external issue tracker.
/// Real deployments plug in their own store; `MemoryTaskStore` ships for the
/// CLI and tests.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn list_tasks(&self, project: &str) -> Result<Vec<Task>>;

    async fn get_task(&self, id: &str) -> Result<Option<Task>>;

    async fn create_task(&self, project: &str, task: NewTask) -> Result<Task>;

    async fn update_task(&self, id: &str, update: TaskUpdate) -> Result<Task>;

    async fn close_task(&self, id: &str, reason: &str) -> Result<Task>;

    /// Tasks ready for work, ordered by priority then insertion order.
    async fn list_ready(&self, project: &str) -> Result<Vec<Task>>;

    /// Re-check that every `blocks` predecessor of `id` is closed.
    async fn blockers_closed(&self, id: &str) -> Result<bool>;

    async fn attempt_count(&self, id: &str) -> Result<u32>;

    async fn set_attempt_count(&self, id: &str, count: u32) -> Result<()>;

    async fn add_label(&self, id: &str, label: &str) -> Result<()>;

    async fn remove_label(&self, id: &str, label: &str) -> Result<()>;

    async fn add_comment(&self, id: &str, author: &str, body: &str) -> Result<()>;

    /// Remove every task of a project. Returns the number removed.
    async fn delete_project(&self, project: &str) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_with_labels(labels: &[&str]) -> Task {
        let now = Utc::now();
        Task {
            id: "kl-1".into(),
            project_id: "p".into(),
            title: "t".into(),
            description: String::new(),
            status: TaskStatus::Open,
            kind: TaskKind::Task,
            priority: 2,
            assignee: None,
            dependencies: vec![Dependency::blocked_by("kl-0"), Dependency::child_of("kl-e")],
            labels: labels.iter().map(|s| s.to_string()).collect(),
            block_reason: None,
            last_auto_retry: None,
            close_reason: None,
            comments: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn attempts_label_parses_highest_value() {
        let task = task_with_labels(&["attempts:2", "frontend", "attempts:5"]);
        assert_eq!(task.attempts_from_labels(), 5);
        assert_eq!(task_with_labels(&[]).attempts_from_labels(), 0);
    }

    #[test]
    fn blocked_label_counts_as_blocked() {
        let task = task_with_labels(&[BLOCKED_LABEL]);
        assert!(task.is_flagged_blocked());
        assert!(task.is_blocked());
        assert!(!task_with_labels(&[]).is_blocked());
    }

    #[test]
    fn dependency_accessors_split_by_kind() {
        let task = task_with_labels(&[]);
        assert_eq!(task.blockers().collect::<Vec<_>>(), vec!["kl-0"]);
        assert_eq!(task.parent().map(String::as_str), Some("kl-e"));
    }

    #[test]
    fn status_roundtrips_through_str() {
        for status in [
            TaskStatus::Open,
            TaskStatus::InProgress,
            TaskStatus::Blocked,
            TaskStatus::Closed,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("done".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn dependency_kind_serializes_kebab_case() {
        let json = serde_json::to_string(&Dependency::child_of("kl-e")).unwrap();
        assert!(json.contains("parent-child"));
    }
}
