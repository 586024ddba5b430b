//! Retry, demotion and blocking policy for failed tasks.
//!
//! Every failure bumps the task's durable attempt counter. Each time the
//! counter reaches a multiple of the threshold the task is demoted one
//! priority step, or blocked when it is already at the lowest urgency. Merge
//! failures use twice the threshold.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::tracker::Task;

pub const DEFAULT_DEMOTION_THRESHOLD: u32 = 3;
pub const DEFAULT_MAX_PRIORITY: u8 = 4;
pub const DEFAULT_AUTO_RETRY_COOLDOWN_HOURS: i64 = 8;

/// Failure reasons stored on tasks are cut to this many characters.
pub const MAX_REASON_CHARS: usize = 500;

/// What kind of failure is being counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// Worker, test, review or inactivity failure.
    Coding,
    /// Rebase, merge or post-conflict failure during integration.
    Merge,
}

impl FailureCategory {
    pub fn block_category(&self) -> BlockCategory {
        match self {
            Self::Coding => BlockCategory::CodingFailure,
            Self::Merge => BlockCategory::MergeFailure,
        }
    }
}

/// Category prefix written into a blocked task's reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCategory {
    MergeFailure,
    CodingFailure,
    HumanFeedback,
}

impl BlockCategory {
    pub fn label(&self) -> &'static str {
        match self {
            Self::MergeFailure => "Merge Failure",
            Self::CodingFailure => "Coding Failure",
            Self::HumanFeedback => "Human Feedback",
        }
    }

    /// Technical blocks may be retried automatically after the cooldown.
    pub fn is_technical(&self) -> bool {
        matches!(self, Self::MergeFailure | Self::CodingFailure)
    }

    /// Recover the category from a stored block reason.
    pub fn from_reason(reason: &str) -> Option<Self> {
        [Self::MergeFailure, Self::CodingFailure, Self::HumanFeedback]
            .into_iter()
            .find(|c| reason.starts_with(c.label()))
    }

    /// Format a block reason as `"<Category>: <detail>"`.
    pub fn reason(&self, detail: &str) -> String {
        format!("{}: {}", self.label(), truncate_reason(detail))
    }
}

impl fmt::Display for BlockCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffDecision {
    /// Try again now, carrying the failure reason into the next attempt.
    Retry,
    /// Lower urgency by one step and return to the backlog.
    Demote { new_priority: u8 },
    /// Stop automatic retries until a human or the auto-retry sweep unblocks.
    Block { reason: String },
}

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub demotion_threshold: u32,
    pub max_priority: u8,
    pub auto_retry_cooldown: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            demotion_threshold: DEFAULT_DEMOTION_THRESHOLD,
            max_priority: DEFAULT_MAX_PRIORITY,
            auto_retry_cooldown: Duration::hours(DEFAULT_AUTO_RETRY_COOLDOWN_HOURS),
        }
    }
}

impl BackoffPolicy {
    pub fn threshold_for(&self, category: FailureCategory) -> u32 {
        let base = self.demotion_threshold.max(1);
        match category {
            FailureCategory::Coding => base,
            FailureCategory::Merge => base * 2,
        }
    }

    /// Decide what to do after the counter reached `cumulative_attempts`.
    pub fn decide(
        &self,
        cumulative_attempts: u32,
        priority: u8,
        category: FailureCategory,
        reason: &str,
    ) -> BackoffDecision {
        let threshold = self.threshold_for(category);
        if cumulative_attempts == 0 || cumulative_attempts % threshold != 0 {
            return BackoffDecision::Retry;
        }
        if priority >= self.max_priority {
            BackoffDecision::Block {
                reason: category.block_category().reason(reason),
            }
        } else {
            BackoffDecision::Demote {
                new_priority: priority + 1,
            }
        }
    }

    /// Whether a blocked task may be unblocked and requeued automatically.
    pub fn auto_retry_eligible(&self, task: &Task, now: DateTime<Utc>) -> bool {
        if !task.is_blocked() {
            return false;
        }
        let technical = task
            .block_reason
            .as_deref()
            .and_then(BlockCategory::from_reason)
            .is_some_and(|c| c.is_technical());
        if !technical {
            return false;
        }
        match task.last_auto_retry {
            None => true,
            Some(at) => now - at > self.auto_retry_cooldown,
        }
    }
}

/// Cut a reason to [`MAX_REASON_CHARS`] characters on a char boundary.
pub fn truncate_reason(reason: &str) -> String {
    let trimmed = reason.trim();
    if trimmed.chars().count() <= MAX_REASON_CHARS {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(MAX_REASON_CHARS).collect();
    format!("{}...", cut.trim_end())
}
