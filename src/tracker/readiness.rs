//! Readiness policy over the task dependency graph.
//!
//! A task is ready when it is open, not an epic, not flagged `blocked`, every
//! `blocks` predecessor is closed, and no epic above it is blocked.

use std::collections::{HashMap, HashSet};

use super::{Task, TaskId, TaskKind, TaskStatus};

/// Ordered ready list: ascending priority, ties keep the input order.
pub fn ready_tasks(tasks: &[Task]) -> Vec<Task> {
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();

    let mut ready: Vec<Task> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Open)
        .filter(|t| t.kind != TaskKind::Epic)
        .filter(|t| !t.is_flagged_blocked())
        .filter(|t| blockers_closed_in(t, &by_id))
        .filter(|t| !container_blocked(t, &by_id))
        .cloned()
        .collect();

    // sort_by_key is stable, so insertion order breaks ties
    ready.sort_by_key(|t| t.priority);
    ready
}

/// Whether every `blocks` predecessor of `id` is closed.
///
/// Unknown tasks and dangling blocker references count as not closed.
pub fn blockers_closed(tasks: &[Task], id: &str) -> bool {
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    by_id
        .get(id)
        .is_some_and(|task| blockers_closed_in(task, &by_id))
}

fn blockers_closed_in(task: &Task, by_id: &HashMap<&str, &Task>) -> bool {
    task.blockers().all(|blocker| {
        by_id
            .get(blocker.as_str())
            .is_some_and(|b| b.status == TaskStatus::Closed)
    })
}

/// Walk the parent chain; any blocked epic above the task hides it.
fn container_blocked(task: &Task, by_id: &HashMap<&str, &Task>) -> bool {
    let mut seen: HashSet<&TaskId> = HashSet::new();
    let mut current = task.parent();
    while let Some(parent_id) = current {
        if !seen.insert(parent_id) {
            break;
        }
        let Some(parent) = by_id.get(parent_id.as_str()) else {
            break;
        };
        if parent.is_blocked() {
            return true;
        }
        current = parent.parent();
    }
    false
}
