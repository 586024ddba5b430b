//! Task and status commands.

use anyhow::{Context, Result};
use std::path::Path;

use kiln::snapshot::SnapshotStore;
use kiln::telemetry::init_logging;
use kiln::tracker::{Dependency, MemoryTaskStore, NewTask, TaskKind, TaskStatus, TaskStore};

use super::run::{load_config, open_locked};
use super::super::Cli;

pub struct NewTaskArgs<'a> {
    pub title: &'a str,
    pub description: &'a str,
    pub priority: u8,
    pub blocked_by: &'a [String],
    pub parent: Option<&'a str>,
    pub epic: bool,
}

pub async fn cmd_status(project_dir: &Path, json: bool) -> Result<()> {
    let config = load_config(project_dir)?;
    let project = config.project_id();
    let snapshot = SnapshotStore::new(config.snapshot_file(), &project).load();
    let tasks = MemoryTaskStore::open(&config.tasks_file())?
        .list_tasks(&project)
        .await?;

    if json {
        let value = serde_json::json!({
            "project_id": project,
            "snapshot": snapshot,
            "tasks": {
                "open": tasks.iter().filter(|t| t.status == TaskStatus::Open).count(),
                "in_progress": tasks.iter().filter(|t| t.status == TaskStatus::InProgress).count(),
                "blocked": tasks.iter().filter(|t| t.is_blocked()).count(),
                "closed": tasks.iter().filter(|t| t.status == TaskStatus::Closed).count(),
            }
        });
        println!("{}", serde_json::to_string_pretty(&value).context("Failed to render status")?);
        return Ok(());
    }

    println!();
    println!("Kiln Status: {}", project);
    println!("============");
    println!();
    match &snapshot {
        Some(snapshot) => {
            println!("Active slots ({}):", snapshot.slots.len());
            for slot in &snapshot.slots {
                println!(
                    "  {:<12} {:<9} attempt {:<3} since {}  {}",
                    slot.task_id,
                    slot.phase.as_str(),
                    slot.attempt,
                    slot.phase_started_at.format("%Y-%m-%d %H:%M:%S"),
                    slot.branch
                );
            }
            println!(
                "Totals: {} completed, {} failed, queue depth {}",
                snapshot.totals.completed, snapshot.totals.failed, snapshot.totals.queue_depth
            );
        }
        None => println!("Idle (no active slots)"),
    }

    println!();
    println!("Tasks:");
    for status in [TaskStatus::Open, TaskStatus::InProgress, TaskStatus::Blocked, TaskStatus::Closed] {
        let count = tasks.iter().filter(|t| t.status == status).count();
        println!("  {:<12} {}", status.as_str(), count);
    }
    for task in tasks.iter().filter(|t| t.is_blocked()) {
        println!(
            "  ! {} {}: {}",
            task.id,
            task.title,
            task.block_reason.as_deref().unwrap_or("(no reason)")
        );
    }
    println!();
    Ok(())
}

pub async fn cmd_ready(project_dir: &Path) -> Result<()> {
    let config = load_config(project_dir)?;
    let store = MemoryTaskStore::open(&config.tasks_file())?;
    let ready = store.list_ready(&config.project_id()).await?;
    if ready.is_empty() {
        println!("No tasks ready.");
        return Ok(());
    }
    for task in ready {
        println!("P{} {:<10} {}", task.priority, task.id, task.title);
    }
    Ok(())
}

pub async fn cmd_add(project_dir: &Path, args: NewTaskArgs<'_>) -> Result<()> {
    let config = load_config(project_dir)?;
    let store = MemoryTaskStore::open(&config.tasks_file())?;

    let mut new_task = NewTask::new(args.title)
        .with_description(args.description)
        .with_priority(args.priority);
    if args.epic {
        new_task = new_task.with_kind(TaskKind::Epic);
    }
    for blocker in args.blocked_by {
        new_task = new_task.with_dependency(Dependency::blocked_by(blocker.as_str()));
    }
    if let Some(parent) = args.parent {
        new_task = new_task.with_dependency(Dependency::child_of(parent));
    }

    let task = store.create_task(&config.project_id(), new_task).await?;
    println!("Created {} (P{}): {}", task.id, task.priority, task.title);
    Ok(())
}

pub async fn cmd_unblock(cli: &Cli, project_dir: &Path, task: &str) -> Result<()> {
    let _log_guard = init_logging(cli.verbose, cli.log_format, None)?;
    let (_config, _lock, orchestrator) = open_locked(project_dir)?;
    orchestrator.unblock(task).await?;
    println!("Unblocked {}", task);
    Ok(())
}

pub async fn cmd_feedback(
    cli: &Cli,
    project_dir: &Path,
    task: &str,
    author: &str,
    message: &str,
) -> Result<()> {
    let _log_guard = init_logging(cli.verbose, cli.log_format, None)?;
    let (_config, _lock, orchestrator) = open_locked(project_dir)?;
    orchestrator.submit_feedback(task, author, message).await?;
    println!("Recorded feedback on {}", task);
    Ok(())
}

pub async fn cmd_ask(cli: &Cli, project_dir: &Path, task: &str, question: &str) -> Result<()> {
    let _log_guard = init_logging(cli.verbose, cli.log_format, None)?;
    let (_config, _lock, orchestrator) = open_locked(project_dir)?;
    orchestrator.request_human_feedback(task, question).await?;
    println!("{} is waiting for human feedback", task);
    Ok(())
}
