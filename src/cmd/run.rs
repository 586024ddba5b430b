//! Orchestrator lifecycle: `kiln run` and `kiln recover`.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use kiln::archive::FileArchive;
use kiln::config::KilnConfig;
use kiln::git::GitCli;
use kiln::lock::ProjectLock;
use kiln::orchestrator::{
    Collaborators, OrchestratorRegistry, ProjectOrchestrator, RecoveryReport, ShellTestRunner,
};
use kiln::telemetry::init_logging;
use kiln::tracker::MemoryTaskStore;
use kiln::worker::{LibcProbe, ProcessSpawner};

use super::super::Cli;

pub fn load_config(project_dir: &Path) -> Result<KilnConfig> {
    if !kiln::init::is_initialized(project_dir) {
        anyhow::bail!("Project not initialized. Run 'kiln init' first.");
    }
    KilnConfig::new(project_dir)
}

/// Wire the production collaborators for one project.
pub fn build_orchestrator(config: &KilnConfig) -> Result<Arc<ProjectOrchestrator>> {
    let toml = &config.toml;
    let tasks = MemoryTaskStore::open(&config.tasks_file())?;
    let deps = Collaborators {
        tasks: Arc::new(tasks),
        git: Arc::new(GitCli::new(
            &config.project_dir,
            &toml.project.trunk,
            toml.project.remote.as_deref(),
        )),
        workers: Arc::new(ProcessSpawner::new(
            toml.worker.command.clone(),
            toml.worker.args.clone(),
        )),
        tests: Arc::new(ShellTestRunner::new(toml.orchestrator.test_command.clone())),
        archive: Arc::new(FileArchive::new(&config.sessions_dir())),
        probe: Arc::new(LibcProbe),
    };
    Ok(ProjectOrchestrator::new(config.orchestrator_config(), deps))
}

/// Load config, take the project lock and build the orchestrator.
pub fn open_locked(project_dir: &Path) -> Result<(KilnConfig, ProjectLock, Arc<ProjectOrchestrator>)> {
    let config = load_config(project_dir)?;
    let lock = ProjectLock::acquire(&config.lock_file(), &config.project_id())?;
    let orchestrator = build_orchestrator(&config)?;
    Ok((config, lock, orchestrator))
}

pub fn print_report(project: &str, report: &RecoveryReport) {
    if report.is_empty() {
        return;
    }
    println!("Recovery for {}:", project);
    for (label, ids) in [
        ("adopted", &report.adopted),
        ("requeued", &report.requeued),
        ("finished", &report.finished),
        ("orphaned claims released", &report.orphans),
    ] {
        if !ids.is_empty() {
            println!("  {:<26} {}", label, ids.join(", "));
        }
    }
}

pub async fn cmd_run(cli: &Cli, project_dir: &Path, max_slots: Option<usize>) -> Result<()> {
    let config = load_config(project_dir)?.with_max_slots(max_slots);
    let _log_guard = init_logging(cli.verbose, cli.log_format, Some(&config.log_dir()))?;
    for warning in config.toml.validate() {
        warn!("{}", warning);
    }

    let _lock = ProjectLock::acquire(&config.lock_file(), &config.project_id())?;
    let orchestrator = build_orchestrator(&config)?;

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Ok(json) = serde_json::to_string(&event) {
                debug!(event = %json, "orchestrator event");
            }
        }
    });

    let registry = OrchestratorRegistry::new();
    registry.register(orchestrator).await;
    for (project, result) in registry.start_all().await {
        let report = result.with_context(|| format!("Failed to start project {}", project))?;
        print_report(&project, &report);
    }

    info!(project = %config.project_id(), "running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("interrupt received, shutting down");
    registry.shutdown_all().await;
    Ok(())
}

pub async fn cmd_recover(cli: &Cli, project_dir: &Path) -> Result<()> {
    let _log_guard = init_logging(cli.verbose, cli.log_format, None)?;
    let (config, _lock, orchestrator) = open_locked(project_dir)?;
    let report = orchestrator.recover().await?;
    if report.is_empty() {
        println!("Nothing to recover for {}.", config.project_id());
    } else {
        print_report(&config.project_id(), &report);
    }
    if !report.adopted.is_empty() {
        println!("Waiting for {} adopted slot(s) to finish...", report.adopted.len());
        orchestrator.wait_for_slots().await;
    }
    orchestrator.shutdown().await;
    Ok(())
}
