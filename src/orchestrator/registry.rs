use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::engine::{OrchestratorStatus, ProjectOrchestrator};
use super::recovery::RecoveryReport;
use crate::errors::OrchestratorError;

/// Orchestrators keyed by project id. Projects never share a slot, snapshot
/// or lock.
#[derive(Default)]
pub struct OrchestratorRegistry {
    projects: RwLock<HashMap<String, Arc<ProjectOrchestrator>>>,
}

impl OrchestratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an orchestrator, replacing any previous one for the same project.
    pub async fn register(&self, orchestrator: Arc<ProjectOrchestrator>) -> Option<Arc<ProjectOrchestrator>> {
        let id = orchestrator.project_id().to_string();
        let previous = self.projects.write().await.insert(id.clone(), orchestrator);
        if previous.is_some() {
            warn!(project = %id, "replaced registered orchestrator");
        }
        previous
    }

    pub async fn get(&self, project_id: &str) -> Result<Arc<ProjectOrchestrator>, OrchestratorError> {
        self.projects
            .read()
            .await
            .get(project_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownProject {
                project_id: project_id.to_string(),
            })
    }

    pub async fn project_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.projects.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Wake one project's dispatch loop.
    pub async fn nudge(&self, project_id: &str) -> Result<(), OrchestratorError> {
        self.get(project_id).await?.nudge();
        Ok(())
    }

    /// Start every project concurrently. One project failing to recover does
    /// not stop the others.
    pub async fn start_all(&self) -> Vec<(String, Result<RecoveryReport, OrchestratorError>)> {
        let orchestrators = self.snapshot().await;
        let results = join_all(orchestrators.iter().map(|o| o.start())).await;
        orchestrators
            .iter()
            .zip(results)
            .map(|(o, result)| {
                if let Err(e) = &result {
                    warn!(project = %o.project_id(), error = %e, "project failed to start");
                }
                (o.project_id().to_string(), result)
            })
            .collect()
    }

    pub async fn shutdown_all(&self) {
        let orchestrators = self.snapshot().await;
        join_all(orchestrators.iter().map(|o| o.shutdown())).await;
        info!(projects = orchestrators.len(), "all orchestrators stopped");
    }

    pub async fn statuses(&self) -> Vec<OrchestratorStatus> {
        let mut statuses: Vec<OrchestratorStatus> = self
            .snapshot()
            .await
            .iter()
            .map(|o| o.status())
            .collect();
        statuses.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        statuses
    }

    async fn snapshot(&self) -> Vec<Arc<ProjectOrchestrator>> {
        self.projects.read().await.values().cloned().collect()
    }
}
