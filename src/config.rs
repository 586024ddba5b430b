//! Configuration for kiln.
//!
//! Settings live in `.kiln/kiln.toml` and are layered file → environment →
//! CLI. Every field has a default, so an empty or missing file is valid.
//!
//! ```toml
//! [project]
//! id = "webapp"
//! trunk = "main"
//! remote = "origin"
//!
//! [orchestrator]
//! max_concurrent_slots = 1
//! watchdog_interval_secs = 60
//! inactivity_timeout_secs = 900
//! test_command = "cargo test"
//!
//! [backoff]
//! demotion_threshold = 3
//! max_priority = 4
//! auto_retry_cooldown_hours = 8
//!
//! [worker]
//! command = "claude"
//! args = ["--print"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backoff::{
    BackoffPolicy, DEFAULT_AUTO_RETRY_COOLDOWN_HOURS, DEFAULT_DEMOTION_THRESHOLD,
    DEFAULT_MAX_PRIORITY,
};
use crate::orchestrator::OrchestratorConfig;

pub const KILN_DIR: &str = ".kiln";
pub const CONFIG_FILE: &str = "kiln.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectSection {
    /// Project id (defaults to the directory name)
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "default_trunk")]
    pub trunk: String,
    /// Remote to push trunk to. Without one, pushes are skipped.
    #[serde(default)]
    pub remote: Option<String>,
}

fn default_trunk() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_max_slots")]
    pub max_concurrent_slots: usize,
    #[serde(default = "default_watchdog_secs")]
    pub watchdog_interval_secs: u64,
    /// A worker silent for this long is killed.
    #[serde(default = "default_inactivity_secs")]
    pub inactivity_timeout_secs: u64,
    #[serde(default = "default_recovery_poll_secs")]
    pub recovery_poll_secs: u64,
    #[serde(default = "default_agent_name")]
    pub agent_name: String,
    #[serde(default)]
    pub test_command: Option<String>,
    /// Run after every successful merge, from the repository root.
    #[serde(default)]
    pub deploy_command: Option<String>,
}

fn default_max_slots() -> usize {
    1
}

fn default_watchdog_secs() -> u64 {
    60
}

fn default_inactivity_secs() -> u64 {
    900
}

fn default_recovery_poll_secs() -> u64 {
    5
}

fn default_agent_name() -> String {
    "kiln".to_string()
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_concurrent_slots: default_max_slots(),
            watchdog_interval_secs: default_watchdog_secs(),
            inactivity_timeout_secs: default_inactivity_secs(),
            recovery_poll_secs: default_recovery_poll_secs(),
            agent_name: default_agent_name(),
            test_command: None,
            deploy_command: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffSection {
    #[serde(default = "default_demotion_threshold")]
    pub demotion_threshold: u32,
    #[serde(default = "default_max_priority")]
    pub max_priority: u8,
    #[serde(default = "default_cooldown_hours")]
    pub auto_retry_cooldown_hours: i64,
}

fn default_demotion_threshold() -> u32 {
    DEFAULT_DEMOTION_THRESHOLD
}

fn default_max_priority() -> u8 {
    DEFAULT_MAX_PRIORITY
}

fn default_cooldown_hours() -> i64 {
    DEFAULT_AUTO_RETRY_COOLDOWN_HOURS
}

impl Default for BackoffSection {
    fn default() -> Self {
        Self {
            demotion_threshold: default_demotion_threshold(),
            max_priority: default_max_priority(),
            auto_retry_cooldown_hours: default_cooldown_hours(),
        }
    }
}

impl BackoffSection {
    pub fn to_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            demotion_threshold: self.demotion_threshold,
            max_priority: self.max_priority,
            auto_retry_cooldown: chrono::Duration::hours(self.auto_retry_cooldown_hours),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSection {
    #[serde(default = "default_worker_command")]
    pub command: String,
    #[serde(default = "default_worker_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
}

fn default_worker_command() -> String {
    "claude".to_string()
}

fn default_worker_args() -> Vec<String> {
    vec!["--print".to_string()]
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            command: default_worker_command(),
            args: default_worker_args(),
            model: None,
        }
    }
}

/// The complete kiln.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KilnToml {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub backoff: BackoffSection,
    #[serde(default)]
    pub worker: WorkerSection,
}

impl KilnToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse kiln.toml")
    }

    /// Load `<kiln_dir>/kiln.toml`, or defaults when the file is absent.
    pub fn load_or_default(kiln_dir: &Path) -> Result<Self> {
        let path = kiln_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize kiln.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `KILN_WORKER_CMD`, `KILN_TEST_CMD` and `KILN_MAX_SLOTS`.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(cmd) = lookup("KILN_WORKER_CMD").filter(|v| !v.is_empty()) {
            self.worker.command = cmd;
        }
        if let Some(cmd) = lookup("KILN_TEST_CMD") {
            self.orchestrator.test_command = Some(cmd).filter(|v| !v.is_empty());
        }
        if let Some(slots) = lookup("KILN_MAX_SLOTS") {
            self.orchestrator.max_concurrent_slots = slots
                .trim()
                .parse()
                .with_context(|| format!("KILN_MAX_SLOTS must be a positive integer, got '{}'", slots))?;
        }
        Ok(())
    }

    /// Warnings for settings that parse but make little sense.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.orchestrator.max_concurrent_slots == 0 {
            warnings.push("orchestrator.max_concurrent_slots is 0; using 1".to_string());
        }
        if self.backoff.demotion_threshold == 0 {
            warnings.push("backoff.demotion_threshold is 0; every failure demotes".to_string());
        }
        if self.orchestrator.inactivity_timeout_secs < 30 {
            warnings.push(format!(
                "orchestrator.inactivity_timeout_secs = {} is very short",
                self.orchestrator.inactivity_timeout_secs
            ));
        }
        if self.orchestrator.test_command.is_none() {
            warnings.push("no orchestrator.test_command; every attempt passes testing".to_string());
        }
        warnings
    }
}

/// Resolved configuration for one project directory.
#[derive(Debug, Clone)]
pub struct KilnConfig {
    pub project_dir: PathBuf,
    pub kiln_dir: PathBuf,
    pub toml: KilnToml,
}

impl KilnConfig {
    /// Load from `<project_dir>/.kiln/kiln.toml` and apply environment overrides.
    pub fn new(project_dir: &Path) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let kiln_dir = project_dir.join(KILN_DIR);
        let mut toml = KilnToml::load_or_default(&kiln_dir)?;
        toml.apply_env()?;
        Ok(Self {
            project_dir,
            kiln_dir,
            toml,
        })
    }

    /// CLI override for the slot count.
    pub fn with_max_slots(mut self, slots: Option<usize>) -> Self {
        if let Some(slots) = slots {
            self.toml.orchestrator.max_concurrent_slots = slots;
        }
        self
    }

    pub fn project_id(&self) -> String {
        self.toml
            .project
            .id
            .clone()
            .or_else(|| {
                self.project_dir
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
            })
            .unwrap_or_else(|| "default".to_string())
    }

    pub fn config_file(&self) -> PathBuf {
        self.kiln_dir.join(CONFIG_FILE)
    }

    pub fn snapshot_file(&self) -> PathBuf {
        self.kiln_dir.join("snapshot.json")
    }

    pub fn tasks_file(&self) -> PathBuf {
        self.kiln_dir.join("tasks.json")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.kiln_dir.join("sessions")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.kiln_dir.join("logs")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.kiln_dir.join("kiln.lock")
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let o = &self.toml.orchestrator;
        OrchestratorConfig::new(&self.project_id(), self.snapshot_file())
            .with_agent_name(&o.agent_name)
            .with_max_concurrent_slots(o.max_concurrent_slots)
            .with_watchdog_interval(Duration::from_secs(o.watchdog_interval_secs.max(1)))
            .with_inactivity_timeout(Duration::from_secs(o.inactivity_timeout_secs))
            .with_recovery_poll(Duration::from_secs(o.recovery_poll_secs.max(1)))
            .with_backoff(self.toml.backoff.to_policy())
            .with_model(self.toml.worker.model.clone())
            .with_deploy_command(o.deploy_command.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_parse_empty_uses_defaults() {
        let toml = KilnToml::parse("").unwrap();
        assert_eq!(toml.project.trunk, "main");
        assert!(toml.project.remote.is_none());
        assert_eq!(toml.orchestrator.max_concurrent_slots, 1);
        assert_eq!(toml.orchestrator.inactivity_timeout_secs, 900);
        assert_eq!(toml.backoff.demotion_threshold, 3);
        assert_eq!(toml.backoff.max_priority, 4);
        assert_eq!(toml.worker.command, "claude");
    }

    #[test]
    fn test_parse_sections() {
        let content = r#"
[project]
id = "webapp"
trunk = "develop"
remote = "origin"

[orchestrator]
max_concurrent_slots = 3
test_command = "make test"

[backoff]
demotion_threshold = 5
auto_retry_cooldown_hours = 2

[worker]
command = "my-agent"
args = ["--headless"]
model = "large"
"#;
        let toml = KilnToml::parse(content).unwrap();
        assert_eq!(toml.project.id.as_deref(), Some("webapp"));
        assert_eq!(toml.project.trunk, "develop");
        assert_eq!(toml.project.remote.as_deref(), Some("origin"));
        assert_eq!(toml.orchestrator.max_concurrent_slots, 3);
        assert_eq!(toml.orchestrator.watchdog_interval_secs, 60);
        assert_eq!(toml.orchestrator.test_command.as_deref(), Some("make test"));
        assert_eq!(toml.backoff.demotion_threshold, 5);
        assert_eq!(toml.backoff.max_priority, 4);
        assert_eq!(toml.worker.args, vec!["--headless"]);

        let policy = toml.backoff.to_policy();
        assert_eq!(policy.auto_retry_cooldown, chrono::Duration::hours(2));
    }

    #[test]
    fn test_parse_rejects_bad_types() {
        assert!(KilnToml::parse("[orchestrator]\nmax_concurrent_slots = \"two\"").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("KILN_WORKER_CMD", "agent-x"),
            ("KILN_TEST_CMD", "npm test"),
            ("KILN_MAX_SLOTS", "4"),
        ]
        .into_iter()
        .collect();
        let mut toml = KilnToml::default();
        toml.apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(toml.worker.command, "agent-x");
        assert_eq!(toml.orchestrator.test_command.as_deref(), Some("npm test"));
        assert_eq!(toml.orchestrator.max_concurrent_slots, 4);
    }

    #[test]
    fn test_invalid_slot_override_is_an_error() {
        let mut toml = KilnToml::default();
        let err = toml
            .apply_overrides(|k| (k == "KILN_MAX_SLOTS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("KILN_MAX_SLOTS"));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut toml = KilnToml::default();
        toml.project.id = Some("svc".into());
        toml.orchestrator.deploy_command = Some("./deploy.sh".into());
        toml.save(&path).unwrap();

        let loaded = KilnToml::load(&path).unwrap();
        assert_eq!(loaded.project.id.as_deref(), Some("svc"));
        assert_eq!(loaded.orchestrator.deploy_command.as_deref(), Some("./deploy.sh"));
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = tempdir().unwrap();
        let toml = KilnToml::load_or_default(dir.path()).unwrap();
        assert_eq!(toml.project.trunk, "main");
    }

    #[test]
    fn test_validate_flags_suspicious_settings() {
        let mut toml = KilnToml::default();
        toml.orchestrator.max_concurrent_slots = 0;
        toml.orchestrator.inactivity_timeout_secs = 5;
        let warnings = toml.validate();
        assert!(warnings.iter().any(|w| w.contains("max_concurrent_slots")));
        assert!(warnings.iter().any(|w| w.contains("very short")));
    }

    #[test]
    fn test_derived_paths_and_project_id() {
        let dir = tempdir().unwrap();
        let project = dir.path().join("webapp");
        std::fs::create_dir_all(project.join(KILN_DIR)).unwrap();
        let config = KilnConfig {
            project_dir: project.clone(),
            kiln_dir: project.join(KILN_DIR),
            toml: KilnToml::default(),
        };
        assert_eq!(config.project_id(), "webapp");
        assert_eq!(config.snapshot_file(), project.join(".kiln/snapshot.json"));
        assert_eq!(config.lock_file(), project.join(".kiln/kiln.lock"));

        let orch = config.with_max_slots(Some(2)).orchestrator_config();
        assert_eq!(orch.project_id, "webapp");
        assert_eq!(orch.max_concurrent_slots, 2);
        assert_eq!(orch.inactivity_timeout, Duration::from_secs(900));
    }
}
