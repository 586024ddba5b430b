//! `kiln init`: create the `.kiln/` state directory.
//!
//! ```text
//! .kiln/
//! ├── kiln.toml        # Configuration
//! ├── .gitignore       # Keeps runtime state out of commits
//! ├── tasks.json       # Task store (created on first write)
//! ├── snapshot.json    # Present only while slots are active
//! ├── sessions/        # Archived worker sessions
//! ├── logs/            # Daily log files
//! └── worktrees/       # One worktree per active task
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::{CONFIG_FILE, KILN_DIR, KilnToml};

/// Runtime files that must never be committed by `git add -A`.
const GITIGNORE: &str = "\
result.json
snapshot.json
*.tmp
tasks.json.tmp
kiln.lock
sessions/
logs/
worktrees/
";

#[derive(Debug)]
pub struct InitResult {
    pub kiln_dir: PathBuf,
    /// False when `.kiln/` already existed.
    pub created: bool,
    /// Whether a default `kiln.toml` was written.
    pub wrote_config: bool,
}

pub fn is_initialized(project_dir: &Path) -> bool {
    project_dir.join(KILN_DIR).join(CONFIG_FILE).exists()
}

/// Create `.kiln/` and its default files. Existing files are left alone, so
/// running it twice is harmless.
pub fn init_project(project_dir: &Path) -> Result<InitResult> {
    let kiln_dir = project_dir.join(KILN_DIR);
    let created = !kiln_dir.exists();

    for dir in [kiln_dir.clone(), kiln_dir.join("sessions"), kiln_dir.join("logs")] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }

    let gitignore = kiln_dir.join(".gitignore");
    if !gitignore.exists() {
        std::fs::write(&gitignore, GITIGNORE)
            .with_context(|| format!("Failed to write {}", gitignore.display()))?;
    }

    let config_path = kiln_dir.join(CONFIG_FILE);
    let wrote_config = !config_path.exists();
    if wrote_config {
        let mut toml = KilnToml::default();
        toml.project.id = project_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string());
        toml.save(&config_path)?;
    }

    Ok(InitResult {
        kiln_dir,
        created,
        wrote_config,
    })
}
