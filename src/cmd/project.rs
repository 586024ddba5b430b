use anyhow::Result;
use std::path::Path;

pub fn cmd_init(project_dir: &Path) -> Result<()> {
    use kiln::init::init_project;

    let result = init_project(project_dir)?;

    if result.created {
        println!("Initialized kiln project at {}", result.kiln_dir.display());
        println!();
        println!("Created:");
        println!("  .kiln/");
        println!("  ├── kiln.toml    # Configuration");
        println!("  ├── .gitignore   # Runtime state stays out of commits");
        println!("  ├── sessions/    # Archived worker sessions");
        println!("  └── logs/        # Log files");
        println!();
        println!("Next steps:");
        println!("  1. Set [orchestrator].test_command in .kiln/kiln.toml");
        println!("  2. Add work with `kiln add \"<title>\"`");
        println!("  3. Run `kiln run`");
    } else if result.wrote_config {
        println!("Wrote default configuration to {}", result.kiln_dir.join("kiln.toml").display());
    } else {
        println!("Kiln project already initialized at {}", result.kiln_dir.display());
    }

    Ok(())
}
