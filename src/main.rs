use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use kiln::telemetry::LogFormat;

mod cmd;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(version, about = "Autonomous build pipeline orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Console log format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .kiln/ with a default kiln.toml
    Init,
    /// Run the orchestrator until interrupted
    Run {
        /// Override orchestrator.max_concurrent_slots
        #[arg(long, env = "KILN_MAX_SLOTS")]
        max_slots: Option<usize>,
    },
    /// Show active slots and task counts
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Reconcile the last snapshot with live workers, then exit
    Recover,
    /// List tasks ready for work
    Ready,
    /// Add a task to the local task store
    Add {
        title: String,
        #[arg(short, long, default_value = "")]
        description: String,
        /// 0 is most urgent
        #[arg(short, long, default_value = "2")]
        priority: u8,
        /// Task that must close first (repeatable)
        #[arg(long)]
        blocked_by: Vec<String>,
        /// Containing epic
        #[arg(long)]
        parent: Option<String>,
        /// Create an epic instead of a task
        #[arg(long)]
        epic: bool,
    },
    /// Lift a block and return the task to the backlog
    Unblock { task: String },
    /// Answer a task waiting for human input
    Feedback {
        task: String,
        message: String,
        #[arg(long, default_value = "human")]
        author: String,
    },
    /// Park a task until a human answers a question
    Ask { task: String, question: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir)?,
        Commands::Run { max_slots } => cmd::cmd_run(&cli, &project_dir, *max_slots).await?,
        Commands::Status { json } => cmd::cmd_status(&project_dir, *json).await?,
        Commands::Recover => cmd::cmd_recover(&cli, &project_dir).await?,
        Commands::Ready => cmd::cmd_ready(&project_dir).await?,
        Commands::Add {
            title,
            description,
            priority,
            blocked_by,
            parent,
            epic,
        } => {
            let spec = cmd::NewTaskArgs {
                title,
                description,
                priority: *priority,
                blocked_by,
                parent: parent.as_deref(),
                epic: *epic,
            };
            cmd::cmd_add(&project_dir, spec).await?
        }
        Commands::Unblock { task } => cmd::cmd_unblock(&cli, &project_dir, task).await?,
        Commands::Feedback {
            task,
            message,
            author,
        } => cmd::cmd_feedback(&cli, &project_dir, task, author, message).await?,
        Commands::Ask { task, question } => cmd::cmd_ask(&cli, &project_dir, task, question).await?,
    }

    Ok(())
}
