use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

/// Lines of test output kept in the summary.
const SUMMARY_TAIL_LINES: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub passed: bool,
    pub summary: String,
}

/// Runs the project's test suite inside a worktree.
#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run(&self, worktree: &Path) -> Result<TestOutcome>;
}

/// Runs a configured shell command. Without a command every run passes.
pub struct ShellTestRunner {
    command: Option<String>,
}

impl ShellTestRunner {
    pub fn new(command: Option<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl TestRunner for ShellTestRunner {
    async fn run(&self, worktree: &Path) -> Result<TestOutcome> {
        let Some(command) = self.command.as_deref() else {
            return Ok(TestOutcome {
                passed: true,
                summary: "no test command configured".to_string(),
            });
        };

        debug!(command, dir = %worktree.display(), "running tests");
        let output = Command::new("sh")
            .args(["-c", command])
            .current_dir(worktree)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to run test command '{}'", command))?;

        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        let passed = output.status.success();
        let mut summary = tail_lines(&text, SUMMARY_TAIL_LINES);
        if summary.is_empty() {
            summary = if passed {
                "tests passed".to_string()
            } else {
                format!("tests failed with {}", output.status)
            };
        }
        Ok(TestOutcome { passed, summary })
    }
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
