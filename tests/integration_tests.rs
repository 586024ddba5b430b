//! CLI tests for kiln
//!
//! These exercise the binary end to end against a scratch project directory.
//! Commands that need git or a worker process are covered by the in-process
//! orchestrator tests instead.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn kiln() -> Command {
    let mut cmd = cargo_bin_cmd!("kiln");
    cmd.env_remove("KILN_MAX_SLOTS")
        .env_remove("KILN_WORKER_CMD")
        .env_remove("KILN_TEST_CMD")
        .env_remove("RUST_LOG");
    cmd
}

fn init_project(dir: &TempDir) {
    kiln()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success();
}

// =============================================================================
// Help and init
// =============================================================================

#[test]
fn test_help_lists_commands() {
    kiln()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("recover"))
        .stdout(predicate::str::contains("feedback"));
}

#[test]
fn test_init_creates_layout() {
    let dir = TempDir::new().unwrap();

    kiln()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Initialized kiln project"));

    let kiln_dir = dir.path().join(".kiln");
    assert!(kiln_dir.join("kiln.toml").is_file());
    assert!(kiln_dir.join(".gitignore").is_file());
    assert!(kiln_dir.join("sessions").is_dir());

    let config = fs::read_to_string(kiln_dir.join("kiln.toml")).unwrap();
    assert!(config.contains("[project]"));
    assert!(config.contains("[orchestrator]"));
}

#[test]
fn test_init_twice_is_harmless() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    kiln()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("already initialized"));
}

#[test]
fn test_project_dir_flag() {
    let dir = TempDir::new().unwrap();

    kiln()
        .arg("--project-dir")
        .arg(dir.path())
        .arg("init")
        .assert()
        .success();

    assert!(dir.path().join(".kiln/kiln.toml").exists());
}

// =============================================================================
// Status and tasks
// =============================================================================

#[test]
fn test_commands_require_init() {
    let dir = TempDir::new().unwrap();

    for args in [vec!["status"], vec!["ready"], vec!["add", "x"], vec!["recover"]] {
        kiln()
            .current_dir(dir.path())
            .args(&args)
            .assert()
            .failure()
            .stderr(predicate::str::contains("not initialized"));
    }
}

#[test]
fn test_status_on_fresh_project_is_idle() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    kiln()
        .current_dir(dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Idle"));
}

#[test]
fn test_status_json() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    let output = kiln()
        .current_dir(dir.path())
        .args(["status", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(value["snapshot"].is_null());
    assert_eq!(value["tasks"]["open"], 0);
}

#[test]
fn test_add_then_ready_in_priority_order() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    kiln()
        .current_dir(dir.path())
        .args(["add", "Write docs", "--priority", "3"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created kl-1"));
    kiln()
        .current_dir(dir.path())
        .args(["add", "Fix crash", "--priority", "0"])
        .assert()
        .success();
    kiln()
        .current_dir(dir.path())
        .args(["add", "Follow-up", "--blocked-by", "kl-2"])
        .assert()
        .success();

    let output = kiln()
        .current_dir(dir.path())
        .arg("ready")
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let crash = stdout.find("Fix crash").unwrap();
    let docs = stdout.find("Write docs").unwrap();
    assert!(crash < docs);
    assert!(!stdout.contains("Follow-up"));
}

#[test]
fn test_ready_with_empty_backlog() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    kiln()
        .current_dir(dir.path())
        .arg("ready")
        .assert()
        .success()
        .stdout(predicate::str::contains("No tasks ready"));
}

#[test]
fn test_epics_are_never_ready() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    kiln()
        .current_dir(dir.path())
        .args(["add", "Parser", "--epic"])
        .assert()
        .success();
    kiln()
        .current_dir(dir.path())
        .args(["add", "Lexer", "--parent", "kl-1"])
        .assert()
        .success();

    kiln()
        .current_dir(dir.path())
        .arg("ready")
        .assert()
        .success()
        .stdout(predicate::str::contains("Lexer"))
        .stdout(predicate::str::contains("Parser").not());
}

// =============================================================================
// Human feedback
// =============================================================================

#[test]
fn test_ask_blocks_and_feedback_unblocks() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    kiln()
        .current_dir(dir.path())
        .args(["add", "Pick storage"])
        .assert()
        .success();

    kiln()
        .current_dir(dir.path())
        .args(["ask", "kl-1", "SQLite or Postgres?"])
        .assert()
        .success();
    kiln()
        .current_dir(dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Human Feedback: SQLite or Postgres?"));
    kiln()
        .current_dir(dir.path())
        .arg("ready")
        .assert()
        .success()
        .stdout(predicate::str::contains("No tasks ready"));

    kiln()
        .current_dir(dir.path())
        .args(["feedback", "kl-1", "SQLite", "--author", "dana"])
        .assert()
        .success();
    kiln()
        .current_dir(dir.path())
        .arg("ready")
        .assert()
        .success()
        .stdout(predicate::str::contains("Pick storage"));
}

#[test]
fn test_unblock_unknown_task_fails() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    kiln()
        .current_dir(dir.path())
        .args(["unblock", "kl-404"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("kl-404"));
}
