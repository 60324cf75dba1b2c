//! Integration tests for the autonomous binary surface.
//!
//! These drive the CLI the way an operator would: argument parsing, exit
//! codes for unrecoverable startup errors, and the read-only subcommands.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

fn autonomous() -> Command {
    let mut cmd = cargo_bin_cmd!("autonomous");
    // Keep host credentials out of the tests.
    cmd.env_remove("AUTONOMOUS_BOARD_TOKEN");
    cmd.env_remove("GITHUB_TOKEN");
    cmd
}

fn git_repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    git2::Repository::init(dir.path()).unwrap();
    dir
}

// =============================================================================
// Basic CLI
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        autonomous()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("Autonomous development orchestrator"));
    }

    #[test]
    fn test_version() {
        autonomous().arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        autonomous().arg("frobnicate").assert().failure();
    }

    #[test]
    fn test_run_help_lists_epic_and_auto_merge() {
        autonomous()
            .args(["run", "--help"])
            .assert()
            .success()
            .stdout(predicate::str::contains("--epic"))
            .stdout(predicate::str::contains("--auto-merge"));
    }
}

// =============================================================================
// Startup errors (exit code 1 by contract)
// =============================================================================

mod startup_errors {
    use super::*;

    #[test]
    fn test_run_outside_a_repository_exits_one() {
        let dir = TempDir::new().unwrap();
        autonomous()
            .current_dir(dir.path())
            .arg("run")
            .assert()
            .code(1)
            .stderr(predicate::str::contains("Not a git repository"));
    }

    #[test]
    fn test_run_without_credentials_exits_one() {
        let dir = git_repo();
        autonomous()
            .current_dir(dir.path())
            .arg("run")
            .assert()
            .code(1)
            .stderr(predicate::str::contains("credentials"));
    }

    #[test]
    fn test_run_with_invalid_config_exits_one() {
        let dir = git_repo();
        std::fs::write(dir.path().join("autonomous.toml"), "[board\nbroken").unwrap();
        autonomous()
            .current_dir(dir.path())
            .arg("run")
            .assert()
            .code(1)
            .stderr(predicate::str::contains("Invalid configuration"));
    }
}

// =============================================================================
// Read-only subcommands
// =============================================================================

mod read_only {
    use super::*;

    #[test]
    fn test_status_with_no_sessions() {
        let dir = git_repo();
        autonomous()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("No live worker sessions"));
    }

    #[test]
    fn test_status_lists_session_files() {
        let dir = git_repo();
        let sessions = dir.path().join(".autonomous/sessions");
        std::fs::create_dir_all(&sessions).unwrap();
        std::fs::write(
            sessions.join("instance-claude-0.json"),
            r#"{
                "instance_id": "claude-0",
                "process_id": 4321,
                "started_at": "2026-08-01T10:00:00Z",
                "assignment_id": "0196fdb2-0000-7000-8000-000000000000",
                "worktree_path": "/work/widget-issue-42"
            }"#,
        )
        .unwrap();

        autonomous()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("claude-0"))
            .stdout(predicate::str::contains("widget-issue-42"));
    }

    #[test]
    fn test_status_outside_repository_fails() {
        let dir = TempDir::new().unwrap();
        autonomous().current_dir(dir.path()).arg("status").assert().failure();
    }

    #[test]
    fn test_doctor_reports_all_providers() {
        autonomous()
            .arg("doctor")
            .assert()
            .success()
            .stdout(predicate::str::contains("claude"))
            .stdout(predicate::str::contains("gemini"))
            .stdout(predicate::str::contains("codex"));
    }
}
