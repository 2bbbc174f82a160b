//! Integration tests for wpan-cli command-line interface
//!
//! These tests only exercise paths that fail or finish before the host is
//! touched: help output, argument errors and input validation.

use assert_cmd::Command;
use predicates::prelude::*;

/// Helper function to create a command instance for the wpan-cli binary
fn cli_command() -> Command {
    Command::cargo_bin("wpan-cli").expect("Failed to find wpan-cli binary")
}

#[test]
fn test_cli_help_and_version() {
    let mut cmd = cli_command();
    cmd.arg("--help");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Commands:"))
        .stdout(predicate::str::contains("up"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("clean"));

    let mut cmd = cli_command();
    cmd.arg("--version");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("wpan-cli"));
}

#[test]
fn test_cli_invalid_command() {
    let mut cmd = cli_command();
    cmd.arg("invalid-command");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("error: unrecognized subcommand"));
}

#[test]
fn test_subcommand_help() {
    let subcommands = vec![
        ("up", "--pan-id"),
        ("run", "topology"),
        ("clean", "--topology"),
    ];

    for (subcommand, expected) in subcommands {
        let mut cmd = cli_command();
        cmd.args([subcommand, "--help"]);
        cmd.assert()
            .success()
            .stdout(predicate::str::contains(expected))
            .stdout(predicate::str::contains("--verbose"));
    }
}

#[test]
fn test_cli_up_rejects_zero_nodes() {
    let mut cmd = cli_command();
    cmd.args(["up", "--nodes", "0"]);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("No nodes specified"));
}

#[test]
fn test_cli_run_missing_topology() {
    let mut cmd = cli_command();
    cmd.args(["run", "/nonexistent/topology.json"]);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load topology"));
}

#[test]
fn test_cli_run_invalid_topology() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("topology.json");
    std::fs::write(&path, r#"{"nodes": [{"name": "a-very-long-node"}]}"#).unwrap();

    let mut cmd = cli_command();
    cmd.arg("run").arg(&path);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("exceeds 15 bytes"));
}
