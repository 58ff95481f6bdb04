//! CLI surface tests: one positional pid, no flags.
#![allow(deprecated)] // Command::cargo_bin is deprecated but still functional

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_cli_requires_pid() {
    let mut cmd = Command::cargo_bin("buildtrace").unwrap();
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("PID"));
}

#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("buildtrace").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage"));
}

#[test]
fn test_cli_rejects_non_numeric_pid() {
    let mut cmd = Command::cargo_bin("buildtrace").unwrap();
    cmd.arg("make").assert().failure();
}

#[test]
fn test_attach_failure_is_fatal_and_diagnosed() {
    // Pid 0 can never be attached; the setup failure must terminate with a
    // non-zero status and a diagnostic, before any artifact is written.
    let dir = tempfile::tempdir().unwrap();
    let mut cmd = Command::cargo_bin("buildtrace").unwrap();
    cmd.current_dir(dir.path())
        .arg("0")
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to attach"));
    assert!(!dir.path().join("build.ninja").exists());
    assert!(!dir.path().join("build_trace.json").exists());
}
