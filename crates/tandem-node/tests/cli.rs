//! End-to-end checks of the tandemd command line.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn tandemd(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("tandemd").unwrap();
    cmd.arg("--config-dir").arg(dir.path()).env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_config_shows_project_overrides() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("tandem.toml"),
        "[peer]\nport = 7000\n\n[journal]\nqueue_capacity = 128\n",
    )
    .unwrap();

    tandemd(&dir)
        .args(["config", "--format", "toml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("port = 7000"))
        .stdout(predicate::str::contains("queue_capacity = 128"));
}

#[test]
fn test_invalid_config_rejected() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("tandem.toml"), "[journal]\nqueue_capacity = 0\n").unwrap();

    tandemd(&dir)
        .arg("config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid configuration"));
}

#[test]
fn test_unknown_event_rejected() {
    let dir = TempDir::new().unwrap();
    tandemd(&dir)
        .args(["event", "eth0", "SLEEPING"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown VRRP event"));
}

#[test]
fn test_status_needs_token() {
    let dir = TempDir::new().unwrap();
    tandemd(&dir)
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("peer.token"));
}
