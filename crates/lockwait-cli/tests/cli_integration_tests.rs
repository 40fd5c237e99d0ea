//! CLI integration tests for lockwait
//!
//! Tests the lockwait CLI commands end-to-end using assert_cmd.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Helper to create a command with its own config directory
#[allow(deprecated)]
fn lockwait_cmd(config_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("lockwait").unwrap();
    cmd.env("LOCKWAIT_CONFIG_DIR", config_dir.path());
    cmd.env("RUST_LOG", "off");
    cmd
}

fn json_output(cmd: &mut Command) -> serde_json::Value {
    let output = cmd.assert().success().get_output().stdout.clone();
    serde_json::from_slice(&output).unwrap()
}

#[test]
fn test_config_path_uses_env_dir() {
    let dir = TempDir::new().unwrap();
    lockwait_cmd(&dir)
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains(dir.path().to_str().unwrap()))
        .stdout(predicate::str::contains("config.toml"));
}

#[test]
fn test_config_set_then_get() {
    let dir = TempDir::new().unwrap();

    lockwait_cmd(&dir)
        .args(["config", "set", "locking.lock_timeout_ms", "300"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Set locking.lock_timeout_ms = 300"));

    lockwait_cmd(&dir)
        .args(["config", "get", "locking.lock_timeout_ms"])
        .assert()
        .success()
        .stdout(predicate::str::diff("300\n"));

    assert!(dir.path().join("config.toml").exists());
}

#[test]
fn test_config_list_and_reset() {
    let dir = TempDir::new().unwrap();

    lockwait_cmd(&dir)
        .args(["config", "set", "locking.max_workers", "12"])
        .assert()
        .success();

    lockwait_cmd(&dir)
        .args(["config", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("locking.max_workers = 12"))
        .stdout(predicate::str::contains("locking.deadlock_timeout_ms = 1000"));

    lockwait_cmd(&dir)
        .args(["config", "reset"])
        .assert()
        .success()
        .stdout(predicate::str::contains("reset to defaults"));

    lockwait_cmd(&dir)
        .args(["config", "get", "locking.max_workers"])
        .assert()
        .success()
        .stdout(predicate::str::diff("64\n"));
}

#[test]
fn test_config_rejects_bad_input() {
    let dir = TempDir::new().unwrap();

    lockwait_cmd(&dir)
        .args(["config", "get", "locking.nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown configuration key"));

    lockwait_cmd(&dir)
        .args(["config", "set", "locking.num_partitions", "10"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("power of two"));
}

#[test]
fn test_simulate_deadlock_fails_one_worker() {
    let dir = TempDir::new().unwrap();
    let report = json_output(lockwait_cmd(&dir).args([
        "--format",
        "json",
        "simulate",
        "deadlock",
        "--workers",
        "3",
        "--deadlock-timeout-ms",
        "30",
    ]));

    assert_eq!(report["scenario"], "deadlock");
    assert_eq!(report["deadlocks"], 1);
    assert_eq!(report["granted"], 2);
}

#[test]
fn test_simulate_timeout() {
    let dir = TempDir::new().unwrap();
    let report = json_output(lockwait_cmd(&dir).args([
        "--format",
        "json",
        "simulate",
        "timeout",
        "--lock-timeout-ms",
        "50",
    ]));

    assert_eq!(report["timeouts"], 1);
    assert_eq!(report["cancelled"], 0);
}

#[test]
fn test_simulate_timeout_requires_timeout() {
    let dir = TempDir::new().unwrap();
    lockwait_cmd(&dir)
        .args(["simulate", "timeout"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("lock timeout is disabled"));
}

#[test]
fn test_simulate_cancel() {
    let dir = TempDir::new().unwrap();
    let report = json_output(lockwait_cmd(&dir).args(["--format", "json", "simulate", "cancel"]));

    assert_eq!(report["cancelled"], 1);
    assert_eq!(report["timeouts"], 0);
}

#[test]
fn test_simulate_contention_text() {
    let dir = TempDir::new().unwrap();
    lockwait_cmd(&dir)
        .args([
            "simulate",
            "contention",
            "--workers",
            "3",
            "--rounds",
            "5",
            "--deadlock-timeout-ms",
            "20",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Scenario: contention"))
        .stdout(predicate::str::contains("Granted:    15"))
        .stdout(predicate::str::contains("Deadlocks:  0"));
}

#[test]
fn test_simulate_reports_lock_wait_events() {
    let dir = TempDir::new().unwrap();
    let report = json_output(lockwait_cmd(&dir).args([
        "--format",
        "json",
        "simulate",
        "deadlock",
        "--deadlock-timeout-ms",
        "30",
        "--log-lock-waits",
    ]));

    assert_eq!(report["deadlocks"], 1);
    assert!(report["events"].as_object().is_some_and(|e| !e.is_empty()));
}

#[test]
fn test_doctor_passes() {
    let dir = TempDir::new().unwrap();
    lockwait_cmd(&dir)
        .arg("doctor")
        .assert()
        .success()
        .stdout(predicate::str::contains("[OK] Configuration: Valid"))
        .stdout(predicate::str::contains("[OK] Deadlock detection"))
        .stdout(predicate::str::contains("All checks passed."));
}
