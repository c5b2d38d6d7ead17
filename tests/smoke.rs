//! Smoke tests -- verify the binary runs and drives a session end to end.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Temp dir holding a config that points the database inside it.
fn workspace() -> TempDir {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("triage.db");
    std::fs::write(
        dir.path().join("anomalytriage.toml"),
        format!("[storage]\ndb_path = {:?}\n", db.to_string_lossy()),
    )
    .unwrap();
    std::fs::write(
        dir.path().join("scores.json"),
        r#"{"scores": [1, 2, 3, 10, 11, 12], "labels": [false, false, false, true, true, true]}"#,
    )
    .unwrap();
    dir
}

fn cli(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("anomalytriage").unwrap();
    cmd.current_dir(dir.path())
        .env_remove("ANOMALYTRIAGE_CONFIG")
        .env("RUST_LOG", "off");
    cmd
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("anomalytriage")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("Cost-calibrated anomaly thresholds"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("anomalytriage")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("anomalytriage"));
}

#[test]
fn test_subcommands_exist() {
    for args in [
        vec!["dataset", "register", "--help"],
        vec!["session", "cancel", "--help"],
        vec!["report", "show", "--help"],
        vec!["calibrate", "--help"],
    ] {
        Command::cargo_bin("anomalytriage")
            .unwrap()
            .args(args)
            .assert()
            .success();
    }
}

#[test]
fn test_analyze_prints_report() {
    let dir = workspace();
    cli(&dir)
        .args(["analyze", "--input", "scores.json", "--name", "smoke"])
        .assert()
        .success()
        .stdout(predicates::str::contains("Anomalies:  3"))
        .stdout(predicates::str::contains("cost-minimized"));

    cli(&dir)
        .args(["dataset", "list"])
        .assert()
        .success()
        .stdout(predicates::str::contains("Analyzed").and(predicates::str::contains("smoke")));
}

#[test]
fn test_calibrate_prints_decision() {
    let dir = workspace();
    cli(&dir)
        .args(["calibrate", "--input", "scores.json"])
        .assert()
        .success()
        .stdout(predicates::str::contains("\"cost_minimized\""));
}

#[test]
fn test_analyze_rejects_mismatched_labels() {
    let dir = workspace();
    std::fs::write(
        dir.path().join("bad.json"),
        r#"{"scores": [1, 2, 3], "labels": [true]}"#,
    )
    .unwrap();
    cli(&dir)
        .args(["analyze", "--input", "bad.json", "--name", "bad"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("length mismatch"));

    // Validation failures never register the dataset.
    cli(&dir)
        .args(["dataset", "list"])
        .assert()
        .success()
        .stdout(predicates::str::contains("No datasets found."));
}
