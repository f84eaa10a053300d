//! Corruption recovery tests for trail.
//!
//! These tests verify the store can handle:
//! - Corrupted log lines
//! - Torn trailing writes
//! - Missing files
//! - An unusable storage medium

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::io::Write as IoWrite;
use std::path::Path;
use tempfile::TempDir;

fn cli() -> Command {
    Command::cargo_bin("trail").expect("Failed to find trail binary")
}

fn setup_test_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

fn simulate(data_dir: &Path) {
    cli()
        .arg("simulate")
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success();
}

fn completed_sessions(data_dir: &Path) -> usize {
    let output = cli()
        .arg("sessions")
        .arg("--data-dir")
        .arg(data_dir)
        .output()
        .unwrap();
    assert!(output.status.success());
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter(|l| l.contains("completed"))
        .count()
}

#[test]
fn test_corrupted_log_lines_are_skipped() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path();
    simulate(data_dir);

    let sessions_log = data_dir.join("store/sessions.log");
    let mut file = fs::OpenOptions::new().append(true).open(&sessions_log).unwrap();
    writeln!(file, "{{ invalid json }}}}").unwrap();
    writeln!(file, r#"{{"op":"teleport"}}"#).unwrap();
    drop(file);

    assert_eq!(completed_sessions(data_dir), 1);
}

#[test]
fn test_torn_last_line_does_not_swallow_next_record() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path();
    simulate(data_dir);

    // Crash in the middle of a write: no trailing newline
    let sessions_log = data_dir.join("store/sessions.log");
    let mut file = fs::OpenOptions::new().append(true).open(&sessions_log).unwrap();
    write!(file, r#"{{"op":"upsert","key":"partial","item":{{"id""#).unwrap();
    drop(file);

    simulate(data_dir);
    assert_eq!(completed_sessions(data_dir), 2);
}

#[test]
fn test_empty_data_dir() {
    let temp_dir = setup_test_dir();

    cli()
        .arg("pending")
        .arg("--data-dir")
        .arg(temp_dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Sync queue is empty."));

    cli()
        .arg("sessions")
        .arg("--data-dir")
        .arg(temp_dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("No sessions recorded."));
}

#[test]
fn test_empty_log_files() {
    let temp_dir = setup_test_dir();
    let store_dir = temp_dir.path().join("store");
    fs::create_dir_all(&store_dir).unwrap();
    fs::write(store_dir.join("sessions.log"), "").unwrap();
    fs::write(store_dir.join("syncQueue.log"), "\n\n").unwrap();

    simulate(temp_dir.path());
    assert_eq!(completed_sessions(temp_dir.path()), 1);
}

#[test]
fn test_compact_shrinks_logs_and_keeps_data() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path();
    simulate(data_dir);
    simulate(data_dir);

    // Each session record is written at start, after pumping and at stop
    let sessions_log = data_dir.join("store/sessions.log");
    let before = fs::read_to_string(&sessions_log).unwrap().lines().count();
    assert!(before > 2);

    cli()
        .arg("compact")
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("Compacted store"));

    let after = fs::read_to_string(&sessions_log).unwrap().lines().count();
    assert_eq!(after, 2);
    assert_eq!(completed_sessions(data_dir), 2);

    cli()
        .arg("pending")
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("pending").count(4));
}

#[test]
fn test_unusable_store_is_reported() {
    let temp_dir = setup_test_dir();
    let store_dir = temp_dir.path().join("store");
    fs::create_dir_all(store_dir.join("sessions.log")).unwrap();

    cli()
        .arg("simulate")
        .arg("--data-dir")
        .arg(temp_dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("StoreUnavailable"));
}
