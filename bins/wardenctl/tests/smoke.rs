use assert_cmd::Command;
use chrono::{TimeZone, Utc};
use predicates::prelude::*;
use std::path::Path;
use std::sync::Arc;

use warden_core::job::{SchedulePattern, ScheduleState};
use warden_core::store::{open_store, StateStore, StoreKind};

fn ctl(dir: &Path) -> Command {
    let mut c = Command::cargo_bin("wardenctl").unwrap();
    c.arg("--config").arg(dir.join("config.toml"));
    c
}

fn seeded(dir: &Path) -> Arc<dyn StateStore> {
    let store = open_store(StoreKind::Sqlite, &dir.join("tickwarden.db")).unwrap();
    let next = Utc.with_ymd_and_hms(2024, 5, 6, 9, 20, 0).unwrap();
    store.reset_state(&ScheduleState::seed("backup", &SchedulePattern::every_minutes(10), next)).unwrap();
    store
}

#[test]
fn status_on_empty_store() {
    let dir = tempfile::tempdir().unwrap();
    ctl(dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("0 job(s)"));
}

#[test]
fn overdue_lists_missed_boundary() {
    let dir = tempfile::tempdir().unwrap();
    seeded(dir.path());
    ctl(dir.path())
        .args(["overdue", "--at", "2024-05-06T09:27:00Z"])
        .assert()
        .success()
        .stdout(predicate::str::contains("backup").and(predicate::str::contains("missed 1")));
}

#[test]
fn future_only_reset_writes_cursor_and_no_history() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded(dir.path());
    ctl(dir.path())
        .args(["reset", "--future-only", "--at", "2024-05-06T09:33:00Z"])
        .assert()
        .success()
        .stdout(predicate::str::contains("reset 2024-05-06 09:20:00Z -> 2024-05-06 09:40:00Z"));

    let state = store.read_state("backup").unwrap().unwrap();
    assert_eq!(state.next_due_at, Utc.with_ymd_and_hms(2024, 5, 6, 9, 40, 0).unwrap());
    assert!(store.list_executions("backup", 10).unwrap().is_empty());
}

#[test]
fn dry_run_reset_leaves_store_alone() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded(dir.path());
    ctl(dir.path())
        .args(["reset", "--job", "backup", "--dry-run", "--at", "2024-05-06T09:33:00Z"])
        .assert()
        .success()
        .stdout(predicate::str::contains("would reset"));

    let state = store.read_state("backup").unwrap().unwrap();
    assert_eq!(state.next_due_at, Utc.with_ymd_and_hms(2024, 5, 6, 9, 20, 0).unwrap());
}

#[test]
fn history_of_unknown_job_fails() {
    let dir = tempfile::tempdir().unwrap();
    ctl(dir.path())
        .args(["history", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("job not found: ghost"));
}

#[test]
fn status_json_is_machine_readable() {
    let dir = tempfile::tempdir().unwrap();
    seeded(dir.path());
    let out = ctl(dir.path())
        .args(["status", "--json", "--at", "2024-05-06T09:00:00Z"])
        .output()
        .unwrap();
    assert!(out.status.success());
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(v["total"], 1);
    assert_eq!(v["jobs"][0]["job_id"], "backup");
    assert_eq!(v["jobs"][0]["state"], "not_due");
}
