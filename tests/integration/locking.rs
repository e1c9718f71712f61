//! Execution lock integration tests.
//!
//! These tests verify that only one invocation executes per workspace, and
//! that a lock left behind by a dead process does not wedge the workspace.

use std::process::Command;
use std::sync::Arc;

use chrono::Utc;
use specflow::core::SpecSet;
use specflow::orchestration::{
    lock_path, read_lock, unlock, ExecutionLock, ExecutionOptions, LockInfo, Orchestrator,
    OverallStatus, UnlockOutcome,
};
use specflow::Error;

use crate::fixtures::{collaborators, spec, test_config, workspace, RecordingGenerator, ScriptedTestRunner};

fn dead_pid() -> u32 {
    let mut child = Command::new("true").spawn().expect("Failed to spawn true");
    let pid = child.id();
    child.wait().expect("Failed to wait for true");
    pid
}

fn write_stale_lock(root: &std::path::Path) -> u32 {
    let pid = dead_pid();
    let path = lock_path(root);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let info = LockInfo {
        pid,
        spec_set_id: "crashed".into(),
        acquired_at: Utc::now(),
        extra: serde_json::Map::new(),
    };
    std::fs::write(&path, serde_json::to_string_pretty(&info).unwrap()).unwrap();
    pid
}

/// Test: Stale lock recovery
/// Given a lock file whose holder has exited
/// When a spec set runs
/// Then the stale lock is replaced and removed again at the end
#[tokio::test]
async fn test_dead_pid_lock_is_removed() {
    let dir = workspace();
    write_stale_lock(dir.path());

    let orchestrator = Orchestrator::new(
        dir.path(),
        test_config(),
        collaborators(Arc::new(RecordingGenerator::new()), ScriptedTestRunner::passing()),
    );
    let set = SpecSet::new("set", vec![spec("core", 1)]);
    let report = orchestrator
        .execute_spec_set(&set, ExecutionOptions::from_config(&test_config()))
        .await
        .unwrap();

    assert_eq!(report.status, OverallStatus::Complete);
    assert!(!lock_path(dir.path()).exists());
}

/// Test: Live lock contention
/// Given a lock held by this (live) process
/// When another execution starts
/// Then it fails fast with LockHeld and leaves no coordination record
#[tokio::test]
async fn test_live_lock_fails_fast() {
    let dir = workspace();
    let held = ExecutionLock::acquire(dir.path(), "other").await.unwrap();

    let generator = Arc::new(RecordingGenerator::new());
    let orchestrator = Orchestrator::new(
        dir.path(),
        test_config(),
        collaborators(generator.clone(), ScriptedTestRunner::passing()),
    );
    let set = SpecSet::new("set", vec![spec("core", 1)]);
    let err = orchestrator
        .execute_spec_set(&set, ExecutionOptions::from_config(&test_config()))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::LockHeld { pid, .. } if pid == std::process::id()));
    assert_eq!(generator.calls(), 0);
    assert!(!orchestrator.coordination().path().exists());

    // The competing lock is untouched.
    let on_disk = read_lock(dir.path()).await.unwrap().unwrap();
    assert_eq!(on_disk.spec_set_id, "other");
    held.release().await.unwrap();
}

/// Test: Manual unlock
#[tokio::test]
async fn test_unlock_stale_and_live() {
    let dir = workspace();
    let pid = write_stale_lock(dir.path());
    assert!(matches!(
        unlock(dir.path(), false).await.unwrap(),
        UnlockOutcome::Removed(info) if info.pid == pid
    ));
    assert_eq!(unlock(dir.path(), false).await.unwrap(), UnlockOutcome::NotLocked);

    let held = ExecutionLock::acquire(dir.path(), "live").await.unwrap();
    assert!(matches!(
        unlock(dir.path(), false).await.unwrap(),
        UnlockOutcome::HeldByLiveProcess(_)
    ));
    assert!(lock_path(dir.path()).exists());
    drop(held);
    assert!(!lock_path(dir.path()).exists());
}
