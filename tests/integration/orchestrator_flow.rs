//! Spec-set execution integration tests.
//!
//! These tests run whole spec sets through the orchestrator and check the
//! outcome as seen through the persisted stores: spec lifecycle, task
//! status, deferral cleanup, shared record and concurrency limits.

use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

use specflow::checkpoint::SharedStateStore;
use specflow::coordination::{CoordinationStore, SpecStatus, TaskStore};
use specflow::core::{SpecId, SpecSet, TaskStatus};
use specflow::orchestration::{ExecutionOptions, Orchestrator, OverallStatus};
use tokio_util::sync::CancellationToken;

use crate::fixtures::{
    collaborators, spec, test_config, workspace, RecordingGenerator, ScriptedTestRunner,
};

fn options(parallel: bool, max_concurrent: usize) -> ExecutionOptions {
    ExecutionOptions {
        parallel,
        max_concurrent,
        skip_prerequisites: false,
    }
}

/// Test: Dependency order
/// Given ui depending on core
/// When the set runs
/// Then every core task is generated before any ui task and both complete
#[tokio::test]
async fn test_dependency_completes_before_dependent_starts() {
    let dir = workspace();
    let generator = Arc::new(RecordingGenerator::new());
    let orchestrator = Orchestrator::new(
        dir.path(),
        test_config(),
        collaborators(generator.clone(), ScriptedTestRunner::passing()),
    );
    let set = SpecSet::new(
        "app",
        vec![spec("ui", 2).depends_on("core"), spec("core", 2)],
    );

    let report = assert_ok!(orchestrator.execute_spec_set(&set, options(true, 2)).await);
    assert_eq!(report.status, OverallStatus::Complete);
    assert_eq!(report.completed.len(), 2);
    assert!(report.failed.is_empty() && report.blocked.is_empty());

    let last_core = generator.last_prompt_with("core task").unwrap();
    let first_ui = generator.first_prompt_with("ui task").unwrap();
    assert!(last_core < first_ui, "ui was generated before core finished");
    assert_eq!(generator.calls(), 4);

    let coordination = CoordinationStore::open(dir.path());
    for id in ["core", "ui"] {
        let state = coordination
            .get_spec_state(&SpecId::from(id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.status, SpecStatus::Complete);
        assert_eq!(state.completed_phases, vec!["impl".to_string()]);
        assert_eq!(state.current_phase, None);
    }
    assert_eq!(
        coordination.get_active_spec_set_id().await.unwrap().as_deref(),
        Some("app")
    );

    let tasks = TaskStore::open(dir.path()).load().await.unwrap().tasks;
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Done));
    assert!(dir.path().join("generated/file_0.txt").exists());
}

/// Test: Failed dependency blocks its dependent
/// Given {A, B depends on A} where A's tests always fail
/// When the set runs
/// Then A is failed, B is blocked and the overall status is blocked
#[tokio::test]
async fn test_failed_dependency_blocks_dependent() {
    let dir = workspace();
    let generator = Arc::new(RecordingGenerator::new());
    let orchestrator = Orchestrator::new(
        dir.path(),
        test_config(),
        collaborators(generator.clone(), ScriptedTestRunner::failing_for(&["a"])),
    );
    let set = SpecSet::new("set", vec![spec("a", 1), spec("b", 1).depends_on("a")]);

    let report = orchestrator
        .execute_spec_set(&set, options(true, 2))
        .await
        .unwrap();
    assert_eq!(report.status, OverallStatus::Blocked);
    assert_eq!(report.failed, vec![SpecId::from("a")]);
    assert_eq!(report.blocked, vec![SpecId::from("b")]);
    assert!(report.completed.is_empty());
    assert!(generator.first_prompt_with("b task").is_none());

    let coordination = CoordinationStore::open(dir.path());
    let a = coordination.get_spec_state(&"a".into()).await.unwrap().unwrap();
    let b = coordination.get_spec_state(&"b".into()).await.unwrap().unwrap();
    assert_eq!(a.status, SpecStatus::Failed);
    assert!(a.last_error.is_some());
    assert_eq!(b.status, SpecStatus::Blocked);

    // A fix task was tried once before the stall threshold was reached.
    let tasks = TaskStore::open(dir.path());
    let a_tasks = tasks.for_spec(&"a".into()).await.unwrap();
    assert!(a_tasks.iter().any(|t| t.origin.is_some()));
    assert!(report.metrics.totals.fix_tasks >= 1);

    // B's task was deferred for this run only and is pending again.
    let b_task = tasks.get(&"b-1".into()).await.unwrap().unwrap();
    assert_eq!(b_task.status, TaskStatus::Pending);
    assert!(b_task.deferral.is_none());
}

/// Test: Independent failures
/// Given two independent specs where only one fails
/// Then the set is blocked rather than failed
#[tokio::test]
async fn test_partial_failure_is_blocked() {
    let dir = workspace();
    let orchestrator = Orchestrator::new(
        dir.path(),
        test_config(),
        collaborators(
            Arc::new(RecordingGenerator::new()),
            ScriptedTestRunner::failing_for(&["bad"]),
        ),
    );
    let set = SpecSet::new("set", vec![spec("good", 1), spec("bad", 1)]);

    let report = orchestrator
        .execute_spec_set(&set, options(true, 2))
        .await
        .unwrap();
    assert_eq!(report.completed, vec![SpecId::from("good")]);
    assert_eq!(report.failed, vec![SpecId::from("bad")]);
    assert_eq!(report.status, OverallStatus::Blocked);
}

/// Test: Everything failing
#[tokio::test]
async fn test_all_failed_is_failed() {
    let dir = workspace();
    let orchestrator = Orchestrator::new(
        dir.path(),
        test_config(),
        collaborators(
            Arc::new(RecordingGenerator::new()),
            ScriptedTestRunner::failing_for(&["only"]),
        ),
    );
    let set = SpecSet::new("set", vec![spec("only", 1)]);

    let report = orchestrator
        .execute_spec_set(&set, options(false, 1))
        .await
        .unwrap();
    assert_eq!(report.status, OverallStatus::Failed);
}

/// Test: maxConcurrent = 1
/// Given three independent specs
/// When run with a window of one
/// Then no two generations ever overlap
#[tokio::test]
async fn test_window_of_one_never_overlaps() {
    let dir = workspace();
    let generator = Arc::new(RecordingGenerator::with_delay(Duration::from_millis(20)));
    let orchestrator = Orchestrator::new(
        dir.path(),
        test_config(),
        collaborators(generator.clone(), ScriptedTestRunner::passing()),
    );
    let set = SpecSet::new("set", vec![spec("a", 1), spec("b", 1), spec("c", 1)]);

    let report = orchestrator
        .execute_spec_set(&set, options(true, 1))
        .await
        .unwrap();
    assert_eq!(report.status, OverallStatus::Complete);
    assert_eq!(generator.calls(), 3);
    assert_eq!(generator.max_in_flight(), 1);
}

/// Test: Window bound
/// Given four independent specs and a window of two
/// Then at most two generations run at once
#[tokio::test]
async fn test_window_bounds_concurrency() {
    let dir = workspace();
    let generator = Arc::new(RecordingGenerator::with_delay(Duration::from_millis(30)));
    let orchestrator = Orchestrator::new(
        dir.path(),
        test_config(),
        collaborators(generator.clone(), ScriptedTestRunner::passing()),
    );
    let set = SpecSet::new(
        "set",
        vec![spec("a", 1), spec("b", 1), spec("c", 1), spec("d", 1)],
    );

    let report = orchestrator
        .execute_spec_set(&set, options(true, 2))
        .await
        .unwrap();
    assert_eq!(report.completed.len(), 4);
    assert!(generator.max_in_flight() <= 2);
}

/// Test: Shared record
/// After a successful run the shared record lists completed specs, carries
/// the learned patterns and aggregates metrics.
#[tokio::test]
async fn test_shared_record_updated_after_run() {
    let dir = workspace();
    let orchestrator = Orchestrator::new(
        dir.path(),
        test_config(),
        collaborators(Arc::new(RecordingGenerator::new()), ScriptedTestRunner::passing()),
    );
    let set = SpecSet::new("set", vec![spec("core", 2)]);
    orchestrator
        .execute_spec_set(&set, options(true, 2))
        .await
        .unwrap();

    let record = SharedStateStore::open(dir.path()).load("set").await.unwrap();
    assert!(record.is_completed(&"core".into()));
    assert!(record.patterns.iter().any(|p| p.name == "create:generated"));
    assert_eq!(record.metrics.totals.tokens_used, 20);
    assert_eq!(record.metrics.per_spec["core"].tokens_used, 20);
}

/// Test: Re-running a complete set
/// Complete specs are skipped on the next invocation.
#[tokio::test]
async fn test_second_invocation_skips_complete_specs() {
    let dir = workspace();
    let generator = Arc::new(RecordingGenerator::new());
    let orchestrator = Orchestrator::new(
        dir.path(),
        test_config(),
        collaborators(generator.clone(), ScriptedTestRunner::passing()),
    );
    let set = SpecSet::new("set", vec![spec("core", 1)]);

    orchestrator
        .execute_spec_set(&set, options(true, 2))
        .await
        .unwrap();
    let report = orchestrator
        .execute_spec_set(&set, options(true, 2))
        .await
        .unwrap();
    assert_eq!(report.status, OverallStatus::Complete);
    assert_eq!(report.completed, vec![SpecId::from("core")]);
    assert_eq!(generator.calls(), 1);
}

/// Test: Cancellation before start
/// Nothing is dispatched and every spec is reported blocked.
#[tokio::test]
async fn test_cancelled_run_dispatches_nothing() {
    let dir = workspace();
    let generator = Arc::new(RecordingGenerator::new());
    let token = CancellationToken::new();
    token.cancel();
    let orchestrator = Orchestrator::new(
        dir.path(),
        test_config(),
        collaborators(generator.clone(), ScriptedTestRunner::passing()),
    )
    .with_cancellation(token);
    let set = SpecSet::new("set", vec![spec("core", 1), spec("ui", 1).depends_on("core")]);

    let report = orchestrator
        .execute_spec_set(&set, options(true, 2))
        .await
        .unwrap();
    assert!(report.cancelled);
    assert_eq!(report.blocked.len(), 2);
    assert_eq!(report.status, OverallStatus::Blocked);
    assert_eq!(generator.calls(), 0);
    assert!(!specflow::orchestration::lock_path(dir.path()).exists());
}
