//! Checkpoint resume integration tests.
//!
//! These tests verify that an interrupted engine run picks up at the
//! recorded next node instead of regenerating, and that re-applying an
//! already applied change set is a no-op.

use std::sync::Arc;

use specflow::agents::{ChangeSet, FileChange};
use specflow::checkpoint::CheckpointStore;
use specflow::coordination::TaskStore;
use specflow::core::{SpecSet, TaskStatus};
use specflow::orchestration::{ExecutionOptions, Orchestrator, OverallStatus};
use specflow::workflow::{
    apply_change_set, Learning, LearningKind, MatcherChain, Node, RunStatus, StatePatch,
    WorkflowState,
};

use crate::fixtures::{collaborators, spec, test_config, workspace, RecordingGenerator, ScriptedTestRunner};

/// Test: Checkpoint round trip
/// A saved workflow state reads back identical.
#[tokio::test]
async fn test_checkpoint_round_trip() {
    let dir = workspace();
    let store = CheckpointStore::open(dir.path(), 5);

    let mut state = WorkflowState::new("set--core", "core".into(), "set");
    state.apply(StatePatch {
        status: Some(RunStatus::Running),
        modified_files: vec!["src/lib.rs".into(), "src/main.rs".into()],
        learnings: vec![Learning {
            kind: LearningKind::Gotcha,
            name: "gotcha:syntax".into(),
            guidance: "Balance braces before applying".into(),
            task_id: Some("core-1".into()),
        }],
        ..Default::default()
    });
    state.node = Node::Validate;

    store.save("set--core", "validate", false, &state).await.unwrap();
    let latest = store.load_latest("set--core").await.unwrap().unwrap();
    assert_eq!(latest.node, "validate");
    assert!(!latest.terminal);
    let restored: WorkflowState = latest.state_as().unwrap();
    assert_eq!(restored, state);
    assert_eq!(restored.learnings.len(), 1);
    assert_eq!(restored.modified_files.len(), 2);
}

/// Test: Retention
/// Only the newest checkpoints per thread survive.
#[tokio::test]
async fn test_checkpoint_retention() {
    let dir = workspace();
    let store = CheckpointStore::open(dir.path(), 3);
    let state = WorkflowState::new("t", "core".into(), "set");
    for _ in 0..5 {
        store.save("t", "start", false, &state).await.unwrap();
    }

    let kept = store.list("t").await.unwrap();
    assert_eq!(kept.len(), 3);
    assert_eq!(kept.last().unwrap().seq, 5);
}

/// Test: Crash after apply
/// Given a non-terminal checkpoint at run-tests with the task in progress
/// When the spec set runs again
/// Then the run resumes without calling the generator and completes the task
#[tokio::test]
async fn test_resume_skips_generation() {
    let dir = workspace();
    let set = SpecSet::new("set", vec![spec("core", 1)]);
    let config = test_config();

    let tasks = TaskStore::open(dir.path());
    tasks.materialize(&set).await.unwrap();
    let task = tasks.start(&"core-1".into()).await.unwrap();

    let mut crashed = WorkflowState::new("set--core", "core".into(), "set");
    crashed.apply(StatePatch {
        status: Some(RunStatus::Running),
        current_task: Some(task),
        change_set: Some(ChangeSet {
            files: vec![FileChange::create("src/core.rs", "pub fn core() {}\n")],
        }),
        modified_files: vec!["src/core.rs".into()],
        ..Default::default()
    });
    crashed.node = Node::RunTests;
    CheckpointStore::open(dir.path(), config.checkpoint_retention)
        .save("set--core", "run-tests", false, &crashed)
        .await
        .unwrap();

    let generator = Arc::new(RecordingGenerator::new());
    let orchestrator = Orchestrator::new(
        dir.path(),
        config.clone(),
        collaborators(generator.clone(), ScriptedTestRunner::passing()),
    );
    let report = orchestrator
        .execute_spec_set(&set, ExecutionOptions::from_config(&config))
        .await
        .unwrap();

    assert_eq!(report.status, OverallStatus::Complete);
    assert_eq!(generator.calls(), 0);
    let task = tasks.get(&"core-1".into()).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Done);

    // The resumed run kept its identity.
    let checkpoints = orchestrator.checkpoints().list("set--core").await.unwrap();
    let finished: WorkflowState = checkpoints
        .iter()
        .find(|c| c.terminal)
        .unwrap()
        .state_as()
        .unwrap();
    assert_eq!(finished.run_id, crashed.run_id);
}

/// Test: Idempotent apply
/// Applying the same change set twice leaves the second pass unchanged.
#[tokio::test]
async fn test_reapply_is_noop() {
    let dir = workspace();
    std::fs::create_dir_all(dir.path().join("src")).unwrap();
    std::fs::write(
        dir.path().join("src/lib.rs"),
        "pub fn answer() -> u32 {\n    41\n}\n",
    )
    .unwrap();

    let change_set = ChangeSet {
        files: vec![
            FileChange::patch(
                "src/lib.rs",
                "pub fn answer() -> u32 {\n    41\n",
                "pub fn answer() -> u32 {\n    42\n",
            ),
            FileChange::create("src/extra.rs", "pub struct Extra;\n"),
        ],
    };
    let chain = MatcherChain::default();

    let first = apply_change_set(dir.path(), &change_set, &chain).await.unwrap();
    assert!(first.success);
    assert_eq!(first.modified_files.len(), 2);

    let second = apply_change_set(dir.path(), &change_set, &chain).await.unwrap();
    assert!(second.success);
    assert!(second.modified_files.is_empty());
    assert_eq!(second.unchanged_files.len(), 2);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("src/lib.rs")).unwrap(),
        "pub fn answer() -> u32 {\n    42\n}\n"
    );
}
