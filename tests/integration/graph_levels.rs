//! Level planning integration tests.
//!
//! These tests verify that every spec lands strictly after all of its
//! dependencies, and that a cyclic spec set is rejected before anything is
//! written to the workspace.

use std::collections::HashMap;
use std::sync::Arc;

use specflow::core::{plan_levels, SpecDependency, SpecId, SpecSet};
use specflow::orchestration::{ExecutionOptions, Orchestrator};
use specflow::Error;

use crate::fixtures::{collaborators, spec, state_dir, test_config, workspace, RecordingGenerator, ScriptedTestRunner};

fn level_of(levels: &[specflow::core::ExecutionLevel]) -> HashMap<SpecId, usize> {
    levels
        .iter()
        .flat_map(|l| l.specs.iter().map(move |s| (s.clone(), l.index)))
        .collect()
}

/// Test: Diamond dependencies
/// Given api and ui both depending on core, and e2e depending on both
/// When levels are planned
/// Then each spec sits strictly after all of its dependencies
#[test]
fn test_diamond_levels() {
    let specs = vec![
        spec("e2e", 1).depends_on("api").depends_on("ui"),
        spec("ui", 1).depends_on("core"),
        spec("core", 1),
        spec("api", 1).depends_on("core"),
    ];

    let levels = plan_levels(&specs).unwrap();
    assert_eq!(levels.len(), 3);
    assert_eq!(levels[0].specs, vec![SpecId::from("core")]);
    assert_eq!(
        levels[1].specs,
        vec![SpecId::from("ui"), SpecId::from("api")]
    );
    assert_eq!(levels[2].specs, vec![SpecId::from("e2e")]);

    let index = level_of(&levels);
    for s in &specs {
        for dep in s.dependency_ids() {
            assert!(index[dep] < index[&s.id], "{} must follow {}", s.id, dep);
        }
    }
}

/// Test: Ordering-only dependencies still order levels
#[test]
fn test_ordering_only_dependency_orders_levels() {
    let mut docs = spec("docs", 1);
    docs.dependencies.push(SpecDependency::ordering_only("core"));
    let levels = plan_levels(&[docs, spec("core", 1)]).unwrap();

    let index = level_of(&levels);
    assert!(index[&SpecId::from("core")] < index[&SpecId::from("docs")]);
}

/// Test: Every spec appears exactly once
#[test]
fn test_every_spec_planned_once() {
    let specs: Vec<_> = (0..6)
        .map(|i| {
            let s = spec(&format!("s{}", i), 1);
            if i > 0 {
                s.depends_on(&format!("s{}", i / 2))
            } else {
                s
            }
        })
        .collect();

    let levels = plan_levels(&specs).unwrap();
    let planned: usize = levels.iter().map(|l| l.specs.len()).sum();
    assert_eq!(planned, specs.len());
    assert_eq!(level_of(&levels).len(), specs.len());
}

/// Test: Cycle rejection
/// Given a -> b -> c -> a
/// When levels are planned
/// Then CycleDetected names the cycle
#[test]
fn test_cycle_is_rejected() {
    let specs = vec![
        spec("a", 1).depends_on("c"),
        spec("b", 1).depends_on("a"),
        spec("c", 1).depends_on("b"),
    ];

    let err = plan_levels(&specs).unwrap_err();
    match err {
        Error::CycleDetected { path } => {
            for id in ["a", "b", "c"] {
                assert!(path.iter().any(|p| p == id), "cycle path {:?} misses {}", path, id);
            }
        }
        other => panic!("expected CycleDetected, got {:?}", other),
    }
}

/// Test: A cyclic spec set leaves the workspace untouched
#[tokio::test]
async fn test_cyclic_set_writes_nothing() {
    let dir = workspace();
    let generator = Arc::new(RecordingGenerator::new());
    let orchestrator = Orchestrator::new(
        dir.path(),
        test_config(),
        collaborators(generator.clone(), ScriptedTestRunner::passing()),
    );
    let set = SpecSet::new(
        "cyclic",
        vec![spec("a", 1).depends_on("b"), spec("b", 1).depends_on("a")],
    );

    let err = orchestrator
        .execute_spec_set(&set, ExecutionOptions::from_config(&test_config()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CycleDetected { .. }));
    assert!(!state_dir(dir.path()).exists());
    assert_eq!(generator.calls(), 0);
}

/// Test: Unknown dependencies are rejected up front
#[tokio::test]
async fn test_unknown_dependency_is_rejected() {
    let dir = workspace();
    let orchestrator = Orchestrator::new(
        dir.path(),
        test_config(),
        collaborators(Arc::new(RecordingGenerator::new()), ScriptedTestRunner::passing()),
    );
    let set = SpecSet::new("set", vec![spec("ui", 1).depends_on("core")]);

    let err = orchestrator
        .execute_spec_set(&set, ExecutionOptions::from_config(&test_config()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownDependency { .. }));
}
