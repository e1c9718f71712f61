//! Core domain models: specs, tasks and the dependency resolver.

pub mod graph;
pub mod spec;
pub mod task;

pub use graph::{
    build_graph, detect_cycles, plan_levels, resolve_execution_levels, DependencyGraph,
    ExecutionLevel, SpecGraph,
};
pub use spec::{
    ManifestFile, Phase, Prerequisite, PrerequisiteCheck, Spec, SpecConfigOverlay,
    SpecDependency, SpecId, SpecSet, SpecSource, TaskDefinition,
};
pub use task::{Deferral, Task, TaskId, TaskKind, TaskPriority, TaskStatus};
