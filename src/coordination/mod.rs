//! Cross-spec coordination: spec lifecycle record, task registry and
//! prerequisite validation.

pub mod prerequisites;
pub mod store;
pub mod tasks;

pub use prerequisites::{PrerequisiteReport, PrerequisiteResult, PrerequisiteValidator};
pub use store::{
    CoordinationRecord, CoordinationStore, SpecState, SpecStateHandle, SpecStatePatch, SpecStatus,
    WaitOptions,
};
pub use tasks::{PhaseProgress, TaskRecord, TaskStore};
