//! Unit workflow engine.
//!
//! One run takes a single task of a spec through
//! fetch, context, generation, validation, apply and tests, escalating
//! failures into fix tasks or, past the stall threshold, into advisory
//! suggestions. State is checkpointed after every transition.

pub mod analysis;
pub mod apply;
pub mod context;
pub mod engine;
pub mod learnings;
pub mod nodes;
pub mod state;
pub mod types;
pub mod validate;

pub use apply::{
    apply_change_set, ExactMatcher, FuzzyMatcher, MatcherChain, PatchMatcher,
    PermissiveLineMatcher,
};
pub use engine::{RunRequest, WorkflowEngine};
pub use learnings::{extract_learnings, to_shared_patterns};
pub use state::{StatePatch, Transition, WorkflowState};
pub use types::{
    ApplyResult, Learning, LearningKind, Node, RunId, RunMetrics, RunStatus, ValidationReport,
    ValidationWarning,
};
pub use validate::{filter_to_scope, validate_change_set};
