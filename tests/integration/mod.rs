//! Integration test suite for specflow.
//!
//! These tests drive the public API end to end against a temporary
//! workspace, with in-process collaborators standing in for the code
//! generator and test runner.
//!
//! # Test Categories
//!
//! - `graph_levels`: Level planning and cycle rejection
//! - `orchestrator_flow`: Spec-set execution, blocking and concurrency limits
//! - `engine_resume`: Checkpoint resume and idempotent apply
//! - `locking`: Execution lock contention and stale-lock recovery
//!
//! # CI Compatibility
//!
//! No test spawns the `claude` binary, so the suite is safe to run in CI.

mod fixtures;

mod engine_resume;
mod graph_levels;
mod locking;
mod orchestrator_flow;
