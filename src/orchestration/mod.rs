//! Spec-set orchestration: level scheduling, the execution lock and the
//! stall policy shared with the workflow engine.

pub mod lock;
pub mod orchestrator;
pub mod stall;

pub use lock::{lock_path, process_alive, read_lock, unlock, ExecutionLock, LockInfo, UnlockOutcome};
pub use orchestrator::{
    overall_status, ExecutionOptions, ExecutionReport, Orchestrator, OverallStatus, SpecOutcome,
};
pub use stall::{StallDecision, StallPolicy};
