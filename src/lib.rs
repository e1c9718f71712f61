pub mod agents;
pub mod checkpoint;
pub mod config;
pub mod coordination;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod util;
pub mod workflow;

pub use config::Config;
pub use crate::core::spec::{Spec, SpecId, SpecSet};
pub use error::{Error, Result};
pub use orchestration::{ExecutionOptions, ExecutionReport, Orchestrator, OverallStatus};
