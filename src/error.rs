use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Dependency cycle detected: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    #[error("Spec '{spec}' depends on unknown spec '{dependency}'")]
    UnknownDependency { spec: String, dependency: String },

    #[error("Spec not found: {0}")]
    SpecNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error("Execution lock {} is held by running process {pid}", path.display())]
    LockHeld { pid: u32, path: PathBuf },

    #[error("Execution lock {} exists but could not be read; another run may be starting", path.display())]
    LockUnreadable { path: PathBuf },

    #[error("Dependency '{dependency}' of spec '{spec}' is {status}")]
    DependencyFailed {
        spec: String,
        dependency: String,
        status: String,
    },

    #[error("Timed out after {waited:?} waiting for dependencies of '{spec}': {pending:?}")]
    DependencyTimeout {
        spec: String,
        pending: Vec<String>,
        waited: std::time::Duration,
    },

    #[error("Spec '{0}' already has an active state writer")]
    SpecClaimed(String),

    #[error("Code generation failed: {0}")]
    Generation(String),

    #[error("Claude binary not found in PATH")]
    ClaudeBinaryNotFound,

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),
}

pub type Result<T> = std::result::Result<T, Error>;
