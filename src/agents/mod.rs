//! External collaborator contracts and their shipped implementations.
//!
//! The engine and orchestrator only see the traits below. Each returns a
//! boxed future so collaborators can be held as `Arc<dyn ...>` and swapped
//! for mocks in tests.

pub mod claude;
#[cfg(test)]
pub mod mock;
pub mod shell;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::core::spec::{Prerequisite, SpecId};
use crate::Result;

pub use claude::{ClaudeCodeGenerator, ClaudeFailureAnalyzer, ClaudeHeadless, ClaudeResponse};
pub use shell::{ShellPrerequisiteExecutor, ShellTestRunner};

// ========== Code generation ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    Create,
    Update,
    Patch,
    Delete,
}

impl std::fmt::Display for FileOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileOperation::Create => write!(f, "create"),
            FileOperation::Update => write!(f, "update"),
            FileOperation::Patch => write!(f, "patch"),
            FileOperation::Delete => write!(f, "delete"),
        }
    }
}

/// One search/replace entry of a patch operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchEntry {
    pub search: String,
    pub replace: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub operation: FileOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patches: Option<Vec<PatchEntry>>,
}

impl FileChange {
    pub fn create(path: &str, content: &str) -> Self {
        Self {
            path: path.to_string(),
            operation: FileOperation::Create,
            content: Some(content.to_string()),
            patches: None,
        }
    }

    pub fn patch(path: &str, search: &str, replace: &str) -> Self {
        Self {
            path: path.to_string(),
            operation: FileOperation::Patch,
            content: None,
            patches: Some(vec![PatchEntry {
                search: search.to_string(),
                replace: replace.to_string(),
            }]),
        }
    }

    pub fn delete(path: &str) -> Self {
        Self {
            path: path.to_string(),
            operation: FileOperation::Delete,
            content: None,
            patches: None,
        }
    }
}

/// The generator's reply: a list of file operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    #[serde(default)]
    pub files: Vec<FileChange>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextFile {
    pub path: String,
    pub content: String,
    /// True when `content` was cut at the per-file limit.
    #[serde(default)]
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub context: Vec<ContextFile>,
    pub workdir: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationOutput {
    pub change_set: ChangeSet,
    pub tokens_used: u64,
}

pub trait CodeGenerator: Send + Sync + 'static {
    fn generate<'a>(&'a self, request: &'a GenerationRequest)
        -> BoxFuture<'a, Result<GenerationOutput>>;
}

// ========== Test execution ==========

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRequest {
    pub spec_id: SpecId,
    pub command: Option<String>,
    pub workdir: PathBuf,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub duration_ms: u64,
}

pub trait TestRunner: Send + Sync + 'static {
    fn run<'a>(&'a self, request: &'a TestRequest) -> BoxFuture<'a, Result<TestOutcome>>;
}

// ========== Failure analysis ==========

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisSource {
    Ai,
    #[default]
    Pattern,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureAnalysis {
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub recommendations: Vec<String>,
    /// Signature names that matched, when pattern matching produced this.
    #[serde(default)]
    pub signatures: Vec<String>,
    #[serde(default)]
    pub source: AnalysisSource,
}

pub trait FailureAnalyzer: Send + Sync + 'static {
    fn analyze<'a>(&'a self, error_text: &'a str) -> BoxFuture<'a, Result<FailureAnalysis>>;
}

// ========== Prerequisites ==========

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrerequisiteOutcome {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

pub trait PrerequisiteExecutor: Send + Sync + 'static {
    fn run<'a>(&'a self, check: &'a Prerequisite) -> BoxFuture<'a, Result<PrerequisiteOutcome>>;
}

/// Every collaborator one orchestrator run needs.
#[derive(Clone)]
pub struct Collaborators {
    pub generator: Arc<dyn CodeGenerator>,
    pub test_runner: Arc<dyn TestRunner>,
    /// Optional; the engine falls back to signature matching without it.
    pub analyzer: Option<Arc<dyn FailureAnalyzer>>,
    pub prerequisites: Arc<dyn PrerequisiteExecutor>,
}
