//! Core workflow type definitions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::core::task::TaskId;

/// Unique identifier for one engine run or one orchestrator invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Nodes of the unit workflow state machine.
///
/// ```text
/// start -> fetch -> build-context -> generate -> validate -> apply -> run-tests
///            |                          |           |          |         |  |
///           end              capture-learnings   analyze-failure <------+  |
///                                  ^                  |                    |
///                                  +-- create-fix-task                     |
///                                  +-- suggest-improvements <--------------+
/// capture-learnings -> end
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Node {
    Start,
    Fetch,
    BuildContext,
    Generate,
    Validate,
    Apply,
    RunTests,
    AnalyzeFailure,
    CreateFixTask,
    SuggestImprovements,
    CaptureLearnings,
    End,
}

impl Node {
    pub fn is_end(&self) -> bool {
        matches!(self, Node::End)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Node::Start => "start",
            Node::Fetch => "fetch",
            Node::BuildContext => "build-context",
            Node::Generate => "generate",
            Node::Validate => "validate",
            Node::Apply => "apply",
            Node::RunTests => "run-tests",
            Node::AnalyzeFailure => "analyze-failure",
            Node::CreateFixTask => "create-fix-task",
            Node::SuggestImprovements => "suggest-improvements",
            Node::CaptureLearnings => "capture-learnings",
            Node::End => "end",
        }
    }

    /// Edges the state machine permits out of this node.
    pub fn successors(&self) -> &'static [Node] {
        use Node::*;
        match self {
            Start => &[Fetch],
            Fetch => &[BuildContext, End],
            BuildContext => &[Generate],
            Generate => &[Validate, CaptureLearnings],
            Validate => &[Apply, AnalyzeFailure],
            Apply => &[RunTests, AnalyzeFailure],
            RunTests => &[CaptureLearnings, AnalyzeFailure, SuggestImprovements],
            AnalyzeFailure => &[CreateFixTask],
            CreateFixTask => &[CaptureLearnings],
            SuggestImprovements => &[CaptureLearnings],
            CaptureLearnings => &[End],
            End => &[],
        }
    }

    pub fn can_transition_to(&self, next: Node) -> bool {
        self.successors().contains(&next)
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of one engine run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Complete,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Complete | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Complete => write!(f, "complete"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A convention-level finding from validation; does not reject the change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationWarning {
    pub code: String,
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<ValidationWarning>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub success: bool,
    /// Files whose content actually changed.
    #[serde(default)]
    pub modified_files: Vec<String>,
    /// Files whose operation was already in effect.
    #[serde(default)]
    pub unchanged_files: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningKind {
    /// From a successful run.
    Pattern,
    /// From a failure.
    Gotcha,
    /// From a validation warning.
    Convention,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Learning {
    pub kind: LearningKind,
    pub name: String,
    pub guidance: String,
    #[serde(default)]
    pub task_id: Option<TaskId>,
}

/// Counters and timings for one engine run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetrics {
    #[serde(default)]
    pub tokens_used: u64,
    /// Wall time spent per node, accumulated across visits.
    #[serde(default)]
    pub node_timings_ms: BTreeMap<String, u64>,
    #[serde(default)]
    pub duration_ms: u64,
    /// Retry count of the current task's fix chain.
    #[serde(default)]
    pub retries: u32,
    /// Failed engine runs earlier in this spec invocation.
    #[serde(default)]
    pub spec_retries: u32,
    #[serde(default)]
    pub stalled: bool,
}

impl RunMetrics {
    pub fn record_node(&mut self, node: Node, elapsed_ms: u64) {
        *self.node_timings_ms.entry(node.to_string()).or_default() += elapsed_ms;
        self.duration_ms += elapsed_ms;
    }
}
