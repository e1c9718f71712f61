//! Per-run workflow state and the patches nodes return.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::types::{
    ApplyResult, Learning, Node, RunId, RunMetrics, RunStatus, ValidationReport,
};
use crate::agents::{ChangeSet, ContextFile, FailureAnalysis, TestOutcome};
use crate::checkpoint::SharedPattern;
use crate::core::spec::SpecId;
use crate::core::task::{Task, TaskId};

/// Mutable record of one engine run. Checkpointed after every node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub thread_id: String,
    pub run_id: RunId,
    pub spec_id: SpecId,
    pub spec_set_id: String,
    pub status: RunStatus,
    /// Next node to execute.
    pub node: Node,
    #[serde(default)]
    pub fetched_tasks: Vec<TaskId>,
    #[serde(default)]
    pub current_task: Option<Task>,
    #[serde(default)]
    pub context: Vec<ContextFile>,
    #[serde(default)]
    pub change_set: Option<ChangeSet>,
    #[serde(default)]
    pub validation: Option<ValidationReport>,
    #[serde(default)]
    pub apply_result: Option<ApplyResult>,
    #[serde(default)]
    pub test_result: Option<TestOutcome>,
    /// Error text handed to failure analysis.
    #[serde(default)]
    pub failure_text: Option<String>,
    #[serde(default)]
    pub failure_analysis: Option<FailureAnalysis>,
    #[serde(default)]
    pub fix_task: Option<TaskId>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    /// Append-only.
    #[serde(default)]
    pub learnings: Vec<Learning>,
    #[serde(default)]
    pub modified_files: BTreeSet<String>,
    /// Patterns other specs shared, fed into the generation prompt.
    #[serde(default)]
    pub shared_patterns: Vec<SharedPattern>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub metrics: RunMetrics,
}

impl WorkflowState {
    pub fn new(thread_id: &str, spec_id: SpecId, spec_set_id: &str) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            run_id: RunId::new(),
            spec_id,
            spec_set_id: spec_set_id.to_string(),
            status: RunStatus::Pending,
            node: Node::Start,
            fetched_tasks: Vec::new(),
            current_task: None,
            context: Vec::new(),
            change_set: None,
            validation: None,
            apply_result: None,
            test_result: None,
            failure_text: None,
            failure_analysis: None,
            fix_task: None,
            suggestions: Vec::new(),
            learnings: Vec::new(),
            modified_files: BTreeSet::new(),
            shared_patterns: Vec::new(),
            error: None,
            message: None,
            metrics: RunMetrics::default(),
        }
    }

    /// Merge a node's patch into the state.
    pub fn apply(&mut self, patch: StatePatch) {
        let StatePatch {
            status,
            fetched_tasks,
            current_task,
            context,
            change_set,
            validation,
            apply_result,
            test_result,
            failure_text,
            failure_analysis,
            fix_task,
            suggestions,
            learnings,
            modified_files,
            error,
            message,
            tokens_used,
            retries,
            stalled,
        } = patch;

        if let Some(v) = status {
            self.status = v;
        }
        if let Some(v) = fetched_tasks {
            self.fetched_tasks = v;
        }
        if let Some(v) = current_task {
            self.current_task = Some(v);
        }
        if let Some(v) = context {
            self.context = v;
        }
        if let Some(v) = change_set {
            self.change_set = Some(v);
        }
        if let Some(v) = validation {
            self.validation = Some(v);
        }
        if let Some(v) = apply_result {
            self.apply_result = Some(v);
        }
        if let Some(v) = test_result {
            self.test_result = Some(v);
        }
        if let Some(v) = failure_text {
            self.failure_text = Some(v);
        }
        if let Some(v) = failure_analysis {
            self.failure_analysis = Some(v);
        }
        if let Some(v) = fix_task {
            self.fix_task = Some(v);
        }
        self.suggestions.extend(suggestions);
        self.learnings.extend(learnings);
        self.modified_files.extend(modified_files);
        if let Some(v) = error {
            self.error = Some(v);
        }
        if let Some(v) = message {
            self.message = Some(v);
        }
        self.metrics.tokens_used += tokens_used;
        if let Some(v) = retries {
            self.metrics.retries = v;
        }
        if let Some(v) = stalled {
            self.metrics.stalled = v;
        }
    }

    /// Take `transition` out of `node`. An edge the state machine does not
    /// permit fails the run instead, and its patch is dropped.
    pub fn advance(&mut self, node: Node, transition: Transition) -> bool {
        if !node.can_transition_to(transition.next) {
            self.fail(node, &format!("illegal transition to {}", transition.next));
            return false;
        }
        self.apply(transition.patch);
        self.node = transition.next;
        true
    }

    /// Record a node error as terminal failure.
    pub fn fail(&mut self, node: Node, error: &str) {
        self.status = RunStatus::Failed;
        self.error = Some(format!("{} failed: {}", node, error));
        self.node = Node::End;
    }

    /// True when fetch found nothing to work on.
    pub fn nothing_to_do(&self) -> bool {
        self.status == RunStatus::Complete && self.current_task.is_none()
    }

    pub fn tests_passed(&self) -> bool {
        self.test_result.as_ref().is_some_and(|t| t.success)
    }
}

/// Field updates produced by one node. Scalars and records replace, lists
/// append, token counts add.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    pub status: Option<RunStatus>,
    pub fetched_tasks: Option<Vec<TaskId>>,
    pub current_task: Option<Task>,
    pub context: Option<Vec<ContextFile>>,
    pub change_set: Option<ChangeSet>,
    pub validation: Option<ValidationReport>,
    pub apply_result: Option<ApplyResult>,
    pub test_result: Option<TestOutcome>,
    pub failure_text: Option<String>,
    pub failure_analysis: Option<FailureAnalysis>,
    pub fix_task: Option<TaskId>,
    pub suggestions: Vec<String>,
    pub learnings: Vec<Learning>,
    pub modified_files: Vec<String>,
    pub error: Option<String>,
    pub message: Option<String>,
    pub tokens_used: u64,
    pub retries: Option<u32>,
    pub stalled: Option<bool>,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn failure_text(mut self, text: impl Into<String>) -> Self {
        self.failure_text = Some(text.into());
        self
    }
}

/// A node's outcome: where to go next and what to change.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: Node,
    pub patch: StatePatch,
}

impl Transition {
    pub fn to(next: Node) -> Self {
        Self {
            next,
            patch: StatePatch::default(),
        }
    }

    pub fn with(next: Node, patch: StatePatch) -> Self {
        Self { next, patch }
    }
}
