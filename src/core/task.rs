//! Task data model.
//!
//! Tasks are the atomic units of work the engine advances. They are
//! materialised from spec phases before execution, mutated by the engine and
//! never deleted: fix tasks point back at the task whose failure produced them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use uuid::Uuid;

use crate::core::spec::{SpecId, TaskDefinition};

/// Identifier of a task.
///
/// Planned tasks keep the id declared in their spec. Fix tasks get
/// `<origin>-fix-<8 hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh id for a fix task derived from `origin`.
    pub fn fix_for(origin: &TaskId) -> Self {
        let suffix = Uuid::new_v4().to_string()[..8].to_string();
        Self(format!("{}-fix-{}", origin.0, suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Borrow<str> for TaskId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Blocked,
    Done,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in-progress"),
            TaskStatus::Blocked => write!(f, "blocked"),
            TaskStatus::Done => write!(f, "done"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPriority::Low => write!(f, "low"),
            TaskPriority::Medium => write!(f, "medium"),
            TaskPriority::High => write!(f, "high"),
            TaskPriority::Critical => write!(f, "critical"),
        }
    }
}

/// Where a task came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Declared in a spec phase.
    #[default]
    Planned,
    /// Synthesised from a failure analysis.
    Fix,
}

/// Marks a task parked by a specific orchestrator run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deferral {
    pub run_id: String,
    pub reason: String,
    pub deferred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    pub spec_id: SpecId,
    pub spec_set_id: String,
    pub phase: String,
    #[serde(default)]
    pub kind: TaskKind,
    /// Task whose failure produced this fix task.
    #[serde(default)]
    pub origin: Option<TaskId>,
    /// Position of the fix chain this task belongs to (0 for planned tasks).
    #[serde(default)]
    pub retry_count: u32,
    /// Per-task stall threshold override.
    #[serde(default)]
    pub stall_threshold: Option<u32>,
    #[serde(default)]
    pub files: Vec<String>,
    /// Declaration index inside the spec set; breaks priority ties.
    #[serde(default)]
    pub order: usize,
    #[serde(default)]
    pub blocked_reason: Option<String>,
    #[serde(default)]
    pub deferral: Option<Deferral>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Task {
    /// Materialise a task from a spec phase declaration.
    pub fn from_definition(
        def: &TaskDefinition,
        spec_id: &SpecId,
        spec_set_id: &str,
        phase: &str,
        order: usize,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(def.id.clone()),
            title: def.title.clone(),
            description: def.description.clone(),
            priority: def.priority,
            status: TaskStatus::Pending,
            dependencies: def.dependencies.iter().map(|d| TaskId::new(d.clone())).collect(),
            spec_id: spec_id.clone(),
            spec_set_id: spec_set_id.to_string(),
            phase: phase.to_string(),
            kind: TaskKind::Planned,
            origin: None,
            retry_count: 0,
            stall_threshold: None,
            files: def.files.clone(),
            order,
            blocked_reason: None,
            deferral: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Build a fix task for `origin`.
    ///
    /// The fix task depends on its origin, inherits its spec, phase, files and
    /// ordering, and carries the origin's retry count plus one. Priority is
    /// raised one step so fixes are picked before fresh work.
    pub fn fix_for(origin: &Task, title: &str, description: &str) -> Self {
        let now = Utc::now();
        let priority = match origin.priority {
            TaskPriority::Low => TaskPriority::Medium,
            TaskPriority::Medium => TaskPriority::High,
            TaskPriority::High | TaskPriority::Critical => TaskPriority::Critical,
        };
        Self {
            id: TaskId::fix_for(&origin.id),
            title: title.to_string(),
            description: description.to_string(),
            priority,
            status: TaskStatus::Pending,
            dependencies: vec![origin.id.clone()],
            spec_id: origin.spec_id.clone(),
            spec_set_id: origin.spec_set_id.clone(),
            phase: origin.phase.clone(),
            kind: TaskKind::Fix,
            origin: Some(origin.id.clone()),
            retry_count: origin.retry_count + 1,
            stall_threshold: origin.stall_threshold,
            files: origin.files.clone(),
            order: origin.order,
            blocked_reason: None,
            deferral: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            extra: serde_json::Map::new(),
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn start(&mut self) {
        self.status = TaskStatus::InProgress;
        self.blocked_reason = None;
        self.touch();
    }

    pub fn complete(&mut self) {
        self.status = TaskStatus::Done;
        self.blocked_reason = None;
        self.completed_at = Some(Utc::now());
        self.touch();
    }

    pub fn block(&mut self, reason: &str) {
        self.status = TaskStatus::Blocked;
        self.blocked_reason = Some(reason.to_string());
        self.touch();
    }

    /// Park the task on behalf of orchestrator run `run_id`.
    pub fn defer(&mut self, run_id: &str, reason: &str) {
        self.block(reason);
        self.deferral = Some(Deferral {
            run_id: run_id.to_string(),
            reason: reason.to_string(),
            deferred_at: Utc::now(),
        });
    }

    /// Undo a deferral: back to pending with the deferral metadata stripped.
    pub fn restore(&mut self) {
        self.status = TaskStatus::Pending;
        self.blocked_reason = None;
        self.deferral = None;
        self.touch();
    }

    pub fn is_done(&self) -> bool {
        self.status == TaskStatus::Done
    }

    pub fn is_fix(&self) -> bool {
        self.kind == TaskKind::Fix
    }

    pub fn is_deferred_by(&self, run_id: &str) -> bool {
        self.deferral.as_ref().is_some_and(|d| d.run_id == run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planned(id: &str) -> Task {
        let def = TaskDefinition::new(id, "Add user model");
        Task::from_definition(&def, &SpecId::from("core"), "set-1", "impl", 0)
    }

    // ========== TaskId ==========

    #[test]
    fn test_fix_id_is_derived_from_origin() {
        let origin = TaskId::from("core-1");
        let fix = TaskId::fix_for(&origin);
        assert!(fix.as_str().starts_with("core-1-fix-"));
        assert_eq!(fix.as_str().len(), "core-1-fix-".len() + 8);
        assert_ne!(fix, TaskId::fix_for(&origin));
    }

    #[test]
    fn test_task_id_serializes_transparently() {
        let json = serde_json::to_string(&TaskId::from("t1")).unwrap();
        assert_eq!(json, "\"t1\"");
    }

    // ========== TaskStatus ==========

    #[test]
    fn test_task_status_serialization() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in-progress\"");
        let parsed: TaskStatus = serde_json::from_str("\"done\"").unwrap();
        assert_eq!(parsed, TaskStatus::Done);
    }

    #[test]
    fn test_task_status_display() {
        assert_eq!(TaskStatus::Pending.to_string(), "pending");
        assert_eq!(TaskStatus::InProgress.to_string(), "in-progress");
        assert_eq!(TaskStatus::Blocked.to_string(), "blocked");
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Medium);
        assert!(TaskPriority::Medium > TaskPriority::Low);
    }

    // ========== Task lifecycle ==========

    #[test]
    fn test_from_definition() {
        let task = planned("core-1");
        assert_eq!(task.id.as_str(), "core-1");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.kind, TaskKind::Planned);
        assert_eq!(task.phase, "impl");
        assert!(task.origin.is_none());
    }

    #[test]
    fn test_fix_task_depends_on_origin() {
        let origin = planned("core-1");
        let fix = Task::fix_for(&origin, "Fix core-1", "tests failed");

        assert_eq!(fix.kind, TaskKind::Fix);
        assert_eq!(fix.origin, Some(origin.id.clone()));
        assert_eq!(fix.dependencies, vec![origin.id.clone()]);
        assert_eq!(fix.retry_count, 1);
        assert_eq!(fix.priority, TaskPriority::High);

        let second = Task::fix_for(&fix, "Fix again", "still failing");
        assert_eq!(second.retry_count, 2);
        assert_eq!(second.priority, TaskPriority::Critical);
    }

    #[test]
    fn test_defer_and_restore() {
        let mut task = planned("core-1");
        task.defer("run-a", "dependency core blocked");

        assert_eq!(task.status, TaskStatus::Blocked);
        assert!(task.is_deferred_by("run-a"));
        assert!(!task.is_deferred_by("run-b"));

        task.restore();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.deferral.is_none());
        assert!(task.blocked_reason.is_none());
    }

    #[test]
    fn test_complete_sets_timestamp() {
        let mut task = planned("core-1");
        task.start();
        assert_eq!(task.status, TaskStatus::InProgress);
        task.complete();
        assert!(task.is_done());
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn test_unknown_fields_round_trip() {
        let mut value = serde_json::to_value(planned("core-1")).unwrap();
        value["owner"] = serde_json::json!("platform-team");

        let task: Task = serde_json::from_value(value).unwrap();
        assert_eq!(task.extra["owner"], "platform-team");

        let back = serde_json::to_value(&task).unwrap();
        assert_eq!(back["owner"], "platform-team");
    }
}
