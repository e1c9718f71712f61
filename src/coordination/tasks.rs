//! Durable task registry, persisted as `<root>/.specflow/tasks.json`.
//!
//! Tasks are materialised from spec phases, selected for work level by level,
//! deferred while their spec is blocked and never deleted.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::core::graph::DependencyGraph;
use crate::core::spec::{Spec, SpecId, SpecSet};
use crate::core::task::{Task, TaskId, TaskStatus};
use crate::util::{blocking, read_json, write_json_atomic};
use crate::{sflog_debug, sflog_warn, Error, Result};

const RECORD_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TaskRecord {
    fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    fn get_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| &t.id == id)
    }

    /// A dependency is satisfied when it is done. A fix task may also start
    /// once its origin is no longer in progress, since the origin stays
    /// parked until the fix passes. Unknown ids do not hold work back.
    fn dependency_satisfied(&self, task: &Task, dep: &TaskId) -> bool {
        match self.get(dep) {
            Some(d) if d.is_done() => true,
            Some(d) if task.origin.as_ref() == Some(dep) => d.status != TaskStatus::InProgress,
            Some(_) => false,
            None => true,
        }
    }

    fn is_eligible(&self, task: &Task) -> bool {
        task.status == TaskStatus::Pending
            && task.deferral.is_none()
            && task
                .dependencies
                .iter()
                .all(|dep| self.dependency_satisfied(task, dep))
    }
}

/// Phase progress of one spec derived from its tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseProgress {
    /// First phase, in declaration order, with unfinished tasks.
    pub current_phase: Option<String>,
    pub completed_phases: Vec<String>,
}

pub struct TaskStore {
    path: PathBuf,
    io: Mutex<()>,
}

impl TaskStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            io: Mutex::new(()),
        }
    }

    pub fn open(root: &Path) -> Self {
        Self::new(Config::state_dir(root).join("tasks.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<TaskRecord> {
        let _guard = self.io.lock().await;
        let path = self.path.clone();
        blocking(move || Ok(read_json(&path)?.unwrap_or_default())).await
    }

    async fn mutate<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut TaskRecord) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let _guard = self.io.lock().await;
        let path = self.path.clone();
        blocking(move || {
            let mut record: TaskRecord = read_json(&path)?.unwrap_or_default();
            let out = f(&mut record)?;
            record.version = RECORD_VERSION;
            write_json_atomic(&path, &record)?;
            Ok(out)
        })
        .await
    }

    /// Create tasks for every phase task declared in the set. Ids that already
    /// exist are skipped so re-invocation is safe. Returns the number created.
    pub async fn materialize(&self, set: &SpecSet) -> Result<usize> {
        let mut fresh = Vec::new();
        let mut order = 0;
        for spec in &set.specs {
            for (phase, def) in spec.task_definitions() {
                fresh.push(Task::from_definition(def, &spec.id, &set.id, phase, order));
                order += 1;
            }
        }

        let created = self
            .mutate(move |record| {
                let mut created = 0;
                for task in fresh {
                    if record.get(&task.id).is_none() {
                        record.tasks.push(task);
                        created += 1;
                    }
                }
                Ok(created)
            })
            .await?;
        sflog_debug!("materialize {}: {} new tasks", set.id, created);
        Ok(created)
    }

    pub async fn get(&self, id: &TaskId) -> Result<Option<Task>> {
        Ok(self.load().await?.get(id).cloned())
    }

    pub async fn for_spec(&self, spec_id: &SpecId) -> Result<Vec<Task>> {
        Ok(self
            .load()
            .await?
            .tasks
            .into_iter()
            .filter(|t| &t.spec_id == spec_id)
            .collect())
    }

    /// Apply `f` to one task and persist it.
    pub async fn update<F>(&self, id: &TaskId, f: F) -> Result<Task>
    where
        F: FnOnce(&mut Task) + Send + 'static,
    {
        let id = id.clone();
        self.mutate(move |record| {
            let task = record
                .get_mut(&id)
                .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
            f(task);
            task.updated_at = chrono::Utc::now();
            Ok(task.clone())
        })
        .await
    }

    pub async fn start(&self, id: &TaskId) -> Result<Task> {
        self.update(id, |t| t.start()).await
    }

    pub async fn block(&self, id: &TaskId, reason: &str) -> Result<Task> {
        let reason = reason.to_string();
        self.update(id, move |t| t.block(&reason)).await
    }

    /// Mark a task done. When it is a fix task, its origin chain is resolved
    /// too. Returns every task id marked done.
    pub async fn complete(&self, id: &TaskId) -> Result<Vec<TaskId>> {
        let id = id.clone();
        self.mutate(move |record| {
            let mut done = Vec::new();
            let mut next = Some(id.clone());
            while let Some(current) = next.take() {
                let task = record
                    .get_mut(&current)
                    .ok_or_else(|| Error::TaskNotFound(current.to_string()))?;
                if !task.is_done() {
                    task.complete();
                    done.push(current.clone());
                }
                next = task.origin.clone();
            }
            Ok(done)
        })
        .await
    }

    /// Register a fix task and park its origin until the fix passes.
    pub async fn register_fix_task(&self, fix: Task) -> Result<Task> {
        let origin_id = fix
            .origin
            .clone()
            .ok_or_else(|| Error::Validation(format!("fix task {} has no origin", fix.id)))?;
        let registered = self
            .mutate(move |record| {
                let reason = format!("superseded by fix task {}", fix.id);
                let origin = record
                    .get_mut(&origin_id)
                    .ok_or_else(|| Error::TaskNotFound(origin_id.to_string()))?;
                origin.block(&reason);
                record.tasks.push(fix.clone());
                Ok(fix)
            })
            .await?;
        sflog_debug!(
            "registered fix task {} (retry {})",
            registered.id,
            registered.retry_count
        );
        Ok(registered)
    }

    /// Defer every pending task of `spec_id` on behalf of run `run_id`.
    pub async fn defer_spec_tasks(
        &self,
        spec_id: &SpecId,
        run_id: &str,
        reason: &str,
    ) -> Result<Vec<TaskId>> {
        let spec_id = spec_id.clone();
        let run_id = run_id.to_string();
        let reason = reason.to_string();
        self.mutate(move |record| {
            let mut deferred = Vec::new();
            for task in record
                .tasks
                .iter_mut()
                .filter(|t| t.spec_id == spec_id && t.status == TaskStatus::Pending)
            {
                task.defer(&run_id, &reason);
                deferred.push(task.id.clone());
            }
            Ok(deferred)
        })
        .await
    }

    /// Restore exactly the tasks deferred by `run_id`.
    pub async fn restore_deferred(&self, run_id: &str) -> Result<Vec<TaskId>> {
        let run_id = run_id.to_string();
        let restored = self
            .mutate(move |record| {
                let mut restored = Vec::new();
                for task in record.tasks.iter_mut().filter(|t| t.is_deferred_by(&run_id)) {
                    task.restore();
                    restored.push(task.id.clone());
                }
                Ok(restored)
            })
            .await?;
        if !restored.is_empty() {
            sflog_debug!("restored {} deferred tasks", restored.len());
        }
        Ok(restored)
    }

    /// Put tasks of `spec_id` stranded in progress by a dead run back to pending.
    pub async fn reset_in_progress(&self, spec_id: &SpecId) -> Result<Vec<TaskId>> {
        let spec_id = spec_id.clone();
        self.mutate(move |record| {
            let mut reset = Vec::new();
            for task in record
                .tasks
                .iter_mut()
                .filter(|t| t.spec_id == spec_id && t.status == TaskStatus::InProgress)
            {
                sflog_warn!("task {} was left in progress; returning to pending", task.id);
                task.restore();
                reset.push(task.id.clone());
            }
            Ok(reset)
        })
        .await
    }

    /// Tasks an external worker may pick up: pending, not deferred, with
    /// satisfied dependencies, belonging to the active spec set.
    pub async fn eligible_for_pickup(&self, active_spec_set: Option<&str>) -> Result<Vec<Task>> {
        let Some(active) = active_spec_set else {
            return Ok(Vec::new());
        };
        let record = self.load().await?;
        let mut eligible: Vec<Task> = record
            .tasks
            .iter()
            .filter(|t| t.spec_set_id == active && record.is_eligible(t))
            .cloned()
            .collect();
        sort_for_pickup(&mut eligible);
        Ok(eligible)
    }

    /// Select up to `limit` eligible tasks of one spec from the lowest
    /// dependency level that has any, highest priority first.
    pub async fn select_batch(&self, spec_id: &SpecId, limit: usize) -> Result<Vec<Task>> {
        let record = self.load().await?;
        let spec_tasks: Vec<&Task> = record
            .tasks
            .iter()
            .filter(|t| &t.spec_id == spec_id)
            .collect();

        let mut graph: DependencyGraph<TaskId> = DependencyGraph::new();
        for task in &spec_tasks {
            graph.add_node(task.id.clone());
        }
        // A fix task sits beside its parked origin, not after it.
        for task in &spec_tasks {
            let deps: Vec<TaskId> = task
                .dependencies
                .iter()
                .filter(|d| graph.contains(d) && task.origin.as_ref() != Some(*d))
                .cloned()
                .collect();
            for dep in &deps {
                graph.add_dependency(&task.id, dep)?;
            }
        }

        let by_id: HashMap<&TaskId, &Task> = spec_tasks.iter().map(|t| (&t.id, *t)).collect();
        for level in graph.levels()? {
            let mut eligible: Vec<Task> = level
                .iter()
                .filter_map(|id| by_id.get(id).copied())
                .filter(|t| record.is_eligible(t))
                .cloned()
                .collect();
            if !eligible.is_empty() {
                sort_for_pickup(&mut eligible);
                eligible.truncate(limit.max(1));
                return Ok(eligible);
            }
        }
        Ok(Vec::new())
    }

    /// True when every task of the spec is done.
    pub async fn spec_complete(&self, spec_id: &SpecId) -> Result<bool> {
        Ok(self.for_spec(spec_id).await?.iter().all(Task::is_done))
    }

    /// Derive current and completed phases for `spec` from its tasks.
    pub async fn phase_progress(&self, spec: &Spec) -> Result<PhaseProgress> {
        let tasks = self.for_spec(&spec.id).await?;
        let mut progress = PhaseProgress::default();
        for phase in &spec.phases {
            let finished = tasks
                .iter()
                .filter(|t| t.phase == phase.name)
                .all(Task::is_done);
            if finished {
                progress.completed_phases.push(phase.name.clone());
            } else if progress.current_phase.is_none() {
                progress.current_phase = Some(phase.name.clone());
            }
        }
        Ok(progress)
    }
}

fn sort_for_pickup(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.order.cmp(&b.order)));
}
