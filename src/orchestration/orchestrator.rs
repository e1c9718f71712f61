//! Spec-set execution.
//!
//! Levels run strictly in order. Inside a level, specs run in fixed windows
//! of at most `max_concurrent` engine-driven spec runs; a window settles
//! completely before the next one starts. Cleanup (deferred-task restore and
//! lock removal) runs whatever the outcome.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::lock::ExecutionLock;
use crate::agents::Collaborators;
use crate::checkpoint::{AggregatedMetrics, CheckpointStore, SharedPattern, SharedStateStore, SpecMetrics};
use crate::config::Config;
use crate::coordination::{
    CoordinationStore, PrerequisiteValidator, SpecStatePatch, SpecStatus, TaskStore, WaitOptions,
};
use crate::core::graph::{plan_levels, ExecutionLevel};
use crate::core::spec::{Spec, SpecId, SpecSet};
use crate::workflow::{to_shared_patterns, RunId, RunRequest, RunStatus, WorkflowEngine};
use crate::{sflog, sflog_debug, sflog_error, sflog_warn, Error, Result};

/// Patterns from the shared record handed to each spec run.
const SHARED_PATTERN_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOptions {
    pub parallel: bool,
    pub max_concurrent: usize,
    pub skip_prerequisites: bool,
}

impl ExecutionOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            parallel: config.parallel,
            max_concurrent: config.max_concurrent,
            skip_prerequisites: config.skip_prerequisites,
        }
    }

    pub fn window_size(&self) -> usize {
        if self.parallel {
            self.max_concurrent.max(1)
        } else {
            1
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Complete,
    Blocked,
    Failed,
}

impl std::fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverallStatus::Complete => write!(f, "complete"),
            OverallStatus::Blocked => write!(f, "blocked"),
            OverallStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Any blocked spec makes the set blocked. Otherwise failures with nothing
/// completed make it failed, and failures alongside completions make it
/// blocked.
pub fn overall_status(completed: usize, failed: usize, blocked: usize) -> OverallStatus {
    if blocked > 0 {
        OverallStatus::Blocked
    } else if failed > 0 && completed == 0 {
        OverallStatus::Failed
    } else if failed > 0 {
        OverallStatus::Blocked
    } else {
        OverallStatus::Complete
    }
}

/// Terminal result of one spec within an invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpecOutcome {
    pub spec_id: SpecId,
    pub status: SpecStatus,
    pub message: Option<String>,
    pub metrics: SpecMetrics,
    #[serde(skip)]
    pub patterns: Vec<SharedPattern>,
    pub suggestions: Vec<String>,
}

impl SpecOutcome {
    fn failed(spec_id: SpecId, message: String) -> Self {
        Self {
            spec_id,
            status: SpecStatus::Failed,
            message: Some(message),
            metrics: SpecMetrics::default(),
            patterns: Vec::new(),
            suggestions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionReport {
    pub spec_set_id: String,
    pub run_id: String,
    pub status: OverallStatus,
    pub levels: Vec<ExecutionLevel>,
    pub completed: Vec<SpecId>,
    pub failed: Vec<SpecId>,
    pub blocked: Vec<SpecId>,
    pub messages: Vec<String>,
    /// Metrics of this invocation only.
    pub metrics: AggregatedMetrics,
    pub cancelled: bool,
}

impl ExecutionReport {
    fn new(spec_set_id: &str, run_id: &str, levels: Vec<ExecutionLevel>) -> Self {
        Self {
            spec_set_id: spec_set_id.to_string(),
            run_id: run_id.to_string(),
            status: OverallStatus::Complete,
            levels,
            completed: Vec::new(),
            failed: Vec::new(),
            blocked: Vec::new(),
            messages: Vec::new(),
            metrics: AggregatedMetrics::default(),
            cancelled: false,
        }
    }

    fn record(&mut self, outcome: &SpecOutcome) {
        let id = outcome.spec_id.clone();
        match outcome.status {
            SpecStatus::Complete => self.completed.push(id),
            SpecStatus::Blocked => self.blocked.push(id),
            _ => self.failed.push(id),
        }
        if let Some(message) = &outcome.message {
            self.messages
                .push(format!("{}: {}", outcome.spec_id, message));
        }
        for suggestion in &outcome.suggestions {
            self.messages
                .push(format!("{}: suggestion: {}", outcome.spec_id, suggestion));
        }
        self.metrics
            .per_spec
            .entry(outcome.spec_id.to_string())
            .or_default()
            .add(&outcome.metrics);
        self.metrics.totals.add(&outcome.metrics);
    }

    fn finish(&mut self) {
        self.status = overall_status(self.completed.len(), self.failed.len(), self.blocked.len());
    }
}

/// Everything a spawned spec run needs, cheaply cloned per spec.
#[derive(Clone)]
struct SpecRunner {
    engine: Arc<WorkflowEngine>,
    coordination: Arc<CoordinationStore>,
    tasks: Arc<TaskStore>,
    config: Config,
    spec_set_id: String,
    cancel: CancellationToken,
}

impl SpecRunner {
    /// Run one spec to a terminal state. Errors become a failed outcome.
    async fn run(self, spec: Spec, patterns: Vec<SharedPattern>) -> SpecOutcome {
        let spec_id = spec.id.clone();
        match self.drive(&spec, patterns).await {
            Ok(outcome) => outcome,
            Err(e) => {
                sflog_error!("spec {} failed: {}", spec_id, e);
                let message = e.to_string();
                if let Err(update_err) = self
                    .coordination
                    .update_spec_state(&spec_id, SpecStatePatch::failed(message.clone()))
                    .await
                {
                    sflog_warn!("could not record failure of {}: {}", spec_id, update_err);
                }
                SpecOutcome::failed(spec_id, message)
            }
        }
    }

    async fn drive(&self, spec: &Spec, patterns: Vec<SharedPattern>) -> Result<SpecOutcome> {
        let handle = self.coordination.claim(&spec.id)?;
        handle
            .update(SpecStatePatch::status(SpecStatus::Running))
            .await?;

        let thread_id = format!("{}--{}", self.spec_set_id, spec.id);
        if self.engine.resumable(&thread_id).await?.is_none() {
            self.tasks.reset_in_progress(&spec.id).await?;
        }

        let max_iterations = self
            .config
            .with_overlay(spec.config.as_ref())
            .max_iterations_per_spec;
        let mut metrics = SpecMetrics::default();
        let mut emitted = Vec::new();
        let mut suggestions = Vec::new();
        let mut failures = 0u32;
        let mut last_error: Option<String> = None;
        let mut exhausted = true;

        for _ in 0..max_iterations {
            if self.cancel.is_cancelled() {
                last_error = Some("cancelled".to_string());
                exhausted = false;
                break;
            }

            let state = self
                .engine
                .run(&RunRequest {
                    thread_id: thread_id.clone(),
                    spec: spec.clone(),
                    spec_set_id: self.spec_set_id.clone(),
                    shared_patterns: patterns.clone(),
                    spec_retries: failures,
                })
                .await?;

            metrics.engine_runs += 1;
            metrics.tokens_used += state.metrics.tokens_used;
            metrics.duration_ms += state.metrics.duration_ms;
            if state.metrics.retries > 0 {
                metrics.retries += 1;
            }
            if state.fix_task.is_some() {
                metrics.fix_tasks += 1;
            }
            if state.metrics.stalled {
                metrics.stalls += 1;
            }
            emitted.extend(to_shared_patterns(&state.learnings));
            suggestions.extend(state.suggestions.iter().cloned());

            let progress = self.tasks.phase_progress(spec).await?;
            handle
                .update(
                    SpecStatePatch::default()
                        .with_phases(progress.current_phase, progress.completed_phases),
                )
                .await?;

            if state.nothing_to_do() {
                exhausted = false;
                break;
            }
            if state.status == RunStatus::Failed {
                failures += 1;
                last_error = state.error.clone();
                if state.fix_task.is_none() {
                    exhausted = false;
                    break;
                }
            }
        }

        let complete = self.tasks.spec_complete(&spec.id).await?;
        let (status, patch, message) = if complete {
            (
                SpecStatus::Complete,
                SpecStatePatch {
                    last_error: Some(None),
                    ..SpecStatePatch::status(SpecStatus::Complete)
                },
                None,
            )
        } else {
            let reason = match last_error {
                Some(error) => error,
                None if exhausted => format!("stopped after {} engine runs", max_iterations),
                None => "tasks remain unfinished".to_string(),
            };
            (
                SpecStatus::Failed,
                SpecStatePatch::failed(reason.clone()),
                Some(reason),
            )
        };
        handle.update(patch).await?;
        sflog!(
            "spec {} {} after {} engine run(s)",
            spec.id,
            status,
            metrics.engine_runs
        );

        Ok(SpecOutcome {
            spec_id: spec.id.clone(),
            status,
            message,
            metrics,
            patterns: emitted,
            suggestions,
        })
    }
}

pub struct Orchestrator {
    root: PathBuf,
    config: Config,
    coordination: Arc<CoordinationStore>,
    tasks: Arc<TaskStore>,
    checkpoints: Arc<CheckpointStore>,
    shared: Arc<SharedStateStore>,
    collaborators: Collaborators,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Orchestrator over the stores under `<root>/.specflow`.
    pub fn new(root: &Path, config: Config, collaborators: Collaborators) -> Self {
        Self {
            root: root.to_path_buf(),
            coordination: Arc::new(CoordinationStore::open(root)),
            tasks: Arc::new(TaskStore::open(root)),
            checkpoints: Arc::new(CheckpointStore::open(root, config.checkpoint_retention)),
            shared: Arc::new(SharedStateStore::open(root)),
            config,
            collaborators,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn coordination(&self) -> &Arc<CoordinationStore> {
        &self.coordination
    }

    pub fn tasks(&self) -> &Arc<TaskStore> {
        &self.tasks
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.checkpoints
    }

    pub fn shared(&self) -> &Arc<SharedStateStore> {
        &self.shared
    }

    /// Execute every spec of `set` level by level.
    ///
    /// Only structural errors (cycles, unknown dependencies), a live
    /// competing lock and I/O failures of the persisted records are returned
    /// as errors. Spec failures are reported in the `ExecutionReport`.
    pub async fn execute_spec_set(
        &self,
        set: &SpecSet,
        options: ExecutionOptions,
    ) -> Result<ExecutionReport> {
        set.validate()?;
        // Resolved before the lock so a cycle leaves no trace on disk.
        let levels = plan_levels(&set.specs)?;

        let lock = ExecutionLock::acquire(&self.root, &set.id).await?;
        let run = RunId::new();
        let run_id = run.to_string();
        crate::log::set_scope(Some(format!("{}@{}", set.id, run.short())));
        sflog!(
            "executing spec set {} (run {}): {} spec(s) in {} level(s)",
            set.id,
            run_id,
            set.specs.len(),
            levels.len()
        );

        let result = self.execute_locked(set, levels, options, &run_id).await;

        let restored = self.tasks.restore_deferred(&run_id).await;
        let released = lock.release().await;
        crate::log::set_scope(None);

        let mut report = result?;
        let restored = restored?;
        released?;
        if !restored.is_empty() {
            report
                .messages
                .push(format!("restored {} deferred task(s)", restored.len()));
        }
        sflog!(
            "spec set {} finished {}: {} complete, {} failed, {} blocked",
            set.id,
            report.status,
            report.completed.len(),
            report.failed.len(),
            report.blocked.len()
        );
        Ok(report)
    }

    async fn execute_locked(
        &self,
        set: &SpecSet,
        levels: Vec<ExecutionLevel>,
        options: ExecutionOptions,
        run_id: &str,
    ) -> Result<ExecutionReport> {
        let spec_ids: Vec<SpecId> = set.specs.iter().map(|s| s.id.clone()).collect();
        self.coordination.record_spec_set(&set.specs).await?;
        let reopened = self.coordination.reopen_for_invocation(&spec_ids).await?;
        if !reopened.is_empty() {
            sflog_debug!("reopened {} spec(s) from an earlier run", reopened.len());
        }
        self.coordination.set_active_spec_set_id(Some(&set.id)).await?;
        let created = self.tasks.materialize(set).await?;
        sflog_debug!("materialized {} new task(s)", created);

        let mut report = ExecutionReport::new(&set.id, run_id, levels.clone());
        let runner = SpecRunner {
            engine: Arc::new(WorkflowEngine::new(
                &self.root,
                self.config.clone(),
                self.tasks.clone(),
                self.collaborators.clone(),
                self.checkpoints.clone(),
            )),
            coordination: self.coordination.clone(),
            tasks: self.tasks.clone(),
            config: self.config.clone(),
            spec_set_id: set.id.clone(),
            cancel: self.cancel.clone(),
        };
        let validator = PrerequisiteValidator::new(
            self.collaborators.prerequisites.clone(),
            self.config.prerequisite_timeout(),
        );
        let window_size = options.window_size();

        for level in &levels {
            if self.cancel.is_cancelled() {
                self.skip_cancelled(&mut report, &level.specs);
                continue;
            }

            let mut runnable = Vec::new();
            for spec_id in &level.specs {
                let spec = set
                    .find(spec_id.as_str())
                    .ok_or_else(|| Error::SpecNotFound(spec_id.to_string()))?;
                let state = self.coordination.get_spec_state(spec_id).await?;
                if state.is_some_and(|s| s.status == SpecStatus::Complete) {
                    sflog_debug!("spec {} already complete", spec_id);
                    report.completed.push(spec_id.clone());
                    continue;
                }
                match self.admit(spec, &validator, options, run_id).await? {
                    None => runnable.push(spec.clone()),
                    Some(reason) => {
                        report.blocked.push(spec_id.clone());
                        report.messages.push(format!("{}: blocked: {}", spec_id, reason));
                    }
                }
            }

            for window in runnable.chunks(window_size) {
                if self.cancel.is_cancelled() {
                    let ids: Vec<SpecId> = window.iter().map(|s| s.id.clone()).collect();
                    self.skip_cancelled(&mut report, &ids);
                    continue;
                }
                let outcomes = self.run_window(&runner, set, window).await?;
                for outcome in &outcomes {
                    report.record(outcome);
                }
            }
        }

        report.finish();
        Ok(report)
    }

    fn skip_cancelled(&self, report: &mut ExecutionReport, spec_ids: &[SpecId]) {
        report.cancelled = true;
        for id in spec_ids {
            report.blocked.push(id.clone());
            report
                .messages
                .push(format!("{}: not dispatched, execution cancelled", id));
        }
    }

    /// Check prerequisites and dependencies. Returns the reason when the
    /// spec has to sit out this invocation; its pending tasks are deferred.
    async fn admit(
        &self,
        spec: &Spec,
        validator: &PrerequisiteValidator,
        options: ExecutionOptions,
        run_id: &str,
    ) -> Result<Option<String>> {
        let mut reason = None;

        if !options.skip_prerequisites && !spec.prerequisites.is_empty() {
            let prereqs = validator.validate_prerequisites(spec).await;
            if !prereqs.passed() {
                reason = Some(format!("prerequisites failed: {}", prereqs.failure_summary()));
            }
        }

        if reason.is_none() {
            match self
                .coordination
                .wait_for_dependencies(spec, WaitOptions::from_config(&self.config))
                .await
            {
                Ok(()) => {}
                Err(e @ (Error::DependencyFailed { .. } | Error::DependencyTimeout { .. })) => {
                    reason = Some(e.to_string());
                }
                Err(e) => return Err(e),
            }
        }

        let Some(reason) = reason else {
            return Ok(None);
        };
        sflog_warn!("spec {} blocked: {}", spec.id, reason);
        self.coordination
            .update_spec_state(&spec.id, SpecStatePatch::blocked(reason.clone()))
            .await?;
        let deferred = self
            .tasks
            .defer_spec_tasks(&spec.id, run_id, &reason)
            .await?;
        sflog_debug!("deferred {} task(s) of {}", deferred.len(), spec.id);
        Ok(Some(reason))
    }

    /// Run one window to completion, then fold its results into the shared
    /// record.
    async fn run_window(
        &self,
        runner: &SpecRunner,
        set: &SpecSet,
        window: &[Spec],
    ) -> Result<Vec<SpecOutcome>> {
        let patterns = self
            .shared
            .load(&set.id)
            .await?
            .top_patterns(SHARED_PATTERN_LIMIT);

        let mut join = JoinSet::new();
        for spec in window {
            sflog_debug!("dispatching spec {}", spec.id);
            join.spawn(runner.clone().run(spec.clone(), patterns.clone()));
        }

        let mut outcomes = Vec::with_capacity(window.len());
        while let Some(joined) = join.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => sflog_error!("spec run aborted: {}", e),
            }
        }

        // A run that panicked never reported; record it as failed.
        for spec in window {
            if outcomes.iter().any(|o| o.spec_id == spec.id) {
                continue;
            }
            let message = "spec run aborted".to_string();
            if let Err(e) = self
                .coordination
                .update_spec_state(&spec.id, SpecStatePatch::failed(message.clone()))
                .await
            {
                sflog_warn!("could not record abort of {}: {}", spec.id, e);
            }
            outcomes.push(SpecOutcome::failed(spec.id.clone(), message));
        }

        let updates: Vec<(SpecId, bool, Vec<SharedPattern>, SpecMetrics)> = outcomes
            .iter()
            .map(|o| {
                (
                    o.spec_id.clone(),
                    o.status == SpecStatus::Complete,
                    o.patterns.clone(),
                    o.metrics,
                )
            })
            .collect();
        self.shared
            .update(&set.id, move |record| {
                for (spec_id, complete, patterns, metrics) in updates {
                    if complete {
                        record.mark_completed(&spec_id);
                    }
                    record.merge_patterns(&patterns);
                    record.record_metrics(&spec_id, &metrics);
                }
            })
            .await?;

        Ok(outcomes)
    }
}
