//! Driver loop for the unit workflow.
//!
//! Runs one node at a time, applies its patch and checkpoints under the
//! caller's thread id after every transition. A node error ends the run as
//! `failed` with the message in `state.error`; only checkpoint I/O escapes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use super::apply::MatcherChain;
use super::nodes::{run_node, NodeContext};
use super::state::WorkflowState;
use crate::agents::Collaborators;
use crate::checkpoint::{CheckpointStore, SharedPattern};
use crate::config::Config;
use crate::coordination::TaskStore;
use crate::core::spec::Spec;
use crate::core::task::TaskStatus;
use crate::orchestration::stall::StallPolicy;
use crate::{sflog, sflog_debug, sflog_error, sflog_warn, Result};

/// Inputs for one engine run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub thread_id: String,
    pub spec: Spec,
    pub spec_set_id: String,
    /// Guidance from other specs, used when starting fresh.
    pub shared_patterns: Vec<SharedPattern>,
    /// Failed runs earlier in this spec invocation.
    pub spec_retries: u32,
}

pub struct WorkflowEngine {
    root: PathBuf,
    config: Config,
    tasks: Arc<TaskStore>,
    collaborators: Collaborators,
    checkpoints: Arc<CheckpointStore>,
    matchers: MatcherChain,
}

impl WorkflowEngine {
    pub fn new(
        root: &Path,
        config: Config,
        tasks: Arc<TaskStore>,
        collaborators: Collaborators,
        checkpoints: Arc<CheckpointStore>,
    ) -> Self {
        Self {
            root: root.to_path_buf(),
            config,
            tasks,
            collaborators,
            checkpoints,
            matchers: MatcherChain::default(),
        }
    }

    pub fn with_matchers(mut self, matchers: MatcherChain) -> Self {
        self.matchers = matchers;
        self
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// The latest checkpointed state for `thread_id` if it has not finished.
    pub async fn resumable(&self, thread_id: &str) -> Result<Option<WorkflowState>> {
        let Some(checkpoint) = self.checkpoints.load_latest(thread_id).await? else {
            return Ok(None);
        };
        if checkpoint.terminal {
            return Ok(None);
        }
        match checkpoint.state_as::<WorkflowState>() {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                sflog_warn!(
                    "checkpoint {} of {} is unreadable, starting fresh: {}",
                    checkpoint.seq,
                    thread_id,
                    e
                );
                Ok(None)
            }
        }
    }

    /// Drive one run to `end`, resuming from the thread's checkpoint if any.
    pub async fn run(&self, request: &RunRequest) -> Result<WorkflowState> {
        let ctx = NodeContext {
            config: self.config.with_overlay(request.spec.config.as_ref()),
            root: &self.root,
            spec: &request.spec,
            tasks: &self.tasks,
            collaborators: &self.collaborators,
            stall: StallPolicy::for_spec(&self.config, &request.spec),
            matchers: &self.matchers,
        };

        let mut state = match self.resumable(&request.thread_id).await? {
            Some(state) => {
                sflog!(
                    "resuming {} (run {}) at {}",
                    request.thread_id,
                    state.run_id.short(),
                    state.node
                );
                state
            }
            None => {
                let mut state = WorkflowState::new(
                    &request.thread_id,
                    request.spec.id.clone(),
                    &request.spec_set_id,
                );
                state.shared_patterns = request.shared_patterns.clone();
                state.metrics.spec_retries = request.spec_retries;
                state
            }
        };

        while !state.node.is_end() {
            let node = state.node;
            let started = Instant::now();
            match run_node(node, &ctx, &state).await {
                Ok(transition) => {
                    let next = transition.next;
                    if state.advance(node, transition) {
                        sflog_debug!("{}: {} -> {}", request.thread_id, node, next);
                    } else {
                        sflog_error!(
                            "{}: {} -> {} is not a permitted edge",
                            request.thread_id,
                            node,
                            next
                        );
                        self.release_task(&state).await;
                    }
                }
                Err(e) => {
                    sflog_error!("{}: {} failed: {}", request.thread_id, node, e);
                    state.fail(node, &e.to_string());
                    self.release_task(&state).await;
                }
            }
            state
                .metrics
                .record_node(node, started.elapsed().as_millis() as u64);
            self.checkpoints
                .save(
                    &request.thread_id,
                    state.node.as_str(),
                    state.node.is_end(),
                    &state,
                )
                .await?;
        }

        sflog!(
            "{}: run {} finished {}{}",
            request.thread_id,
            state.run_id.short(),
            state.status,
            state
                .error
                .as_deref()
                .map(|e| format!(" ({})", e))
                .unwrap_or_default()
        );
        Ok(state)
    }

    /// Return a task stranded in progress by a node error to pending.
    async fn release_task(&self, state: &WorkflowState) {
        let Some(task) = &state.current_task else {
            return;
        };
        let result = self
            .tasks
            .update(&task.id, |t| {
                if t.status == TaskStatus::InProgress {
                    t.restore();
                }
            })
            .await;
        if let Err(e) = result {
            sflog_warn!("could not release task {}: {}", task.id, e);
        }
    }
}
