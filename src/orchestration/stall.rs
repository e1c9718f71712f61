//! Stall detection.
//!
//! A task stalls once its fix chain has failed as many times as the effective
//! threshold allows. Thresholds resolve task override, then spec overlay, then
//! the global config. The task-level retry count decides whenever a task is
//! known; the spec-level count of failed engine runs is used only without one.

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::core::spec::Spec;
use crate::core::task::Task;

/// Which counter triggered a stall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StallScope {
    Task,
    Spec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallDecision {
    /// Keep escalating through analysis and fix tasks.
    Continue { attempts: u32, threshold: u32 },
    /// Stop creating fix tasks; emit advisory suggestions instead.
    Stalled {
        attempts: u32,
        threshold: u32,
        scope: StallScope,
    },
}

impl StallDecision {
    pub fn is_stalled(&self) -> bool {
        matches!(self, StallDecision::Stalled { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StallPolicy {
    global_threshold: u32,
    spec_threshold: Option<u32>,
}

impl StallPolicy {
    pub fn new(global_threshold: u32) -> Self {
        Self {
            global_threshold,
            spec_threshold: None,
        }
    }

    pub fn with_spec_threshold(mut self, threshold: Option<u32>) -> Self {
        self.spec_threshold = threshold;
        self
    }

    /// Policy for `spec` under the global (not overlaid) config.
    pub fn for_spec(config: &Config, spec: &Spec) -> Self {
        Self::new(config.stall_threshold)
            .with_spec_threshold(spec.config.as_ref().and_then(|c| c.stall_threshold))
    }

    /// Threshold in force for `task`, or for the spec when no task is known.
    pub fn threshold_for(&self, task: Option<&Task>) -> u32 {
        task.and_then(|t| t.stall_threshold)
            .or(self.spec_threshold)
            .unwrap_or(self.global_threshold)
    }

    /// Decide after a failed test run.
    ///
    /// `task.retry_count` counts the fix tasks before this one, so a failure
    /// of the task with `retry_count == threshold` is the threshold-th retry
    /// failing.
    pub fn decide(&self, task: Option<&Task>, spec_failures: u32) -> StallDecision {
        let threshold = self.threshold_for(task);
        let (attempts, scope) = match task {
            Some(task) => (task.retry_count, StallScope::Task),
            None => (spec_failures, StallScope::Spec),
        };
        if attempts >= threshold {
            StallDecision::Stalled {
                attempts,
                threshold,
                scope,
            }
        } else {
            StallDecision::Continue {
                attempts,
                threshold,
            }
        }
    }
}

impl Default for StallPolicy {
    fn default() -> Self {
        Self::new(Config::default().stall_threshold)
    }
}
