//! Prerequisite Validator: runs a spec's declared checks before it may start.
//!
//! A check that errors or times out counts as failed; validation itself never
//! fails. Whether a failed report blocks or fails the spec is the caller's call.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::agents::PrerequisiteExecutor;
use crate::core::spec::{Prerequisite, Spec, SpecId};
use crate::{sflog_debug, sflog_warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrerequisiteResult {
    pub name: String,
    pub passed: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrerequisiteReport {
    pub spec_id: SpecId,
    pub results: Vec<PrerequisiteResult>,
}

impl PrerequisiteReport {
    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &PrerequisiteResult> {
        self.results.iter().filter(|r| !r.passed)
    }

    /// One line per failed check, for messages and `last_error`.
    pub fn failure_summary(&self) -> String {
        self.failures()
            .map(|r| match &r.message {
                Some(msg) => format!("{}: {}", r.name, msg),
                None => r.name.clone(),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

pub struct PrerequisiteValidator {
    executor: Arc<dyn PrerequisiteExecutor>,
    timeout: Duration,
}

impl PrerequisiteValidator {
    pub fn new(executor: Arc<dyn PrerequisiteExecutor>, timeout: Duration) -> Self {
        Self { executor, timeout }
    }

    /// Run every check of `spec` concurrently and aggregate the outcome.
    pub async fn validate_prerequisites(&self, spec: &Spec) -> PrerequisiteReport {
        let results = join_all(spec.prerequisites.iter().map(|p| self.run_one(p))).await;
        let report = PrerequisiteReport {
            spec_id: spec.id.clone(),
            results,
        };
        if report.passed() {
            sflog_debug!(
                "prerequisites for {}: {} passed",
                spec.id,
                report.results.len()
            );
        } else {
            sflog_warn!(
                "prerequisites for {} failed: {}",
                spec.id,
                report.failure_summary()
            );
        }
        report
    }

    async fn run_one(&self, check: &Prerequisite) -> PrerequisiteResult {
        match tokio::time::timeout(self.timeout, self.executor.run(check)).await {
            Ok(Ok(outcome)) => PrerequisiteResult {
                name: check.name.clone(),
                passed: outcome.success,
                message: outcome.message,
            },
            Ok(Err(e)) => PrerequisiteResult {
                name: check.name.clone(),
                passed: false,
                message: Some(format!("check errored: {}", e)),
            },
            Err(_) => PrerequisiteResult {
                name: check.name.clone(),
                passed: false,
                message: Some(format!("check timed out after {:?}", self.timeout)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::PrerequisiteOutcome;
    use crate::core::spec::PrerequisiteCheck;
    use crate::{Error, Result};
    use futures::future::BoxFuture;

    /// Passes commands named "ok", fails "bad", errors "boom", hangs "slow".
    struct ScriptedExecutor;

    impl PrerequisiteExecutor for ScriptedExecutor {
        fn run<'a>(
            &'a self,
            check: &'a Prerequisite,
        ) -> BoxFuture<'a, Result<PrerequisiteOutcome>> {
            Box::pin(async move {
                match check.name.as_str() {
                    "ok" => Ok(PrerequisiteOutcome {
                        success: true,
                        message: None,
                    }),
                    "bad" => Ok(PrerequisiteOutcome {
                        success: false,
                        message: Some("schema missing".into()),
                    }),
                    "slow" => {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        Ok(PrerequisiteOutcome::default())
                    }
                    _ => Err(Error::Validation("script crashed".into())),
                }
            })
        }
    }

    fn prereq(name: &str) -> Prerequisite {
        Prerequisite {
            name: name.into(),
            check: PrerequisiteCheck::Command { run: name.into() },
        }
    }

    fn validator() -> PrerequisiteValidator {
        PrerequisiteValidator::new(Arc::new(ScriptedExecutor), Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_no_prerequisites_passes() {
        let report = validator().validate_prerequisites(&Spec::new("core")).await;
        assert!(report.passed());
        assert!(report.results.is_empty());
    }

    #[tokio::test]
    async fn test_aggregates_failures() {
        let mut spec = Spec::new("core");
        spec.prerequisites = vec![prereq("ok"), prereq("bad")];

        let report = validator().validate_prerequisites(&spec).await;
        assert!(!report.passed());
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.failure_summary(), "bad: schema missing");
    }

    #[tokio::test]
    async fn test_error_counts_as_failure() {
        let mut spec = Spec::new("core");
        spec.prerequisites = vec![prereq("boom")];

        let report = validator().validate_prerequisites(&spec).await;
        assert!(!report.passed());
        assert!(report.results[0]
            .message
            .as_deref()
            .unwrap()
            .contains("script crashed"));
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let mut spec = Spec::new("core");
        spec.prerequisites = vec![prereq("slow"), prereq("ok")];

        let report = validator().validate_prerequisites(&spec).await;
        assert!(!report.passed());
        assert!(report.results[0]
            .message
            .as_deref()
            .unwrap()
            .contains("timed out"));
        assert!(report.results[1].passed);
    }
}
