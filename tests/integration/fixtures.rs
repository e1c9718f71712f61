//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Temporary workspaces
//! - Recording code generators and scripted test runners
//! - Spec builders

use futures::future::BoxFuture;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use specflow::agents::{
    ChangeSet, CodeGenerator, Collaborators, FileChange, GenerationOutput, GenerationRequest,
    PrerequisiteExecutor, PrerequisiteOutcome, TestOutcome, TestRequest, TestRunner,
};
use specflow::config::Config;
use specflow::core::{Prerequisite, Spec, SpecId, TaskDefinition};
use specflow::Result;

/// Generator that writes one new file per call and records what it saw.
pub struct RecordingGenerator {
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl RecordingGenerator {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    /// Holds every call open for `delay` so overlapping runs are observable.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    /// Index of the first prompt mentioning `needle`.
    pub fn first_prompt_with(&self, needle: &str) -> Option<usize> {
        self.prompts().iter().position(|p| p.contains(needle))
    }

    /// Index of the last prompt mentioning `needle`.
    pub fn last_prompt_with(&self, needle: &str) -> Option<usize> {
        self.prompts().iter().rposition(|p| p.contains(needle))
    }
}

impl CodeGenerator for RecordingGenerator {
    fn generate<'a>(
        &'a self,
        request: &'a GenerationRequest,
    ) -> BoxFuture<'a, Result<GenerationOutput>> {
        Box::pin(async move {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(request.prompt.clone());

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            Ok(GenerationOutput {
                change_set: ChangeSet {
                    files: vec![FileChange::create(
                        &format!("generated/file_{}.txt", n),
                        "generated\n",
                    )],
                },
                tokens_used: 10,
            })
        })
    }
}

/// Test runner that fails for the listed specs and passes everything else.
pub struct ScriptedTestRunner {
    failing: Vec<SpecId>,
}

impl ScriptedTestRunner {
    pub fn passing() -> Self {
        Self {
            failing: Vec::new(),
        }
    }

    pub fn failing_for(specs: &[&str]) -> Self {
        Self {
            failing: specs.iter().map(|s| SpecId::from(*s)).collect(),
        }
    }
}

impl TestRunner for ScriptedTestRunner {
    fn run<'a>(&'a self, request: &'a TestRequest) -> BoxFuture<'a, Result<TestOutcome>> {
        Box::pin(async move {
            if self.failing.contains(&request.spec_id) {
                Ok(TestOutcome {
                    success: false,
                    output: "error: class Widget not found in src/widget.rs".to_string(),
                    duration_ms: 1,
                })
            } else {
                Ok(TestOutcome {
                    success: true,
                    output: "all tests passed".to_string(),
                    duration_ms: 1,
                })
            }
        })
    }
}

pub struct AlwaysPass;

impl PrerequisiteExecutor for AlwaysPass {
    fn run<'a>(&'a self, _check: &'a Prerequisite) -> BoxFuture<'a, Result<PrerequisiteOutcome>> {
        Box::pin(async {
            Ok(PrerequisiteOutcome {
                success: true,
                message: None,
            })
        })
    }
}

pub fn collaborators(
    generator: Arc<RecordingGenerator>,
    runner: ScriptedTestRunner,
) -> Collaborators {
    Collaborators {
        generator,
        test_runner: Arc::new(runner),
        analyzer: None,
        prerequisites: Arc::new(AlwaysPass),
    }
}

/// Config tuned for fast, deterministic runs.
pub fn test_config() -> Config {
    Config {
        stall_threshold: 1,
        max_iterations_per_spec: 10,
        dependency_wait_timeout_secs: 1,
        dependency_poll_interval_ms: 10,
        ai_failure_analysis: false,
        ..Config::default()
    }
}

/// A spec with one phase of `count` tasks titled `<id> task <n>`.
pub fn spec(id: &str, count: usize) -> Spec {
    let tasks = (1..=count)
        .map(|n| {
            TaskDefinition::new(
                &format!("{}-{}", id, n),
                &format!("{} task {}", id, n),
            )
        })
        .collect();
    Spec::new(id).with_phase("impl", tasks)
}

pub fn workspace() -> TempDir {
    TempDir::new().expect("Failed to create temp directory")
}

pub fn state_dir(root: &Path) -> std::path::PathBuf {
    Config::state_dir(root)
}
