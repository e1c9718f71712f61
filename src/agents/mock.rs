//! In-process collaborator doubles for unit tests.

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::{
    ChangeSet, Collaborators, CodeGenerator, FailureAnalysis, FailureAnalyzer, GenerationOutput,
    GenerationRequest, PrerequisiteExecutor, PrerequisiteOutcome, TestOutcome, TestRequest,
    TestRunner,
};
use crate::core::spec::Prerequisite;
use crate::{Error, Result};

/// Returns the same change set every call, or an error when `fail` is set.
pub struct StaticGenerator {
    change_set: ChangeSet,
    tokens: u64,
    fail: Option<String>,
    pub calls: AtomicUsize,
}

impl StaticGenerator {
    pub fn new(change_set: ChangeSet) -> Self {
        Self {
            change_set,
            tokens: 7,
            fail: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            fail: Some(message.to_string()),
            ..Self::new(ChangeSet::default())
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CodeGenerator for StaticGenerator {
    fn generate<'a>(
        &'a self,
        _request: &'a GenerationRequest,
    ) -> BoxFuture<'a, Result<GenerationOutput>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            if let Some(message) = &self.fail {
                return Err(Error::Generation(message.clone()));
            }
            Ok(GenerationOutput {
                change_set: self.change_set.clone(),
                tokens_used: self.tokens,
            })
        })
    }
}

pub struct StaticTestRunner {
    success: bool,
    output: String,
}

impl StaticTestRunner {
    pub fn passing() -> Self {
        Self {
            success: true,
            output: "ok".to_string(),
        }
    }

    pub fn failing(output: &str) -> Self {
        Self {
            success: false,
            output: output.to_string(),
        }
    }
}

impl TestRunner for StaticTestRunner {
    fn run<'a>(&'a self, _request: &'a TestRequest) -> BoxFuture<'a, Result<TestOutcome>> {
        Box::pin(async move {
            Ok(TestOutcome {
                success: self.success,
                output: self.output.clone(),
                duration_ms: 1,
            })
        })
    }
}

/// Analyzer that always errors, counting calls.
#[derive(Default)]
pub struct OfflineAnalyzer {
    pub calls: AtomicUsize,
}

impl FailureAnalyzer for OfflineAnalyzer {
    fn analyze<'a>(&'a self, _text: &'a str) -> BoxFuture<'a, Result<FailureAnalysis>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Err(Error::Generation("analyzer offline".into())) })
    }
}

pub struct PassingPrerequisites;

impl PrerequisiteExecutor for PassingPrerequisites {
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
    generator: Arc<dyn CodeGenerator>,
    test_runner: Arc<dyn TestRunner>,
) -> Collaborators {
    Collaborators {
        generator,
        test_runner,
        analyzer: None,
        prerequisites: Arc::new(PassingPrerequisites),
    }
}
