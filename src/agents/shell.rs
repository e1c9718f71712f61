//! Shell-backed collaborators: test runner and prerequisite executor.

use futures::future::BoxFuture;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

use super::{PrerequisiteExecutor, PrerequisiteOutcome, TestOutcome, TestRequest, TestRunner};
use crate::core::spec::{Prerequisite, PrerequisiteCheck};
use crate::util::blocking_with_timeout;
use crate::{sflog_debug, sflog_warn, Result};

/// Captured output is cut to its last this-many characters.
pub const OUTPUT_LIMIT_CHARS: usize = 20_000;

#[derive(Debug, Clone)]
pub struct ShellOutput {
    pub success: bool,
    pub timed_out: bool,
    pub output: String,
    pub duration: Duration,
}

/// Run `sh -c <command>` in `workdir`, killing it after `timeout`.
pub async fn run_shell(command: &str, workdir: &Path, timeout: Duration) -> Result<ShellOutput> {
    sflog_debug!("sh -c {:?} in {}", command, workdir.display());
    let started = Instant::now();
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(workdir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => {
            let output = output?;
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.trim().is_empty() {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(&stderr);
            }
            Ok(ShellOutput {
                success: output.status.success(),
                timed_out: false,
                output: tail(&text, OUTPUT_LIMIT_CHARS),
                duration: started.elapsed(),
            })
        }
        Err(_) => {
            sflog_warn!("command timed out after {:?}: {}", timeout, command);
            Ok(ShellOutput {
                success: false,
                timed_out: true,
                output: format!("command timed out after {}s: {}", timeout.as_secs(), command),
                duration: started.elapsed(),
            })
        }
    }
}

/// Keep the last `limit` characters of `text`.
fn tail(text: &str, limit: usize) -> String {
    let count = text.chars().count();
    if count <= limit {
        return text.to_string();
    }
    let skipped: String = text.chars().skip(count - limit).collect();
    format!("[{} chars truncated]\n{}", count - limit, skipped)
}

/// Runs the configured test command through `sh -c`.
///
/// Without a command the run passes trivially with a note in the output.
#[derive(Debug, Clone, Default)]
pub struct ShellTestRunner;

impl TestRunner for ShellTestRunner {
    fn run<'a>(&'a self, request: &'a TestRequest) -> BoxFuture<'a, Result<TestOutcome>> {
        Box::pin(async move {
            let Some(command) = request.command.as_deref() else {
                return Ok(TestOutcome {
                    success: true,
                    output: format!("no test command configured for {}", request.spec_id),
                    duration_ms: 0,
                });
            };
            let out = run_shell(command, &request.workdir, request.timeout).await?;
            Ok(TestOutcome {
                success: out.success,
                output: out.output,
                duration_ms: out.duration.as_millis() as u64,
            })
        })
    }
}

/// Evaluates prerequisite checks against a workspace root.
#[derive(Debug, Clone)]
pub struct ShellPrerequisiteExecutor {
    root: PathBuf,
    timeout: Duration,
}

impl ShellPrerequisiteExecutor {
    pub fn new(root: PathBuf, timeout: Duration) -> Self {
        Self { root, timeout }
    }
}

impl PrerequisiteExecutor for ShellPrerequisiteExecutor {
    fn run<'a>(&'a self, check: &'a Prerequisite) -> BoxFuture<'a, Result<PrerequisiteOutcome>> {
        Box::pin(async move {
            let outcome = match &check.check {
                PrerequisiteCheck::Command { run } => {
                    let out = run_shell(run, &self.root, self.timeout).await?;
                    PrerequisiteOutcome {
                        success: out.success,
                        message: (!out.success).then(|| out.output.trim().to_string()),
                    }
                }
                PrerequisiteCheck::FileExists { path } => {
                    let target = self.root.join(path);
                    let exists =
                        blocking_with_timeout(self.timeout, move || Ok(target.exists())).await?;
                    PrerequisiteOutcome {
                        success: exists,
                        message: (!exists).then(|| format!("{} does not exist", path)),
                    }
                }
                PrerequisiteCheck::EnvVar { name } => {
                    let set = std::env::var(name).is_ok_and(|v| !v.is_empty());
                    PrerequisiteOutcome {
                        success: set,
                        message: (!set).then(|| format!("{} is not set", name)),
                    }
                }
            };
            Ok(outcome)
        })
    }
}
