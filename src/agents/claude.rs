//! Claude Code headless collaborators.
//!
//! `ClaudeHeadless` runs `claude -p <prompt> --output-format json` and parses
//! the reply envelope. `ClaudeCodeGenerator` and `ClaudeFailureAnalyzer` wrap
//! it and pull a JSON object out of the model's text.

use futures::future::BoxFuture;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tokio::process::Command;

use super::{
    AnalysisSource, ChangeSet, CodeGenerator, FailureAnalysis, FailureAnalyzer, GenerationOutput,
    GenerationRequest,
};
use crate::{sflog_debug, sflog_trace, Error, Result};

/// Default timeout for Claude execution (10 minutes).
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Fenced ```json block in model output.
static FENCED_JSON_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*\n(\{.*?\})\s*```").unwrap());

/// Outcome carried by a Claude reply envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultType {
    /// The model finished; `output` is its final text.
    Success { output: String },
    /// Claude reported an error, or the process failed before replying.
    Error { message: String },
}

/// Response from a Claude headless execution.
#[derive(Debug, Clone)]
pub struct ClaudeResponse {
    /// Session id, when the envelope carries one.
    pub session_id: Option<String>,
    pub result: ResultType,
    /// Reported cost of the call in USD.
    pub cost_usd: Option<f64>,
    /// Wall-clock time Claude reported for the call.
    pub duration_ms: Option<u64>,
    /// Input plus output tokens, when the envelope reports usage.
    pub tokens_used: Option<u64>,
}

impl ClaudeResponse {
    /// Check if the call succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self.result, ResultType::Success { .. })
    }

    /// Final model text, if the call succeeded.
    pub fn output(&self) -> Option<&str> {
        match &self.result {
            ResultType::Success { output } => Some(output),
            ResultType::Error { .. } => None,
        }
    }

    /// Failure message, if the call failed.
    pub fn error_message(&self) -> Option<&str> {
        match &self.result {
            ResultType::Success { .. } => None,
            ResultType::Error { message } => Some(message),
        }
    }

    /// Consume the response and return its output text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Generation`] with Claude's message when the call failed.
    pub fn into_output(self) -> Result<String> {
        match self.result {
            ResultType::Success { output } => Ok(output),
            ResultType::Error { message } => Err(Error::Generation(message)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct RawClaudeResponse {
    subtype: Option<String>,
    result: Option<String>,
    session_id: Option<String>,
    total_cost_usd: Option<f64>,
    duration_ms: Option<u64>,
    #[serde(default)]
    usage: Option<RawUsage>,
    #[serde(default)]
    error: Option<String>,
}

/// Claude Code headless executor.
///
/// Runs `claude -p <prompt> --output-format json` in a working directory and
/// turns the reply envelope into a [`ClaudeResponse`]. The child process is
/// killed if the timeout elapses first.
///
/// # Example
///
/// ```ignore
/// use specflow::agents::ClaudeHeadless;
/// use std::path::Path;
///
/// let claude = ClaudeHeadless::new("claude")?.with_timeout(Duration::from_secs(120));
/// let text = claude.execute("Summarize src/lib.rs", Path::new(".")).await?.into_output()?;
/// ```
#[derive(Debug, Clone)]
pub struct ClaudeHeadless {
    /// Resolved path to the `claude` binary.
    binary: PathBuf,
    /// Upper bound on one `execute` call.
    timeout: Duration,
}

impl ClaudeHeadless {
    /// Create an executor for `command`, resolved on `PATH` with `which`.
    ///
    /// # Arguments
    ///
    /// * `command` - Binary name or path, normally `claude`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClaudeBinaryNotFound`] if `command` cannot be resolved.
    pub fn new(command: &str) -> Result<Self> {
        let binary = which::which(command).map_err(|_| Error::ClaudeBinaryNotFound)?;
        Ok(Self::with_binary(binary))
    }

    /// Create an executor for an already resolved binary path.
    pub fn with_binary(binary: PathBuf) -> Self {
        Self {
            binary,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Set the timeout for each call.
    ///
    /// # Arguments
    ///
    /// * `timeout` - How long one `execute` may run before it is abandoned.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run one prompt and parse the JSON envelope.
    ///
    /// A non-zero exit without a parseable envelope becomes a
    /// [`ResultType::Error`] response rather than an `Err`.
    ///
    /// # Arguments
    ///
    /// * `prompt` - Full prompt text, passed with `-p`.
    /// * `cwd` - Working directory for the child process.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The process cannot be spawned
    /// - The call exceeds the configured timeout
    pub async fn execute(&self, prompt: &str, cwd: &Path) -> Result<ClaudeResponse> {
        sflog_debug!(
            "claude execute: {} prompt chars in {}",
            prompt.len(),
            cwd.display()
        );
        sflog_trace!("claude prompt:\n{}", prompt);

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.binary)
                .arg("-p")
                .arg(prompt)
                .arg("--output-format")
                .arg("json")
                .current_dir(cwd)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::Timeout(self.timeout))?
        .map_err(Error::Io)?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        sflog_trace!("claude stdout:\n{}", stdout);

        if let Ok(response) = Self::parse_json_response(&stdout) {
            return Ok(response);
        }

        if !output.status.success() {
            let message = if stderr.trim().is_empty() {
                format!(
                    "Claude execution failed with exit code {}",
                    output.status.code().unwrap_or(-1)
                )
            } else {
                stderr.trim().to_string()
            };
            return Ok(ClaudeResponse {
                session_id: None,
                result: ResultType::Error { message },
                cost_usd: None,
                duration_ms: None,
                tokens_used: None,
            });
        }

        Ok(ClaudeResponse {
            session_id: None,
            result: ResultType::Success {
                output: stdout.trim().to_string(),
            },
            cost_usd: None,
            duration_ms: None,
            tokens_used: None,
        })
    }

    /// Parse the `--output-format json` envelope.
    ///
    /// Subtypes starting with `error` map to [`ResultType::Error`]; token
    /// usage is summed into `tokens_used`.
    ///
    /// # Errors
    ///
    /// Returns an error if `json_str` is not a JSON object.
    pub fn parse_json_response(json_str: &str) -> Result<ClaudeResponse> {
        let raw: RawClaudeResponse = serde_json::from_str(json_str)?;

        let result = match raw.subtype.as_deref() {
            Some("success") => ResultType::Success {
                output: raw.result.unwrap_or_default(),
            },
            // "error", "error_max_turns", "error_during_execution", ...
            Some(subtype) if subtype.starts_with("error") => ResultType::Error {
                message: raw.error.or(raw.result).unwrap_or_default(),
            },
            _ => match (raw.error, raw.result) {
                (Some(error), _) => ResultType::Error { message: error },
                (None, Some(result)) => ResultType::Success { output: result },
                (None, None) => ResultType::Error {
                    message: "Unknown response format".to_string(),
                },
            },
        };

        Ok(ClaudeResponse {
            session_id: raw.session_id,
            result,
            cost_usd: raw.total_cost_usd,
            duration_ms: raw.duration_ms,
            tokens_used: raw.usage.map(|u| u.input_tokens + u.output_tokens),
        })
    }
}

/// Pull the first JSON object out of free-form model text.
///
/// Prefers a fenced ```json block; otherwise takes the span from the first
/// `{` to the last `}`.
///
/// # Example
///
/// ```
/// use specflow::agents::claude::extract_json_object;
///
/// let reply = "Here you go:\n```json\n{\"files\": []}\n```\nDone.";
/// assert_eq!(extract_json_object(reply), Some("{\"files\": []}"));
/// assert_eq!(extract_json_object("no object here"), None);
/// ```
pub fn extract_json_object(text: &str) -> Option<&str> {
    if let Some(caps) = FENCED_JSON_RE.captures(text) {
        return caps.get(1).map(|m| m.as_str());
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Code generator backed by `ClaudeHeadless`.
pub struct ClaudeCodeGenerator {
    headless: ClaudeHeadless,
}

impl ClaudeCodeGenerator {
    /// Create a generator that sends prompts through `headless`.
    pub fn new(headless: ClaudeHeadless) -> Self {
        Self { headless }
    }

    fn render_prompt(request: &GenerationRequest) -> String {
        let mut prompt = request.prompt.clone();
        for file in &request.context {
            prompt.push_str(&format!("\n\n--- {} ---\n{}", file.path, file.content));
            if file.truncated {
                prompt.push_str("\n[truncated]");
            }
        }
        prompt.push_str(
            "\n\nReply with a single JSON object of the form \
             {\"files\":[{\"path\":\"...\",\"operation\":\"create|update|patch|delete\",\
             \"content\":\"...\",\"patches\":[{\"search\":\"...\",\"replace\":\"...\"}]}]}. \
             Use workspace-relative paths. Do not modify files yourself.",
        );
        prompt
    }

    /// Parse a change set out of the model's reply text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Generation`] when the reply holds no JSON object or
    /// the object is not a valid change set.
    pub fn parse_change_set(text: &str) -> Result<ChangeSet> {
        let json = extract_json_object(text)
            .ok_or_else(|| Error::Generation("no JSON object in generator reply".into()))?;
        serde_json::from_str(json)
            .map_err(|e| Error::Generation(format!("invalid change set: {}", e)))
    }
}

impl CodeGenerator for ClaudeCodeGenerator {
    fn generate<'a>(
        &'a self,
        request: &'a GenerationRequest,
    ) -> BoxFuture<'a, Result<GenerationOutput>> {
        Box::pin(async move {
            let prompt = Self::render_prompt(request);
            let response = self.headless.execute(&prompt, &request.workdir).await?;
            let tokens_used = response.tokens_used.unwrap_or(0);
            let change_set = Self::parse_change_set(&response.into_output()?)?;
            Ok(GenerationOutput {
                change_set,
                tokens_used,
            })
        })
    }
}

/// Failure analyzer backed by `ClaudeHeadless`.
pub struct ClaudeFailureAnalyzer {
    headless: ClaudeHeadless,
    workdir: PathBuf,
}

#[derive(Deserialize)]
struct RawAnalysis {
    #[serde(default)]
    errors: Vec<String>,
    #[serde(default)]
    warnings: Vec<String>,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    recommendations: Vec<String>,
}

impl ClaudeFailureAnalyzer {
    /// Create an analyzer that runs in `workdir`.
    pub fn new(headless: ClaudeHeadless, workdir: PathBuf) -> Self {
        Self { headless, workdir }
    }

    /// Parse a failure analysis out of the model's reply text. Missing
    /// fields default to empty.
    ///
    /// # Errors
    ///
    /// Returns an error when the reply holds no JSON object or it does not
    /// deserialize.
    pub fn parse_analysis(text: &str) -> Result<FailureAnalysis> {
        let json = extract_json_object(text)
            .ok_or_else(|| Error::Generation("no JSON object in analyzer reply".into()))?;
        let raw: RawAnalysis = serde_json::from_str(json)?;
        Ok(FailureAnalysis {
            errors: raw.errors,
            warnings: raw.warnings,
            summary: raw.summary,
            recommendations: raw.recommendations,
            signatures: Vec::new(),
            source: AnalysisSource::Ai,
        })
    }
}

impl FailureAnalyzer for ClaudeFailureAnalyzer {
    fn analyze<'a>(&'a self, error_text: &'a str) -> BoxFuture<'a, Result<FailureAnalysis>> {
        Box::pin(async move {
            let prompt = format!(
                "Analyze this failure output. Reply with a single JSON object \
                 {{\"errors\":[],\"warnings\":[],\"summary\":\"\",\"recommendations\":[]}}.\n\n{}",
                error_text
            );
            let response = self.headless.execute(&prompt, &self.workdir).await?;
            Self::parse_analysis(&response.into_output()?)
        })
    }
}
