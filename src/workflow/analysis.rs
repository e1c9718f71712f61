//! Deterministic failure analysis and the text of fix tasks and suggestions.
//!
//! Used when no AI analyzer is configured or the analyzer errors out.

use regex::Regex;
use std::sync::LazyLock;

use crate::agents::{AnalysisSource, FailureAnalysis};
use crate::core::task::Task;

/// A known failure shape and what to do about it.
struct Signature {
    name: &'static str,
    pattern: Regex,
    recommendation: &'static str,
}

static SIGNATURES: LazyLock<Vec<Signature>> = LazyLock::new(|| {
    vec![
        Signature {
            name: "missing-class",
            pattern: Regex::new(
                r"(?i)(cannot find (type|struct|trait|class|module)|class .+ not found|no class named|unresolved import|ModuleNotFoundError|cannot find module)",
            )
            .unwrap(),
            recommendation: "Create the missing type or module, or fix the import path.",
        },
        Signature {
            name: "undefined-reference",
            pattern: Regex::new(
                r"(?i)(cannot find (value|function|macro)|undefined (reference|variable|method|symbol)|is not defined|not found in this scope|NameError)",
            )
            .unwrap(),
            recommendation: "Define the referenced symbol or correct its name and scope.",
        },
        Signature {
            name: "syntax",
            pattern: Regex::new(
                r"(?i)(syntax ?error|unexpected (token|end of file|eof)|expected one of|unclosed delimiter|unterminated string)",
            )
            .unwrap(),
            recommendation: "Fix the syntax error; check braces, quotes and separators.",
        },
        Signature {
            name: "permission",
            pattern: Regex::new(r"(?i)(permission denied|EACCES|operation not permitted|access is denied)")
                .unwrap(),
            recommendation: "Check file permissions and avoid writing outside the workspace.",
        },
        Signature {
            name: "timeout",
            pattern: Regex::new(r"(?i)(timed? ?out|deadline exceeded|took too long)").unwrap(),
            recommendation: "Reduce the work done per test or look for a hang or deadlock.",
        },
        Signature {
            name: "deprecation",
            pattern: Regex::new(r"(?i)(deprecated|deprecation)").unwrap(),
            recommendation: "Replace the deprecated API with its supported successor.",
        },
    ]
});

/// Lines that look like errors or warnings.
static ERROR_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(error|fatal|panicked|failed|exception)\b").unwrap());
static WARNING_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(warning|warn)\b").unwrap());

const MAX_LINES: usize = 10;

/// Names of every signature that matches `text`, in table order.
pub fn match_signatures(text: &str) -> Vec<&'static str> {
    SIGNATURES
        .iter()
        .filter(|s| s.pattern.is_match(text))
        .map(|s| s.name)
        .collect()
}

/// Signature-based analysis of failure output.
pub fn pattern_analysis(text: &str) -> FailureAnalysis {
    let matched: Vec<&Signature> = SIGNATURES
        .iter()
        .filter(|s| s.pattern.is_match(text))
        .collect();

    let errors: Vec<String> = text
        .lines()
        .filter(|l| ERROR_LINE_RE.is_match(l))
        .take(MAX_LINES)
        .map(|l| l.trim().to_string())
        .collect();
    let warnings: Vec<String> = text
        .lines()
        .filter(|l| WARNING_LINE_RE.is_match(l))
        .take(MAX_LINES)
        .map(|l| l.trim().to_string())
        .collect();

    let summary = if matched.is_empty() {
        match errors.first() {
            Some(first) => format!("Unclassified failure: {}", first),
            None => "Unclassified failure".to_string(),
        }
    } else {
        format!(
            "Detected {} failure",
            matched.iter().map(|s| s.name).collect::<Vec<_>>().join(", ")
        )
    };

    let mut recommendations: Vec<String> =
        matched.iter().map(|s| s.recommendation.to_string()).collect();
    if recommendations.is_empty() {
        recommendations.push("Read the failure output and address the first error.".to_string());
    }

    FailureAnalysis {
        errors,
        warnings,
        summary,
        recommendations,
        signatures: matched.iter().map(|s| s.name.to_string()).collect(),
        source: AnalysisSource::Pattern,
    }
}

/// Title and description for a fix task following `origin`'s failure.
pub fn fix_task_text(origin: &Task, analysis: &FailureAnalysis) -> (String, String) {
    let title = format!("Fix: {}", origin.title.trim_start_matches("Fix: "));
    let mut description = format!(
        "Follow-up to task {} (attempt {}).\n\n{}\n",
        origin.id,
        origin.retry_count + 1,
        analysis.summary
    );
    if !analysis.errors.is_empty() {
        description.push_str("\nErrors:\n");
        for error in &analysis.errors {
            description.push_str(&format!("- {}\n", error));
        }
    }
    if !analysis.recommendations.is_empty() {
        description.push_str("\nRecommended:\n");
        for rec in &analysis.recommendations {
            description.push_str(&format!("- {}\n", rec));
        }
    }
    if !origin.description.is_empty() {
        description.push_str("\nOriginal task:\n");
        description.push_str(&origin.description);
        description.push('\n');
    }
    (title, description)
}

/// Advisory suggestions for a task that keeps failing.
pub fn suggest_improvements(task: &Task, failure_output: &str, attempts: u32) -> Vec<String> {
    let mut suggestions = vec![format!(
        "Task {} has failed {} time(s); review it manually before retrying.",
        task.id,
        attempts + 1
    )];
    for name in match_signatures(failure_output) {
        let hint = match name {
            "missing-class" | "undefined-reference" => {
                "Split the task so missing definitions are created before they are used."
            }
            "syntax" => "Ask for smaller edits; large generated patches keep breaking syntax.",
            "permission" => "Check that the task's files are inside the allowed paths.",
            "timeout" => "Raise test_timeout_secs or narrow test_command to this spec.",
            "deprecation" => "Pin or upgrade the dependency the task relies on.",
            _ => continue,
        };
        suggestions.push(hint.to_string());
    }
    if task.files.is_empty() {
        suggestions.push("Declare the files this task touches to give generation more context.".into());
    }
    suggestions
}
