//! Code context for the generation prompt.
//!
//! File references are pulled out of the task text and its declared file list,
//! then loaded from the workspace under a per-file and a total character budget.

use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use crate::agents::ContextFile;
use crate::checkpoint::SharedPattern;
use crate::core::task::Task;
use crate::util::blocking;
use crate::{sflog_debug, Result};

/// Workspace-relative paths with an extension, e.g. `src/models/user.rs`.
/// Extensions need two characters so abbreviations like "e.g." are skipped.
static FILE_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[\s`'(\[])((?:\.?[\w-]+/)*[\w.-]+\.[A-Za-z][A-Za-z0-9]{1,7})\b").unwrap()
});

/// Character limits for one context build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextBudget {
    pub per_file: usize,
    pub total: usize,
}

/// File references in task text, declared files first, deduplicated in order.
pub fn extract_file_references(task: &Task) -> Vec<String> {
    let mut refs: Vec<String> = Vec::new();
    let mut push = |candidate: &str| {
        let candidate = candidate.trim_start_matches("./").to_string();
        if !candidate.is_empty() && !refs.contains(&candidate) {
            refs.push(candidate);
        }
    };

    for file in &task.files {
        push(file);
    }
    for text in [&task.title, &task.description] {
        for caps in FILE_REF_RE.captures_iter(text) {
            if let Some(m) = caps.get(1) {
                push(m.as_str());
            }
        }
    }
    refs
}

/// Resolve `reference` under `root`, refusing anything that could escape it.
fn resolve(root: &Path, reference: &str) -> Option<PathBuf> {
    let rel = Path::new(reference);
    if rel.is_absolute() {
        return None;
    }
    if rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return None;
    }
    Some(root.join(rel))
}

fn truncate_chars(content: &str, limit: usize) -> (String, bool) {
    match content.char_indices().nth(limit) {
        Some((idx, _)) => (content[..idx].to_string(), true),
        None => (content.to_string(), false),
    }
}

/// Load context for `task`. Missing or unreadable references are skipped.
pub async fn build_context(
    root: &Path,
    task: &Task,
    budget: ContextBudget,
) -> Result<Vec<ContextFile>> {
    let refs = extract_file_references(task);
    let root = root.to_path_buf();

    blocking(move || {
        let mut files = Vec::new();
        let mut remaining = budget.total;

        for reference in refs {
            if remaining == 0 {
                break;
            }
            let Some(path) = resolve(&root, &reference) else {
                sflog_debug!("context: rejected reference {}", reference);
                continue;
            };
            if !path.is_file() {
                continue;
            }
            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) => {
                    sflog_debug!("context: cannot read {}: {}", reference, e);
                    continue;
                }
            };

            let limit = budget.per_file.min(remaining);
            let (content, truncated) = truncate_chars(&content, limit);
            remaining -= content.chars().count();
            files.push(ContextFile {
                path: reference,
                content,
                truncated,
            });
        }
        Ok(files)
    })
    .await
}

/// Prompt text for one task. Context files are attached by the generator.
pub fn render_prompt(task: &Task, rules: &[String], patterns: &[SharedPattern]) -> String {
    let mut prompt = format!("Task {}: {}\n", task.id, task.title);
    if !task.description.is_empty() {
        prompt.push('\n');
        prompt.push_str(&task.description);
        prompt.push('\n');
    }
    if !task.files.is_empty() {
        prompt.push_str(&format!("\nFiles in scope: {}\n", task.files.join(", ")));
    }
    if !rules.is_empty() {
        prompt.push_str("\nRules:\n");
        for rule in rules {
            prompt.push_str(&format!("- {}\n", rule));
        }
    }
    let guidance: Vec<_> = patterns.iter().filter(|p| !p.guidance.is_empty()).collect();
    if !guidance.is_empty() {
        prompt.push_str("\nLessons from related specs:\n");
        for pattern in guidance {
            prompt.push_str(&format!("- {}: {}\n", pattern.name, pattern.guidance));
        }
    }
    prompt
}
