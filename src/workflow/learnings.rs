//! Learning extraction at the end of a run.

use std::collections::BTreeSet;

use super::analysis::match_signatures;
use super::state::WorkflowState;
use super::types::{Learning, LearningKind};
use crate::agents::FileOperation;
use crate::checkpoint::SharedPattern;

fn top_dir(path: &str) -> &str {
    match path.split_once('/') {
        Some((dir, _)) if !dir.is_empty() => dir,
        _ => ".",
    }
}

/// Patterns from a passing run, gotchas from a failing one, conventions from
/// validation warnings either way.
pub fn extract_learnings(state: &WorkflowState) -> Vec<Learning> {
    let task_id = state.current_task.as_ref().map(|t| t.id.clone());
    let mut learnings = Vec::new();

    if state.tests_passed() {
        let mut seen = BTreeSet::new();
        if let Some(change_set) = &state.change_set {
            for change in &change_set.files {
                if change.operation == FileOperation::Delete {
                    continue;
                }
                let dir = top_dir(&change.path);
                let name = format!("{}:{}", change.operation, dir);
                if seen.insert(name.clone()) {
                    learnings.push(Learning {
                        kind: LearningKind::Pattern,
                        guidance: format!("{} files under {}/ passed tests", change.operation, dir),
                        name,
                        task_id: task_id.clone(),
                    });
                }
            }
        }
    } else {
        let failure_text = state.failure_text.as_deref().unwrap_or_default();
        let signatures = match &state.failure_analysis {
            Some(analysis) if !analysis.signatures.is_empty() => analysis.signatures.clone(),
            _ => match_signatures(failure_text)
                .into_iter()
                .map(String::from)
                .collect(),
        };
        let guidance = state
            .failure_analysis
            .as_ref()
            .and_then(|a| a.recommendations.first().cloned())
            .or_else(|| state.error.clone())
            .unwrap_or_default();
        if signatures.is_empty() {
            let failed = state.failure_analysis.is_some()
                || state.error.is_some()
                || !failure_text.is_empty();
            if failed {
                learnings.push(Learning {
                    kind: LearningKind::Gotcha,
                    name: "gotcha:unclassified".to_string(),
                    guidance,
                    task_id: task_id.clone(),
                });
            }
        } else {
            for signature in signatures {
                learnings.push(Learning {
                    kind: LearningKind::Gotcha,
                    name: format!("gotcha:{}", signature),
                    guidance: guidance.clone(),
                    task_id: task_id.clone(),
                });
            }
        }
    }

    if let Some(report) = &state.validation {
        let mut seen = BTreeSet::new();
        for warning in &report.warnings {
            if seen.insert(warning.code.as_str()) {
                learnings.push(Learning {
                    kind: LearningKind::Convention,
                    name: format!("convention:{}", warning.code),
                    guidance: warning.message.clone(),
                    task_id: task_id.clone(),
                });
            }
        }
    }

    learnings
}

/// Learnings in the shape the shared record merges.
pub fn to_shared_patterns(learnings: &[Learning]) -> Vec<SharedPattern> {
    learnings
        .iter()
        .map(|l| SharedPattern::new(&l.name, &l.guidance))
        .collect()
}
