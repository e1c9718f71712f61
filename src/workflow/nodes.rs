//! One transition function per workflow node.
//!
//! Each node reads the current state, talks to at most one collaborator or
//! store, and returns the next node plus a patch. Nodes never mutate the
//! state directly; the engine applies the patch and checkpoints.

use std::path::Path;

use super::analysis::{fix_task_text, match_signatures, pattern_analysis, suggest_improvements};
use super::apply::{apply_change_set, MatcherChain};
use super::context::{build_context, render_prompt, ContextBudget};
use super::learnings::extract_learnings;
use super::state::{StatePatch, Transition, WorkflowState};
use super::types::{Node, RunStatus};
use super::validate::{filter_to_scope, validate_change_set};
use crate::agents::{Collaborators, GenerationRequest, TestRequest};
use crate::config::Config;
use crate::coordination::TaskStore;
use crate::core::spec::Spec;
use crate::core::task::Task;
use crate::orchestration::stall::{StallDecision, StallPolicy};
use crate::{sflog, sflog_debug, sflog_warn, Error, Result};

/// Everything a node may read besides the state.
pub struct NodeContext<'a> {
    /// Effective config for the spec (overlay applied).
    pub config: Config,
    pub root: &'a Path,
    pub spec: &'a Spec,
    pub tasks: &'a TaskStore,
    pub collaborators: &'a Collaborators,
    pub stall: StallPolicy,
    pub matchers: &'a MatcherChain,
}

fn current_task<'s>(state: &'s WorkflowState, node: Node) -> Result<&'s Task> {
    state
        .current_task
        .as_ref()
        .ok_or_else(|| Error::Validation(format!("{} reached without a current task", node)))
}

/// Run `node` against `state`.
pub async fn run_node(
    node: Node,
    ctx: &NodeContext<'_>,
    state: &WorkflowState,
) -> Result<Transition> {
    match node {
        Node::Start => Ok(start()),
        Node::Fetch => fetch(ctx).await,
        Node::BuildContext => build_context_node(ctx, state).await,
        Node::Generate => generate(ctx, state).await,
        Node::Validate => validate(ctx, state),
        Node::Apply => apply(ctx, state).await,
        Node::RunTests => run_tests(ctx, state).await,
        Node::AnalyzeFailure => analyze_failure(ctx, state).await,
        Node::CreateFixTask => create_fix_task(ctx, state).await,
        Node::SuggestImprovements => suggest(ctx, state).await,
        Node::CaptureLearnings => capture_learnings(ctx, state).await,
        Node::End => Err(Error::Validation("end is terminal".into())),
    }
}

fn start() -> Transition {
    Transition::with(Node::Fetch, StatePatch::new().status(RunStatus::Running))
}

async fn fetch(ctx: &NodeContext<'_>) -> Result<Transition> {
    let batch = ctx
        .tasks
        .select_batch(&ctx.spec.id, ctx.config.fetch_limit)
        .await?;
    let Some(first) = batch.first() else {
        return Ok(Transition::with(
            Node::End,
            StatePatch::new()
                .status(RunStatus::Complete)
                .message("nothing to do"),
        ));
    };

    let task = ctx.tasks.start(&first.id).await?;
    sflog_debug!(
        "{}: fetched {} task(s), working on {}",
        ctx.spec.id,
        batch.len(),
        task.id
    );
    Ok(Transition::with(
        Node::BuildContext,
        StatePatch {
            fetched_tasks: Some(batch.iter().map(|t| t.id.clone()).collect()),
            retries: Some(task.retry_count),
            current_task: Some(task),
            ..Default::default()
        },
    ))
}

async fn build_context_node(ctx: &NodeContext<'_>, state: &WorkflowState) -> Result<Transition> {
    let task = current_task(state, Node::BuildContext)?;
    let budget = ContextBudget {
        per_file: ctx.config.context_file_chars,
        total: ctx.config.context_budget_chars,
    };
    let context = build_context(ctx.root, task, budget).await?;
    Ok(Transition::with(
        Node::Generate,
        StatePatch {
            context: Some(context),
            ..Default::default()
        },
    ))
}

async fn generate(ctx: &NodeContext<'_>, state: &WorkflowState) -> Result<Transition> {
    let task = current_task(state, Node::Generate)?;
    let request = GenerationRequest {
        prompt: render_prompt(task, &ctx.config.rules, &state.shared_patterns),
        context: state.context.clone(),
        workdir: ctx.root.to_path_buf(),
    };
    let output = ctx.collaborators.generator.generate(&request).await?;
    let returned = output.change_set.files.len();
    let scoped = filter_to_scope(output.change_set, &ctx.config.allowed_paths);

    let mut patch = StatePatch {
        tokens_used: output.tokens_used,
        ..Default::default()
    };
    if scoped.is_empty() {
        let reason = if returned == 0 {
            "generator returned no changes".to_string()
        } else {
            format!("all {} generated change(s) were outside the allowed paths", returned)
        };
        patch.change_set = Some(scoped);
        return Ok(Transition::with(Node::CaptureLearnings, patch.error(reason)));
    }

    patch.change_set = Some(scoped);
    Ok(Transition::with(Node::Validate, patch))
}

fn validate(ctx: &NodeContext<'_>, state: &WorkflowState) -> Result<Transition> {
    let change_set = state
        .change_set
        .as_ref()
        .ok_or_else(|| Error::Validation("validate reached without a change set".into()))?;
    let report = validate_change_set(change_set, &ctx.config.forbidden_dirs);

    if report.valid {
        return Ok(Transition::with(
            Node::Apply,
            StatePatch {
                validation: Some(report),
                ..Default::default()
            },
        ));
    }
    let text = format!("validation failed:\n{}", report.errors.join("\n"));
    Ok(Transition::with(
        Node::AnalyzeFailure,
        StatePatch {
            validation: Some(report),
            ..Default::default()
        }
        .failure_text(text),
    ))
}

async fn apply(ctx: &NodeContext<'_>, state: &WorkflowState) -> Result<Transition> {
    let change_set = state
        .change_set
        .as_ref()
        .ok_or_else(|| Error::Validation("apply reached without a change set".into()))?;
    let result = apply_change_set(ctx.root, change_set, ctx.matchers).await?;

    if result.success {
        sflog_debug!(
            "{}: applied {} file(s), {} unchanged",
            ctx.spec.id,
            result.modified_files.len(),
            result.unchanged_files.len()
        );
        return Ok(Transition::with(
            Node::RunTests,
            StatePatch {
                modified_files: result.modified_files.clone(),
                apply_result: Some(result),
                ..Default::default()
            },
        ));
    }
    let text = format!("apply failed:\n{}", result.errors.join("\n"));
    Ok(Transition::with(
        Node::AnalyzeFailure,
        StatePatch {
            apply_result: Some(result),
            ..Default::default()
        }
        .failure_text(text),
    ))
}

async fn run_tests(ctx: &NodeContext<'_>, state: &WorkflowState) -> Result<Transition> {
    let task = current_task(state, Node::RunTests)?;
    let request = TestRequest {
        spec_id: ctx.spec.id.clone(),
        command: ctx.config.test_command.clone(),
        workdir: ctx.root.to_path_buf(),
        timeout: ctx.config.test_timeout(),
    };
    let outcome = ctx.collaborators.test_runner.run(&request).await?;

    if outcome.success {
        return Ok(Transition::with(
            Node::CaptureLearnings,
            StatePatch {
                test_result: Some(outcome),
                ..Default::default()
            },
        ));
    }

    let output = outcome.output.clone();
    let mut patch = StatePatch {
        test_result: Some(outcome),
        ..Default::default()
    }
    .failure_text(output);

    match ctx.stall.decide(Some(task), state.metrics.spec_retries) {
        StallDecision::Stalled {
            attempts,
            threshold,
            ..
        } => {
            sflog_warn!(
                "{}: task {} stalled ({} retries, threshold {})",
                ctx.spec.id,
                task.id,
                attempts,
                threshold
            );
            patch.stalled = Some(true);
            Ok(Transition::with(Node::SuggestImprovements, patch))
        }
        StallDecision::Continue { .. } => Ok(Transition::with(Node::AnalyzeFailure, patch)),
    }
}

async fn analyze_failure(ctx: &NodeContext<'_>, state: &WorkflowState) -> Result<Transition> {
    let text = state.failure_text.clone().unwrap_or_default();

    let analyzer = ctx
        .collaborators
        .analyzer
        .as_ref()
        .filter(|_| ctx.config.ai_failure_analysis);
    let mut analysis = match analyzer {
        Some(analyzer) => match analyzer.analyze(&text).await {
            Ok(analysis) => analysis,
            Err(e) => {
                sflog_warn!("failure analyzer error, using signatures: {}", e);
                pattern_analysis(&text)
            }
        },
        None => pattern_analysis(&text),
    };
    if analysis.signatures.is_empty() {
        analysis.signatures = match_signatures(&text)
            .into_iter()
            .map(String::from)
            .collect();
    }

    Ok(Transition::with(
        Node::CreateFixTask,
        StatePatch {
            failure_analysis: Some(analysis),
            ..Default::default()
        },
    ))
}

async fn create_fix_task(ctx: &NodeContext<'_>, state: &WorkflowState) -> Result<Transition> {
    let task = current_task(state, Node::CreateFixTask)?;
    let analysis = state
        .failure_analysis
        .clone()
        .unwrap_or_else(|| pattern_analysis(state.failure_text.as_deref().unwrap_or_default()));
    let (title, description) = fix_task_text(task, &analysis);
    let fix = ctx
        .tasks
        .register_fix_task(Task::fix_for(task, &title, &description))
        .await?;

    sflog!(
        "{}: task {} failed, created fix task {}",
        ctx.spec.id,
        task.id,
        fix.id
    );
    Ok(Transition::with(
        Node::CaptureLearnings,
        StatePatch {
            fix_task: Some(fix.id.clone()),
            ..Default::default()
        }
        .message(format!("created fix task {}", fix.id)),
    ))
}

async fn suggest(ctx: &NodeContext<'_>, state: &WorkflowState) -> Result<Transition> {
    let task = current_task(state, Node::SuggestImprovements)?;
    let output = state.failure_text.as_deref().unwrap_or_default();
    let suggestions = suggest_improvements(task, output, task.retry_count);
    let reason = format!("stalled after {} attempt(s)", task.retry_count + 1);
    ctx.tasks.block(&task.id, &reason).await?;

    Ok(Transition::with(
        Node::CaptureLearnings,
        StatePatch {
            suggestions,
            ..Default::default()
        }
        .message(reason),
    ))
}

async fn capture_learnings(ctx: &NodeContext<'_>, state: &WorkflowState) -> Result<Transition> {
    let learnings = extract_learnings(state);
    let passed = state.tests_passed();
    let mut patch = StatePatch {
        learnings,
        ..Default::default()
    };

    if let Some(task) = &state.current_task {
        if passed {
            let done = ctx.tasks.complete(&task.id).await?;
            patch = patch.message(format!("completed {} task(s)", done.len()));
        } else {
            let reason = state
                .error
                .clone()
                .or_else(|| state.failure_analysis.as_ref().map(|a| a.summary.clone()))
                .unwrap_or_else(|| format!("task {} failed", task.id));
            // Fix tasks and stalls already parked the task.
            if state.fix_task.is_none() && !state.metrics.stalled {
                ctx.tasks.block(&task.id, &reason).await?;
            }
            if state.error.is_none() {
                patch = patch.error(reason);
            }
        }
    }

    let status = if passed {
        RunStatus::Complete
    } else {
        RunStatus::Failed
    };
    Ok(Transition::with(Node::End, patch.status(status)))
}
