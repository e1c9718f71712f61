use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use specflow::agents::{
    ClaudeCodeGenerator, ClaudeFailureAnalyzer, ClaudeHeadless, Collaborators, FailureAnalyzer,
    ShellPrerequisiteExecutor, ShellTestRunner,
};
use specflow::checkpoint::CheckpointStore;
use specflow::config::Config;
use specflow::coordination::{CoordinationStore, SpecStatus, TaskStore};
use specflow::core::{plan_levels, ManifestFile, SpecSource, TaskStatus};
use specflow::orchestration::{
    read_lock, unlock, ExecutionOptions, ExecutionReport, Orchestrator, OverallStatus,
    UnlockOutcome,
};
use specflow::{sflog, sflog_warn, Result};

/// specflow - run dependency-ordered spec sets through an AI code generator
#[derive(Parser, Debug)]
#[command(name = "specflow")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    SPECFLOW_DEBUG=1       Enable debug logging (alternative to --debug)\n    SPECFLOW_LOG=<level>   Pin the log level (error, warn, info, debug, trace)"
)]
pub struct Cli {
    /// Enable debug logging (writes to <root>/.specflow/specflow.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Workspace root (defaults to the current directory)
    #[arg(long, value_name = "DIR")]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Execute every spec of a spec-set manifest
    Run {
        /// Spec-set manifest (JSON or TOML)
        manifest: PathBuf,

        /// Maximum spec runs executing at once inside a level
        #[arg(long, value_name = "N")]
        max_concurrent: Option<usize>,

        /// Run specs one at a time
        #[arg(long)]
        sequential: bool,

        #[arg(long)]
        skip_prerequisites: bool,

        /// Print the execution report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the execution levels of a manifest without running anything
    Levels {
        manifest: PathBuf,
    },

    /// Show spec and task status from the coordination store
    Status,

    /// List checkpoints for a thread id (`<spec-set>--<spec>`), or every thread
    Checkpoints {
        thread_id: Option<String>,

        /// Drop checkpoints beyond the retention limit
        #[arg(long)]
        prune: bool,
    },

    /// Remove a stale execution lock
    Unlock {
        /// Remove the lock even if its holder is still running
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir()?,
    };

    specflow::log::init(cli.debug, Some(&Config::state_dir(&root)));
    sflog!("specflow starting in {}", root.display());

    let rt = tokio::runtime::Runtime::new()?;
    match cli.command {
        Command::Run {
            manifest,
            max_concurrent,
            sequential,
            skip_prerequisites,
            json,
        } => {
            let mut config = Config::load(&root)?;
            if let Some(n) = max_concurrent {
                config.max_concurrent = n;
            }
            if sequential {
                config.parallel = false;
            }
            if skip_prerequisites {
                config.skip_prerequisites = true;
            }
            config.validate()?;
            let report = rt.block_on(run_spec_set(&root, config, &manifest))?;
            print_report(&report, json)?;
            if report.status != OverallStatus::Complete {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Levels { manifest } => run_levels(&manifest),
        Command::Status => rt.block_on(run_status(&root)),
        Command::Checkpoints { thread_id, prune } => {
            let config = Config::load(&root)?;
            rt.block_on(run_checkpoints(&root, &config, thread_id.as_deref(), prune))
        }
        Command::Unlock { force } => rt.block_on(run_unlock(&root, force)),
    }
}

fn build_collaborators(root: &Path, config: &Config) -> Result<Collaborators> {
    let headless =
        ClaudeHeadless::new(&config.generator_command)?.with_timeout(config.generation_timeout());
    let analyzer = if config.ai_failure_analysis {
        Some(Arc::new(ClaudeFailureAnalyzer::new(headless.clone(), root.to_path_buf()))
            as Arc<dyn FailureAnalyzer>)
    } else {
        None
    };
    Ok(Collaborators {
        generator: Arc::new(ClaudeCodeGenerator::new(headless)),
        test_runner: Arc::new(ShellTestRunner),
        analyzer,
        prerequisites: Arc::new(ShellPrerequisiteExecutor::new(
            root.to_path_buf(),
            config.prerequisite_timeout(),
        )),
    })
}

async fn run_spec_set(root: &Path, config: Config, manifest: &Path) -> Result<ExecutionReport> {
    let set = ManifestFile(manifest.to_path_buf()).load()?;
    let options = ExecutionOptions::from_config(&config);
    let collaborators = build_collaborators(root, &config)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            sflog_warn!("interrupt received, finishing in-flight specs");
            eprintln!("Interrupted: waiting for running specs to settle...");
            on_signal.cancel();
        }
    });

    let orchestrator = Orchestrator::new(root, config, collaborators).with_cancellation(cancel);
    orchestrator.execute_spec_set(&set, options).await
}

fn print_report(report: &ExecutionReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!();
    println!("  Spec set:  {}", report.spec_set_id);
    println!("  Run:       {}", report.run_id);
    println!("  Status:    {}", format_status(report.status));
    println!();
    for level in &report.levels {
        let ids: Vec<&str> = level.specs.iter().map(|s| s.as_str()).collect();
        println!("  Level {}: {}", level.index, ids.join(", "));
    }
    println!();
    println!(
        "  Completed: {}  Failed: {}  Blocked: {}",
        report.completed.len(),
        report.failed.len(),
        report.blocked.len()
    );
    println!(
        "  Tokens:    {}  Engine runs: {}  Fix tasks: {}",
        report.metrics.totals.tokens_used,
        report.metrics.totals.engine_runs,
        report.metrics.totals.fix_tasks
    );
    if !report.messages.is_empty() {
        println!();
        for message in &report.messages {
            println!("  - {}", message);
        }
    }
    if report.cancelled {
        println!();
        println!("  Execution was cancelled before every spec was dispatched.");
    }
    Ok(())
}

fn format_status(status: OverallStatus) -> String {
    match status {
        OverallStatus::Complete => format!("\x1b[32m{}\x1b[0m", status), // Green
        OverallStatus::Blocked => format!("\x1b[33m{}\x1b[0m", status),  // Yellow
        OverallStatus::Failed => format!("\x1b[31m{}\x1b[0m", status),   // Red
    }
}

fn run_levels(manifest: &Path) -> Result<()> {
    let set = ManifestFile(manifest.to_path_buf()).load()?;
    let levels = plan_levels(&set.specs)?;
    println!("Spec set {} ({} specs)", set.id, set.specs.len());
    for level in levels {
        let ids: Vec<&str> = level.specs.iter().map(|s| s.as_str()).collect();
        println!("  {}: {}", level.index, ids.join(", "));
    }
    Ok(())
}

async fn run_status(root: &Path) -> Result<()> {
    let record = CoordinationStore::open(root).load().await?;
    let tasks = TaskStore::open(root).load().await?;

    match record.active_spec_set_id.as_deref() {
        Some(id) => println!("Active spec set: {}", id),
        None => println!("No spec set has been run here yet."),
    }
    match read_lock(root).await? {
        Some(lock) => println!(
            "Locked by pid {} for {} since {}",
            lock.pid,
            lock.spec_set_id,
            lock.acquired_at.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        None => println!("Not locked"),
    }

    if record.specs.is_empty() {
        return Ok(());
    }
    println!();
    println!("{:<24} {:<10} {:<16} {}", "SPEC", "STATUS", "PHASE", "TASKS");
    for (id, state) in &record.specs {
        let spec_tasks: Vec<_> = tasks.tasks.iter().filter(|t| t.spec_id.as_str() == id).collect();
        let done = spec_tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Done)
            .count();
        println!(
            "{:<24} {:<10} {:<16} {}/{}",
            id,
            state.status,
            state.current_phase.as_deref().unwrap_or("-"),
            done,
            spec_tasks.len()
        );
        if matches!(state.status, SpecStatus::Failed | SpecStatus::Blocked) {
            if let Some(error) = &state.last_error {
                println!("    {}", error);
            }
        }
    }
    Ok(())
}

async fn run_checkpoints(
    root: &Path,
    config: &Config,
    thread_id: Option<&str>,
    prune: bool,
) -> Result<()> {
    let store = CheckpointStore::open(root, config.checkpoint_retention);
    let Some(thread_id) = thread_id else {
        let threads = store.threads().await?;
        if threads.is_empty() {
            println!("No checkpoints recorded.");
        }
        for thread in threads {
            let count = store.list(&thread).await?.len();
            println!("{:<40} {} checkpoint(s)", thread, count);
        }
        return Ok(());
    };

    if prune {
        let removed = store.prune(thread_id).await?;
        println!("Removed {} checkpoint(s)", removed);
    }
    let checkpoints = store.list(thread_id).await?;
    if checkpoints.is_empty() {
        println!("No checkpoints for {}", thread_id);
        return Ok(());
    }
    for checkpoint in checkpoints {
        println!(
            "{:>8}  {}  {:<18} {}",
            checkpoint.seq,
            checkpoint.created_at.format("%Y-%m-%d %H:%M:%S"),
            checkpoint.node,
            if checkpoint.terminal { "terminal" } else { "" }
        );
    }
    Ok(())
}

async fn run_unlock(root: &Path, force: bool) -> Result<()> {
    match unlock(root, force).await? {
        UnlockOutcome::NotLocked => println!("No execution lock present."),
        UnlockOutcome::Removed(info) => {
            println!("Removed lock held by pid {} ({})", info.pid, info.spec_set_id)
        }
        UnlockOutcome::HeldByLiveProcess(info) => {
            println!(
                "Lock is held by running process {} ({}). Use --force to remove it anyway.",
                info.pid, info.spec_set_id
            );
            std::process::exit(1);
        }
    }
    Ok(())
}
