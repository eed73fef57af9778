//! `ralph` binary: parses CLI flags into a `LoopConfig`, wires the
//! concrete tracker/worktree/trace/progress components, and runs the
//! scheduler to completion.

mod verbose;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use ralph_core::agent::AgentCommand;
use ralph_core::config::{check_sequential_conflict, LoopConfig};
use ralph_core::issue_client::{BdIssueClient, IssueClient};
use ralph_core::progress::ProgressBus;
use ralph_core::scheduler::Scheduler;
use ralph_core::trace::{NoopExporter, OtlpHttpExporter, TraceAggregator, TraceExporter};
use ralph_core::worktree::WorktreeManager;

/// Autonomous work-loop driver: dispatches a coding agent against an issue
/// tracker until a stop condition is reached.
#[derive(Parser)]
#[command(name = "ralph", about = "Autonomous work-loop driver")]
struct Cli {
    /// Repository working directory the tracker and agent operate in.
    #[arg(long)]
    workdir: String,

    /// Restrict selection to the ready children of this epic. Implies
    /// `--max-parallel=1`.
    #[arg(long)]
    epic: Option<String>,

    /// Run exactly one iteration against this single item.
    #[arg(long)]
    bead: Option<String>,

    /// Maximum number of Iterations before stopping. Forced to 1 when
    /// `--bead` is set.
    #[arg(long, default_value_t = LoopConfig::DEFAULT_MAX_ITERATIONS)]
    max_iterations: u32,

    /// Wall-clock budget for a single agent invocation.
    #[arg(long, value_parser = parse_duration, default_value = "10m")]
    agent_timeout: Duration,

    /// Consecutive agent_error/landing_incomplete/failure Iterations
    /// before stopping.
    #[arg(long, default_value_t = LoopConfig::DEFAULT_CONSECUTIVE_FAILURE_LIMIT)]
    consecutive_failures: u32,

    /// Wall-clock budget for the whole run.
    #[arg(long, value_parser = parse_duration, default_value = "2h")]
    timeout: Duration,

    /// Maximum number of Iterations dispatched concurrently.
    #[arg(long, default_value_t = LoopConfig::DEFAULT_MAX_PARALLEL)]
    max_parallel: usize,

    /// Sugar for `--max-parallel=1`; conflicts with an explicit
    /// `--max-parallel` other than 1.
    #[arg(long)]
    sequential: bool,

    /// Print what would run without spawning the agent.
    #[arg(long)]
    dry_run: bool,

    /// Raise ralph's own log targets to debug.
    #[arg(long)]
    verbose: bool,

    /// Require the worktree to be clean (in addition to the item being
    /// closed) for an Iteration to count as success.
    #[arg(long, action = clap::ArgAction::Set, default_value_t = LoopConfig::DEFAULT_STRICT_LANDING)]
    strict_landing: bool,

    /// Agent program to invoke, plus any fixed arguments.
    #[arg(long, default_value = "claude")]
    agent_command: String,

    #[arg(long = "agent-arg")]
    agent_args: Vec<String>,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (number, unit) = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .map(|i| s.split_at(i))
        .unwrap_or((s, "s"));
    let value: f64 = number.parse().map_err(|_| format!("invalid duration: {s}"))?;
    let seconds = match unit {
        "s" | "" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => return Err(format!("unknown duration unit {other:?} in {s:?}")),
    };
    Ok(Duration::from_secs_f64(seconds))
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "info,ralph_core=debug,ralph_cli=debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let max_parallel = check_sequential_conflict(cli.sequential, cli.max_parallel)
        .context("--sequential conflicts with --max-parallel")?;

    let config = LoopConfig::new(
        cli.workdir.clone(),
        cli.epic,
        cli.bead,
        cli.max_iterations,
        cli.agent_timeout,
        cli.consecutive_failures,
        cli.timeout,
        max_parallel,
        cli.dry_run,
        cli.strict_landing,
    )
    .context("invalid configuration")?;

    let issue_client: Arc<dyn IssueClient> = Arc::new(BdIssueClient::default());
    let worktree_mgr = WorktreeManager::new(&config.workdir, None, config.max_parallel)
        .context("workdir is not a git repository")?;

    let exporter: Arc<dyn TraceExporter> = match OtlpHttpExporter::from_env() {
        Some(exporter) => Arc::new(exporter),
        None => Arc::new(NoopExporter),
    };
    let trace = Arc::new(TraceAggregator::new(TraceAggregator::DEFAULT_MAX_TRACES, exporter));
    let progress = ProgressBus::new();

    if cli.verbose {
        verbose::spawn_reporter(progress.subscribe());
    }

    let command = AgentCommand::new(cli.agent_command, cli.agent_args);
    let scheduler = Scheduler::new(config, issue_client, worktree_mgr, trace, progress, command);

    let cancel = CancellationToken::new();
    let cancel_for_signal = cancel.clone();
    let got_first_signal = Arc::new(AtomicBool::new(false));
    let got_first_for_signal = Arc::clone(&got_first_signal);

    tokio::spawn(async move {
        loop {
            tokio::signal::ctrl_c().await.ok();
            if got_first_for_signal.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(ralph_core::StopReason::Interrupted.exit_code());
            }
            eprintln!("\nShutting down gracefully (Ctrl+C again to force)...");
            cancel_for_signal.cancel();
        }
    });

    let summary = scheduler.run(cancel).await;

    println!(
        "stopped: {} ({} iteration(s) completed)",
        summary.stop_reason, summary.iterations_done
    );
    for (item_id, outcome) in &summary.outcomes {
        println!("  {item_id}: {outcome:?}");
    }

    std::process::exit(summary.stop_reason.exit_code());
}
