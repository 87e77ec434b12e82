use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use mitosis_core::cell::CellActivities;
use mitosis_core::config::{EngineMode, MitosisConfig};
use mitosis_core::coordinator::Coordinator;
use mitosis_core::ports::PortAllocator;
use mitosis_core::report::{ReportWriter, RunReport};
use mitosis_core::server::ServerSupervisor;
use mitosis_core::worktree::WorktreeService;
use mitosis_core::{taskdb, CoreError};

#[derive(Parser)]
#[command(name = "mitosis", version, about = "TCR agent-cell orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute tasks from the task database under TCR discipline.
    Run(RunArgs),
    /// Remove leftover cell trees and their derived branches.
    Cleanup(SharedArgs),
}

#[derive(Args)]
struct SharedArgs {
    /// Configuration file.
    #[arg(long, default_value = "mitosis.toml")]
    config: PathBuf,

    /// Repository the working trees are carved from.
    #[arg(long)]
    repo: Option<PathBuf>,

    /// Directory the working trees live under.
    #[arg(long)]
    worktrees: Option<PathBuf>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    shared: SharedArgs,

    /// Task database: newline-delimited JSON records.
    #[arg(long)]
    db: PathBuf,

    /// Maximum concurrent cells. Defaults to the port-range size.
    #[arg(long)]
    agents: Option<usize>,

    /// Maximum number of tasks to admit from the database.
    #[arg(long)]
    tasks: Option<usize>,

    /// Per-task deadline in seconds.
    #[arg(long)]
    timeout: Option<u64>,

    /// Base branch the working trees start from.
    #[arg(long)]
    branch: Option<String>,

    /// Lowest port handed to cells.
    #[arg(long)]
    port_min: Option<u16>,

    /// Highest port handed to cells.
    #[arg(long)]
    port_max: Option<u16>,

    /// TCR state machine flavour.
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    /// Directory run reports are written to.
    #[arg(long)]
    reports: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Basic,
    Enhanced,
}

#[tokio::main]
async fn main() -> ExitCode {
    mitosis_core::init_tracing();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Command::Run(args) => run(args).await,
        Command::Cleanup(args) => cleanup(args).await,
    };

    match outcome {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("mitosis: {e:#}");
            ExitCode::from(2)
        }
    }
}

/// Load the config file (when present) and fold the CLI overrides in.
fn load_config(args: &RunArgs) -> anyhow::Result<MitosisConfig> {
    let mut config = if args.shared.config.exists() {
        MitosisConfig::load(&args.shared.config)
            .with_context(|| format!("loading {}", args.shared.config.display()))?
    } else {
        MitosisConfig::default()
    };

    if let Some(repo) = &args.shared.repo {
        config.worktree.repo = repo.display().to_string();
    }
    if let Some(worktrees) = &args.shared.worktrees {
        config.worktree.base_dir = worktrees.display().to_string();
    }
    if let Some(branch) = &args.branch {
        config.worktree.source_branch = branch.clone();
    }
    if let Some(min) = args.port_min {
        config.ports.min = min;
    }
    if let Some(max) = args.port_max {
        config.ports.max = max;
    }
    if let Some(agents) = args.agents {
        config.coordinator.max_concurrent = agents;
    }
    if let Some(tasks) = args.tasks {
        config.coordinator.max_tasks = tasks;
    }
    if let Some(timeout) = args.timeout {
        config.engine.task_timeout_seconds = timeout;
    }
    if let Some(mode) = args.mode {
        config.engine.mode = match mode {
            ModeArg::Basic => EngineMode::Basic,
            ModeArg::Enhanced => EngineMode::Enhanced,
        };
    }
    if let Some(reports) = &args.reports {
        config.reports.dir = reports.display().to_string();
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn run(args: RunArgs) -> anyhow::Result<u8> {
    let config = load_config(&args)?;

    let records = taskdb::load_records(&args.db)
        .with_context(|| format!("loading task db {}", args.db.display()))?;
    let agents = taskdb::to_agent_configs(&records, config.coordinator.max_tasks);
    if agents.is_empty() {
        anyhow::bail!("task db {} contains no tasks", args.db.display());
    }

    let ports = Arc::new(
        PortAllocator::new(config.ports.min, config.ports.max).context("invalid port range")?,
    );
    let worktrees = Arc::new(WorktreeService::new(
        config.repo_root(),
        PathBuf::from(&config.worktree.base_dir),
    ));
    let servers = Arc::new(ServerSupervisor::new(
        config.server.clone(),
        Arc::new(Semaphore::new(config.server.bootstrap_permits)),
    ));
    let driver = Arc::new(CellActivities::new(ports, worktrees, servers));

    let mut coordinator = Coordinator::new(
        driver,
        config.engine.clone(),
        config.worktree.source_branch.clone(),
        config.effective_max_concurrent(),
    );
    for agent in agents {
        coordinator.add_agent(agent);
    }
    coordinator.on_success(Arc::new(|result| {
        println!("ok   {} ({} ms)", result.task_id, result.duration_ms);
    }));
    coordinator.on_failure(Arc::new(|result| {
        let kind = result.error_kind.as_deref().unwrap_or("failed");
        println!("FAIL {} [{kind}]", result.task_id);
    }));

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("mitosis: interrupt received, aborting outstanding tasks");
            signal_cancel.cancel();
        }
    });

    let summary = match coordinator.execute(cancel).await {
        Ok(summary) => summary,
        Err(CoreError::Cancelled) => {
            eprintln!("mitosis: run cancelled");
            return Ok(1);
        }
        Err(e @ CoreError::Config(_)) => return Err(e.into()),
        Err(e) => {
            eprintln!("mitosis: run failed: {e}");
            return Ok(1);
        }
    };

    let report = RunReport {
        run_id: summary.run_id,
        generated_at: chrono::Utc::now(),
        branch: config.worktree.source_branch.clone(),
        mode: format!("{:?}", config.engine.mode).to_lowercase(),
        metrics: summary.metrics.clone(),
        tasks: summary.results.clone(),
    };
    let report_path = ReportWriter::new(PathBuf::from(&config.reports.dir)).write(&report)?;

    let m = &summary.metrics;
    println!(
        "{} tasks: {} succeeded, {} failed, {} skipped in {:.1} s (parallel factor {:.2})",
        m.total,
        m.succeeded,
        m.failed,
        m.skipped,
        m.total_time_ms as f64 / 1_000.0,
        m.parallel_factor
    );
    println!("report: {}", report_path.display());

    Ok(if summary.all_succeeded() { 0 } else { 1 })
}

async fn cleanup(args: SharedArgs) -> anyhow::Result<u8> {
    let config = if args.config.exists() {
        MitosisConfig::load(&args.config)?
    } else {
        MitosisConfig::default()
    };

    let repo = args
        .repo
        .unwrap_or_else(|| config.repo_root());
    let base_dir = args
        .worktrees
        .unwrap_or_else(|| PathBuf::from(&config.worktree.base_dir));

    let worktrees = WorktreeService::new(repo, base_dir);
    let removed = worktrees.cleanup_all().await?;
    println!("removed {removed} working trees");
    Ok(0)
}
