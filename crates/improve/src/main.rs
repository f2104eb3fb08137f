//! improve - autonomous improvement loop
//!
//! Entry point for the `improve` binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::{Parser, Subcommand};
use eyre::WrapErr;
use improve::orchestrator::{self, Orchestrator, OrchestratorError};
use improve::runner::CliAgentRunner;
use improve::{git, render, EventLog, ReconciliationEngine};
use improve_core::Config;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

const EXIT_OK: i32 = 0;
const EXIT_FATAL: i32 = 1;
const EXIT_DEPENDENCY: i32 = 2;
const EXIT_HARD_STOP: i32 = 3;
const EXIT_INTERRUPTED: i32 = 130;

/// Autonomous improvement loop over a git repository.
#[derive(Parser)]
#[command(name = "improve")]
#[command(about = "Plan, implement, review and merge improvements with coding agents")]
#[command(version)]
struct Cli {
    /// Config file path (overrides .improve/config)
    #[arg(long, global = true, env = "IMPROVE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the loop until the target number of improvements has merged
    Run {
        /// Merged improvements to reach
        #[arg(long)]
        target: Option<u32>,

        /// Pipelines to run concurrently
        #[arg(long)]
        parallel: Option<usize>,

        /// Agent model
        #[arg(long)]
        model: Option<String>,

        /// Review/fix cycles before escalating
        #[arg(long)]
        max_review_cycles: Option<u32>,

        /// Work on this task before the backlog
        #[arg(long)]
        task: Option<String>,

        /// Seconds to wait between improvements
        #[arg(long)]
        cooldown: Option<u64>,
    },

    /// Remove backlog and triage entries for work that already merged
    Reconcile {
        /// Report what would be removed without rewriting files
        #[arg(long)]
        dry_run: bool,
    },

    /// Summarize improvements recorded in the event log
    Summary,

    /// List improvement worktrees
    Workspaces,
}

fn main() {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    let code = runtime.block_on(async {
        match execute(cli).await {
            Ok(code) => code,
            Err(e) => {
                error!("{e:#}");
                EXIT_FATAL
            }
        }
    });
    drop(runtime);
    std::process::exit(code);
}

async fn execute(cli: Cli) -> eyre::Result<i32> {
    if !git::is_available(Path::new("git")).await {
        error!("git is not installed or not on PATH");
        return Ok(EXIT_DEPENDENCY);
    }

    let cwd = std::env::current_dir().wrap_err("failed to read current directory")?;
    let repo = git::repo_root(&cwd)
        .await
        .wrap_err("not inside a git repository")?;
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .wrap_err_with(|| format!("failed to load config {}", path.display()))?,
        None => Config::discover(&repo).wrap_err("failed to load .improve/config")?,
    };
    config.resolve_paths(&repo);

    match cli.command {
        Command::Run {
            target,
            parallel,
            model,
            max_review_cycles,
            task,
            cooldown,
        } => {
            if let Some(target) = target {
                config.target = target;
            }
            if let Some(parallel) = parallel {
                config.parallelism = parallel.max(1);
            }
            if let Some(model) = model {
                config.model = model;
            }
            if let Some(cycles) = max_review_cycles {
                config.max_review_cycles = cycles;
            }
            if let Some(cooldown) = cooldown {
                config.cooldown_sec = cooldown;
            }
            run_loop(config, repo, task).await
        }
        Command::Reconcile { dry_run } => {
            let report = ReconciliationEngine::new(&config, &repo)
                .run(dry_run)
                .await
                .wrap_err("reconciliation failed")?;
            render::print_reconcile_report(&report);
            Ok(EXIT_OK)
        }
        Command::Summary => {
            let events = EventLog::read_all(&config.event_log_path())
                .wrap_err("failed to read event log")?;
            render::print_summary(&render::summarize(&events));
            Ok(EXIT_OK)
        }
        Command::Workspaces => {
            let mut rows = Vec::new();
            for info in git::list_worktrees(&repo).await? {
                let Some(branch) = info.branch.as_deref() else {
                    continue;
                };
                if !branch.starts_with(&config.branch_prefix) {
                    continue;
                }
                let ahead = git::commits_ahead(&repo, &config.base_branch, branch)
                    .await
                    .ok();
                rows.push((info, ahead));
            }
            render::print_workspaces(&rows);
            Ok(EXIT_OK)
        }
    }
}

async fn run_loop(config: Config, repo: PathBuf, task: Option<String>) -> eyre::Result<i32> {
    if let Err(e) = orchestrator::preflight(&config).await {
        error!("{e}");
        return Ok(EXIT_DEPENDENCY);
    }

    let events = Arc::new(
        EventLog::open(config.event_log_path()).wrap_err("failed to open event log")?,
    );
    let runner = Arc::new(CliAgentRunner::new(
        Some(config.agent_bin()),
        config.agent_timeout_sec,
        Arc::clone(&events),
    ));

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let mut orchestrator = Orchestrator::new(config, repo, events, runner, cancel);
    if let Some(task) = task {
        orchestrator = orchestrator.with_task(task);
    }

    match orchestrator.run().await {
        Ok(summary) => {
            render::print_loop_summary(&summary);
            Ok(EXIT_OK)
        }
        Err(e) => {
            error!("{e}");
            Ok(match e {
                OrchestratorError::DependencyMissing(_) => EXIT_DEPENDENCY,
                OrchestratorError::TooManyFailures { .. } => EXIT_HARD_STOP,
                OrchestratorError::Interrupted { .. } => EXIT_INTERRUPTED,
                _ => EXIT_FATAL,
            })
        }
    }
}

/// Cancel the loop on the first SIGINT/SIGTERM; a second signal exits.
async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");

        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT, stopping after in-flight work is settled"),
            _ = sigterm.recv() => info!("received SIGTERM, stopping after in-flight work is settled"),
        }
        cancel.cancel();

        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received SIGINT, stopping after in-flight work is settled");
        }
        cancel.cancel();
        let _ = tokio::signal::ctrl_c().await;
    }

    warn!("second signal received, exiting immediately");
    std::process::exit(EXIT_INTERRUPTED);
}
