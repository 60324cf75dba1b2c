use anyhow::{Context, Result};
use autonomous::board::{Board, GithubBoard};
use autonomous::config::Config;
use autonomous::evaluator::ReadyQueueEvaluator;
use autonomous::events::EventBus;
use autonomous::orchestrator::Orchestrator;
use autonomous::process::{ProcessSupervisor, SessionFile};
use autonomous::providers::Provider;
use autonomous::registry::AssignmentRegistry;
use autonomous::slots::InstanceSlotAllocator;
use autonomous::supervisor::SupervisorContext;
use autonomous::worktree::WorktreeProvider;
use clap::{Parser, Subcommand};
use console::style;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "autonomous")]
#[command(version, about = "Autonomous development orchestrator")]
pub struct Cli {
    /// Debug-level logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Repository root (defaults to the current directory).
    #[arg(long, global = true)]
    pub repo_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Watch the board and drive ready items to completion
    Run {
        /// Restrict scheduling to one epic's phased items
        #[arg(long)]
        epic: Option<String>,

        /// Note in phase-master prompts that the orchestrator merges PRs
        #[arg(long)]
        auto_merge: bool,
    },
    /// Show live worker sessions for this repository
    Status,
    /// Probe which worker CLIs are installed
    Doctor,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let repo_dir = match &cli.repo_dir {
        Some(dir) => dir.clone(),
        None => match std::env::current_dir() {
            Ok(dir) => dir,
            Err(e) => {
                eprintln!("error: cannot determine current directory: {e}");
                return ExitCode::FAILURE;
            }
        },
    };

    match &cli.command {
        Commands::Run { epic, auto_merge } => {
            cmd_run(&cli, repo_dir, epic.clone(), *auto_merge).await
        }
        Commands::Status => report(cmd_status(&cli, repo_dir)),
        Commands::Doctor => report(cmd_doctor().await),
    }
}

fn report(result: Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool, log_dir: Option<&std::path::Path>) -> Option<impl Drop> {
    let default_filter = if verbose { "autonomous=debug,info" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(dir, "orchestrator.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(console_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console_layer)
                .init();
            None
        }
    }
}

async fn cmd_run(
    cli: &Cli,
    repo_dir: PathBuf,
    epic: Option<String>,
    auto_merge: bool,
) -> ExitCode {
    // Startup failures are unrecoverable by design: report and exit 1.
    let config = match Config::load(repo_dir, epic, auto_merge, cli.verbose) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = config.ensure_directories() {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }
    let _log_guard = init_tracing(cli.verbose, Some(&config.logs_dir));

    let board_config = match config.board_config() {
        Ok(board_config) => board_config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let board: Arc<dyn Board> = match GithubBoard::new(board_config) {
        Ok(board) => Arc::new(board),
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let worktrees = Arc::new(WorktreeProvider::new(config.repo_root.clone()));
    if let Err(e) = worktrees.default_branch() {
        error!("cannot resolve a default branch: {e}");
        return ExitCode::FAILURE;
    }

    let registry = Arc::new(AssignmentRegistry::new(Arc::clone(&board)));
    let ctx = SupervisorContext {
        config: Arc::clone(&config),
        registry,
        board: Arc::clone(&board),
        process: Arc::new(ProcessSupervisor::new(config.sessions_dir.clone())),
        worktrees,
        slots: Arc::new(InstanceSlotAllocator::new(&config.capacities())),
        events: EventBus::new(),
    };
    if cli.verbose {
        spawn_event_logger(ctx.events.subscribe());
    }

    let evaluator = Arc::new(ReadyQueueEvaluator::new(Arc::clone(&board)));
    let mut orchestrator = Orchestrator::new(ctx, evaluator);

    info!(
        repo = %config.repo_root.display(),
        epic = config.epic.as_deref().unwrap_or("-"),
        "starting orchestrator"
    );

    let interrupted = Arc::new(AtomicBool::new(false));
    let cancel = orchestrator.cancel_token();
    {
        let interrupted = Arc::clone(&interrupted);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupted.store(true, Ordering::SeqCst);
                info!("interrupt received, shutting down");
                cancel.cancel();
            }
        });
    }

    if let Err(e) = orchestrator.run().await {
        error!("orchestrator stopped with an error: {e:#}");
        return ExitCode::FAILURE;
    }

    if interrupted.load(Ordering::SeqCst) {
        ExitCode::from(EXIT_INTERRUPTED)
    } else {
        ExitCode::SUCCESS
    }
}

/// Mirror the orchestrator's event stream into the log, the way any UI
/// subscriber would consume it.
fn spawn_event_logger(
    mut events: tokio::sync::broadcast::Receiver<autonomous::events::OrchestratorEvent>,
) {
    use autonomous::events::OrchestratorEvent;
    use tokio::sync::broadcast::error::RecvError;

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(OrchestratorEvent::SupervisorStarted {
                    issue_number,
                    instance_id,
                    ..
                }) => {
                    info!(issue = issue_number, instance = %instance_id, "supervisor started");
                }
                Ok(OrchestratorEvent::StatusChanged {
                    issue_number,
                    status,
                    ..
                }) => {
                    info!(issue = issue_number, status = %status, "status changed");
                }
                Ok(OrchestratorEvent::AssignmentFinished {
                    issue_number,
                    status,
                    pr_number,
                    ..
                }) => {
                    info!(issue = issue_number, status = %status, pr = pr_number, "assignment finished");
                }
                Ok(OrchestratorEvent::ReconcileCompleted { report }) => {
                    info!(%report, "reconcile completed");
                }
                Err(RecvError::Lagged(skipped)) => {
                    info!(skipped, "event stream lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn cmd_status(cli: &Cli, repo_dir: PathBuf) -> Result<()> {
    let config = Config::load(repo_dir, None, false, cli.verbose)
        .context("failed to load configuration")?;

    let sessions = SessionFile::load_all(&config.sessions_dir);
    if sessions.is_empty() {
        println!("No live worker sessions.");
        return Ok(());
    }

    println!("{}", style("Live worker sessions").bold());
    for session in sessions {
        println!(
            "  {}  pid={}  started={}  worktree={}",
            style(&session.instance_id.to_string()).cyan(),
            session
                .process_id
                .map(|p| p.to_string())
                .unwrap_or_else(|| "?".to_string()),
            session.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            session.worktree_path.display(),
        );
    }
    Ok(())
}

async fn cmd_doctor() -> Result<()> {
    println!("{}", style("Worker CLI availability").bold());
    for provider in Provider::ALL {
        match provider.version().await {
            Some(version) => {
                println!("  {}  {}", style(provider.name()).green(), version);
            }
            None => {
                println!("  {}  not installed", style(provider.name()).red());
            }
        }
    }
    Ok(())
}
