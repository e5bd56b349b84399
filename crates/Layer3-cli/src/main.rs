//! hotfolder CLI - Main entry point

use clap::{Parser, Subcommand};
use hotfolder_foundation::{ActiveUpdate, Error, Ledger, WatcherConfig};
use hotfolder_task::{AbortOutcome, Controller, Dispatcher, DispatcherConfig, MarkerStore, WatchService};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// hotfolder - run an external program for every file dropped in a watched folder
#[derive(Parser, Debug)]
#[command(name = "hotfolder")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Config file (default: ~/.hotfolder.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the watcher daemon
    Run,
    /// Write an example config file
    Init,
    /// Show active tasks
    Status {
        /// Machine-readable output
        #[arg(long)]
        json: bool,
    },
    /// Show finished tasks, newest first
    History {
        /// Number of records to show (default from config)
        #[arg(short, long)]
        limit: Option<u32>,

        /// Machine-readable output
        #[arg(long)]
        json: bool,
    },
    /// Abort the task working on a file
    Abort {
        /// Full path of the input file, as shown by `status`
        file_path: String,
    },
    /// Send a failed file back to its input folder
    Retry {
        /// Task name
        task: String,

        /// Bare file name inside the task's failed folder
        file_name: String,
    },
    /// Report progress for a running task (called by executors)
    Progress {
        /// Full path of the input file being processed
        file_path: String,

        /// Current stage label
        #[arg(long)]
        stage: Option<String>,

        /// Free-form progress message
        #[arg(long)]
        message: Option<String>,
    },
}

fn config_path(args: &Args) -> anyhow::Result<PathBuf> {
    match &args.config {
        Some(path) => Ok(path.clone()),
        None => WatcherConfig::default_path()
            .ok_or_else(|| anyhow::anyhow!("cannot determine home directory; pass --config")),
    }
}

fn load_config(args: &Args) -> anyhow::Result<WatcherConfig> {
    let path = config_path(args)?;
    Ok(WatcherConfig::load(&path)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match &args.command {
        Command::Init => {
            let path = config_path(&args)?;
            WatcherConfig::write_example(&path)?;
            println!("Example config written to {}", path.display());
            println!("Edit it, then start the daemon with: hotfolder run");
            Ok(())
        }
        Command::Run => run_daemon(&args).await,
        Command::Status { json } => show_status(&args, *json),
        Command::History { limit, json } => show_history(&args, *limit, *json),
        Command::Abort { file_path } => abort_task(&args, file_path).await,
        Command::Retry { task, file_name } => retry_file(&args, task, file_name),
        Command::Progress {
            file_path,
            stage,
            message,
        } => report_progress(&args, file_path, stage.clone(), message.clone()),
    }
}

// ============================================================================
// Daemon
// ============================================================================

async fn run_daemon(args: &Args) -> anyhow::Result<()> {
    let config = load_config(args)?;
    config.validate()?;
    config.ensure_dirs()?;

    let kinds: Vec<Arc<_>> = config.tasks.iter().cloned().map(Arc::new).collect();
    let enabled: Vec<Arc<_>> = kinds.iter().filter(|k| k.enabled).cloned().collect();
    if enabled.is_empty() {
        anyhow::bail!("no enabled tasks in the configuration");
    }

    let ledger = Arc::new(Ledger::open(&config.database_path)?);
    let markers = MarkerStore::new(&config.pids_dir);
    let dispatcher = Arc::new(Dispatcher::new(
        ledger,
        markers,
        kinds,
        DispatcherConfig {
            max_concurrent: config.max_concurrent_tasks,
            tick_interval: config.tick_interval(),
            error_backoff: config.error_backoff(),
        },
    ));

    // leftover records first, then the files already on disk, then live
    dispatcher.recover().await?;
    let watch = WatchService::start(&enabled)?;
    WatchService::scan_existing(&enabled, &dispatcher).await?;

    let forwarder = tokio::spawn(watch.forward(dispatcher.clone()));

    tracing::info!(
        tasks = enabled.len(),
        max_concurrent = config.max_concurrent_tasks,
        "hotfolder daemon started"
    );

    tokio::select! {
        _ = dispatcher.clone().run() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested; running children keep going");
        }
    }

    forwarder.abort();
    Ok(())
}

// ============================================================================
// Operator commands
// ============================================================================

fn show_status(args: &Args, json: bool) -> anyhow::Result<()> {
    let config = load_config(args)?;
    let ledger = Ledger::open(&config.database_path)?;
    let active = ledger.list_active()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&active)?);
        return Ok(());
    }

    if active.is_empty() {
        println!("No active tasks.");
        return Ok(());
    }

    println!(
        "{:<12} {:<10} {:>8} {:<16} {}",
        "TASK", "STATUS", "PID", "STAGE", "FILE"
    );
    for record in active {
        println!(
            "{:<12} {:<10} {:>8} {:<16} {}",
            record.task_name,
            record.status.to_string(),
            record
                .executor_pid
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            record.current_stage.as_deref().unwrap_or("-"),
            record.file_path,
        );
        if let Some(message) = &record.message {
            println!("  {message}");
        }
    }
    Ok(())
}

fn show_history(args: &Args, limit: Option<u32>, json: bool) -> anyhow::Result<()> {
    let config = load_config(args)?;
    let ledger = Ledger::open(&config.database_path)?;
    let history = ledger.list_history(limit.unwrap_or(config.history_limit))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&history)?);
        return Ok(());
    }

    if history.is_empty() {
        println!("No finished tasks.");
        return Ok(());
    }

    println!(
        "{:<12} {:<10} {:<25} {}",
        "TASK", "RESULT", "FINISHED", "FILE"
    );
    for record in history {
        println!(
            "{:<12} {:<10} {:<25} {}",
            record.task_name,
            record.final_status.to_string(),
            record.end_time,
            record.file_path,
        );
        if let Some(message) = &record.final_message {
            if !message.is_empty() {
                println!("  {message}");
            }
        }
    }
    Ok(())
}

async fn abort_task(args: &Args, file_path: &str) -> anyhow::Result<()> {
    let config = load_config(args)?;
    let ledger = Arc::new(Ledger::open(&config.database_path)?);
    let controller = Controller::new(
        ledger,
        MarkerStore::new(&config.pids_dir),
        config.abort_grace(),
    );

    match controller.abort(file_path).await? {
        AbortOutcome::SignalSent(pid) => {
            println!("Abort signal sent to pid {pid}.");
            if !config.abort_grace().is_zero() {
                // keep the process alive long enough for the escalation timer
                tokio::time::sleep(config.abort_grace() + std::time::Duration::from_secs(1)).await;
            }
        }
        AbortOutcome::AlreadyFinished(detail) => {
            println!("Task already finished: {detail}");
        }
    }
    Ok(())
}

fn retry_file(args: &Args, task: &str, file_name: &str) -> anyhow::Result<()> {
    let config = load_config(args)?;
    let kind = config
        .task_by_name(task)
        .ok_or_else(|| Error::NotFound(format!("no task named '{task}'")))?;

    let controller = Controller::new(
        Arc::new(Ledger::open(&config.database_path)?),
        MarkerStore::new(&config.pids_dir),
        config.abort_grace(),
    );
    controller.retry(kind, file_name)?;
    println!("Moved '{file_name}' back to {}.", kind.input_dir.display());
    Ok(())
}

fn report_progress(
    args: &Args,
    file_path: &str,
    stage: Option<String>,
    message: Option<String>,
) -> anyhow::Result<()> {
    if stage.is_none() && message.is_none() {
        anyhow::bail!("nothing to report; pass --stage and/or --message");
    }

    let config = load_config(args)?;
    let ledger = Ledger::open(&config.database_path)?;
    if !ledger.update_active(file_path, &ActiveUpdate::progress(stage, message))? {
        anyhow::bail!("no active task for file '{file_path}'");
    }
    Ok(())
}
