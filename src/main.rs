use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::watch;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use cron_scheduler::config::SchedulerConfig;
use cron_scheduler::runner::ShellRunner;
use cron_scheduler::scheduler::{self, SchedulerEngine};
use cron_scheduler::store::{ExecutionStore, LibSqlBackend, TaskStore};
use cron_scheduler::tasks::{DEFAULT_MAX_RETRIES, NewTask};

/// Cron-style job scheduler.
#[derive(Parser)]
#[command(name = "cron-scheduler")]
#[command(about = "Run shell commands on cron schedules")]
#[command(version)]
struct Cli {
    /// Database path (overrides CRON_SCHEDULER_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the scheduler loop in the foreground
    Run,

    /// Register a new task
    Add {
        #[arg(long)]
        name: String,

        /// Five-field cron expression
        #[arg(long)]
        cron: String,

        /// Shell command to run
        #[arg(long)]
        command: String,

        #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
        max_retries: u32,
    },

    /// List all tasks
    List,

    /// Show one task
    Show { id: i64 },

    /// Show recent executions of a task
    Runs {
        id: i64,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Run a task on the next tick regardless of its schedule
    ForceRun { id: i64 },

    /// Stop scheduling a task
    Pause { id: i64 },

    /// Resume a paused task
    Resume { id: i64 },

    /// Delete a task and its execution history
    Delete { id: i64 },

    /// Print the next due times of a cron expression
    Preview {
        expression: String,

        #[arg(long, default_value_t = 5)]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = SchedulerConfig::from_env().context("Invalid configuration")?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    let log_dir = matches!(cli.command, Commands::Run).then_some(config.log_dir.as_path());
    let _guard = init_tracing(log_dir)?;

    let command = match cli.command {
        Commands::Preview { expression, count } => {
            let times: Vec<String> = scheduler::upcoming(&expression, count, Utc::now())?
                .into_iter()
                .map(|t| t.to_rfc3339())
                .collect();
            return print_json(&times);
        }
        command => command,
    };

    let store = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );

    match command {
        Commands::Run => run(config, store).await?,
        Commands::Add {
            name,
            cron,
            command,
            max_retries,
        } => {
            scheduler::validate(&cron)?;
            let task = store
                .create_task(&NewTask::new(name, cron, command).with_max_retries(max_retries))
                .await?;
            print_json(&task)?;
        }
        Commands::List => print_json(&store.list_tasks().await?)?,
        Commands::Show { id } => print_json(&store.get_task(id).await?)?,
        Commands::Runs { id, limit } => {
            store.get_task(id).await?;
            print_json(&store.list_executions_for_task(id, limit).await?)?;
        }
        Commands::ForceRun { id } => {
            store.request_force_run(id, Utc::now()).await?;
            print_json(&store.get_task(id).await?)?;
        }
        Commands::Pause { id } => {
            if !store.set_paused(id, true).await? {
                bail!("task {id} is running and cannot be paused");
            }
            print_json(&store.get_task(id).await?)?;
        }
        Commands::Resume { id } => {
            if !store.set_paused(id, false).await? {
                bail!("task {id} is not paused");
            }
            print_json(&store.get_task(id).await?)?;
        }
        Commands::Delete { id } => {
            if !store.delete_task(id).await? {
                bail!("task {id} not found");
            }
            eprintln!("Deleted task {id}");
        }
        // Answered above without touching the database.
        Commands::Preview { .. } => {}
    }

    Ok(())
}

async fn run(config: SchedulerConfig, store: Arc<LibSqlBackend>) -> anyhow::Result<()> {
    let runner = Arc::new(ShellRunner::from_config(&config));
    let grace = config.shutdown_grace;

    eprintln!("⏱  Cron Scheduler v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!(
        "   Poll every {}s, {} workers, stale after {}s ({:?})",
        config.poll_interval.as_secs(),
        config.max_concurrent_runs,
        config.running_timeout.as_secs(),
        config.stale_policy,
    );

    let engine = Arc::new(SchedulerEngine::new(config, store, runner));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loop_handle = tokio::spawn(Arc::clone(&engine).run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutdown requested, waiting for in-flight tasks");

    let _ = shutdown_tx.send(true);
    loop_handle.await.context("Scheduler loop panicked")?;

    if !engine.drain(grace).await {
        tracing::warn!(grace_secs = grace.as_secs(), "Exiting with tasks still running");
    }
    Ok(())
}

/// Console logging on stderr, plus a daily rolling file when `log_dir` is set.
fn init_tracing(log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix("scheduler")
                .filename_suffix("log")
                .build(dir)
                .context("Failed to create log file appender")?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
