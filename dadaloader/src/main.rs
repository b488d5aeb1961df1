use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dadaloader::config::AppConfig;
use dadaloader::database::{self, repositories::SqlxDownloadRepository};
use dadaloader::domain::TaskSnapshot;
use dadaloader::downloader::engine::{Aria2Engine, DownloadEngine};
use dadaloader::downloader::{DownloadManager, EngineSupervisor, TaskEvent};
use dadaloader::logging::init_logging;
use dadaloader::utils::format::{format_eta, format_speed};
use dadaloader::utils::fs::ensure_dir_all;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "dadaloader", version, about = "Download manager driving aria2c")]
struct Cli {
    /// Log filter directives, e.g. `dadaloader=debug`; overrides RUST_LOG
    #[arg(long, global = true, value_name = "DIRECTIVES")]
    log_filter: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Add a download and follow it until it finishes
    Add {
        url: String,
        /// Target file; defaults to a free name in the download directory
        save_path: Option<PathBuf>,
    },
    /// Show all downloads
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Resume interrupted downloads and follow them
    Run,
    /// Restart a stopped, failed or completed download and follow it
    Start { id: i64 },
    /// Mark a download as stopped
    Stop { id: i64 },
    /// Delete a download and its files
    Remove { id: i64 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = AppConfig::from_env()?;
    let (logging, _guard) = init_logging(&config.log_dir)?;
    let cancel = CancellationToken::new();
    if let Some(directives) = &cli.log_filter {
        logging.set_filter(directives)?;
    }
    debug!(filter = %logging.filter(), "Logging to {}", logging.dir().display());
    logging.spawn_retention(cancel.child_token());

    let pool = database::init_pool(&config.database_url)
        .await
        .with_context(|| format!("opening database {}", config.database_url))?;
    database::run_migrations(&pool).await?;

    let engine = Arc::new(Aria2Engine::with_config(config.engine_config()));
    match engine.version() {
        Some(version) => info!("Using {}", version),
        None => warn!(
            "{} is not available; downloads will fail until it is installed",
            config.aria2c_path
        ),
    }

    let manager_config = config.manager_config();
    let supervisor = Arc::new(EngineSupervisor::new(
        engine,
        manager_config.supervisor.clone(),
    ));
    let repo = Arc::new(SqlxDownloadRepository::new(pool.clone()));
    let manager = DownloadManager::new(repo, supervisor, manager_config);

    let result = execute(cli.command, &manager, &config).await;

    cancel.cancel();
    pool.close().await;
    result
}

async fn execute(command: Command, manager: &DownloadManager, config: &AppConfig) -> anyhow::Result<()> {
    if !matches!(command, Command::List { .. }) {
        manager.load_from_store().await?;
    }

    match command {
        Command::Add { url, save_path } => {
            let save_path = match save_path {
                Some(path) => std::path::absolute(&path)
                    .with_context(|| format!("resolving {}", path.display()))?,
                None => {
                    ensure_dir_all(&config.download_dir)?;
                    manager.suggest_save_path(&url, &config.download_dir)?
                }
            };
            let id = manager.add_task(&url, &save_path).await?;
            println!("Added download {} -> {}", id, save_path.display());
            follow(manager).await
        }
        Command::List { json } => {
            // Listing must not rewrite rows another process may be driving.
            let tasks = manager.inspect_store().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tasks)?);
            } else {
                print_table(&tasks);
            }
            Ok(())
        }
        Command::Run => {
            let resumed = manager.resume_all().await?;
            if resumed == 0 {
                println!("Nothing to resume");
                return Ok(());
            }
            info!("Resumed {} downloads", resumed);
            follow(manager).await
        }
        Command::Start { id } => {
            if !manager.start_task(id).await? {
                let task = manager.get_task(id)?;
                anyhow::bail!("download {} cannot be started while {}", id, task.status);
            }
            follow(manager).await
        }
        Command::Stop { id } => {
            if manager.stop_task(id).await? {
                println!("Stopped download {}", id);
            } else {
                println!("Download {} is not active", id);
            }
            Ok(())
        }
        Command::Remove { id } => {
            manager.delete_task(id).await?;
            println!("Removed download {}", id);
            Ok(())
        }
    }
}

/// Report task events until nothing is running or Ctrl-C.
async fn follow(manager: &DownloadManager) -> anyhow::Result<()> {
    let mut events = manager.subscribe();
    let mut idle_check = tokio::time::interval(Duration::from_millis(500));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result.context("listening for Ctrl-C")?;
                info!("Interrupted, pausing downloads");
                manager.shutdown().await;
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(TaskEvent::Updated(task)) => report(&task),
                Ok(TaskEvent::Failed { id, message }) => warn!(task_id = id, "{}", message),
                Ok(TaskEvent::Removed { .. }) => {}
                Err(RecvError::Lagged(skipped)) => debug!("Skipped {} task events", skipped),
                Err(RecvError::Closed) => return Ok(()),
            },
            _ = idle_check.tick() => {
                if !manager.has_active_tasks() {
                    return Ok(());
                }
            }
        }
    }
}

fn report(task: &TaskSnapshot) {
    info!(
        task_id = task.id,
        "{} {} {:.1}% of {} at {}, ETA {}",
        task.file_name(),
        task.status,
        task.progress,
        task.size_display(),
        format_speed(task.speed_mbps),
        format_eta(task.eta_secs)
    );
}

fn print_table(tasks: &[TaskSnapshot]) {
    if tasks.is_empty() {
        println!("No downloads");
        return;
    }

    println!(
        "{:>4}  {:<11}  {:>7}  {:>12}  {}",
        "ID", "STATUS", "DONE", "SIZE", "FILE"
    );
    for task in tasks {
        println!(
            "{:>4}  {:<11}  {:>6.1}%  {:>12}  {}",
            task.id,
            task.status.to_string(),
            task.progress,
            task.size_display(),
            task.save_path.display()
        );
        if let Some(error) = &task.last_error {
            println!("      {}", error);
        }
    }
}
