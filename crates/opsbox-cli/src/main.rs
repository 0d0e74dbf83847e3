//! opsbox - task lifecycle runner
//!
//! タスクの作成・一覧・表示、保持期間クリーンアップ、worker の常駐実行と demo。

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use opsbox_core::app::{AppBuilder, MEMORY_STORE_URL, SimulatedWork, TaskCounts, open_store};
use opsbox_core::config::OpsboxConfig;
use opsbox_core::domain::{Task, TaskId};
use opsbox_core::impls::{FanoutMetrics, OtelMetrics, RecordingMetrics};
use opsbox_core::logging;
use opsbox_core::ports::{MetricsSink, TaskStore};

#[derive(Parser)]
#[command(name = "opsbox")]
#[command(about = "Queue tasks, run them on workers, purge old results", long_about = None)]
struct Cli {
    /// Overrides OPSBOX_DATABASE_URL (`memory://` for an in-memory store)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a task
    Create {
        /// Task title
        title: Option<String>,
    },
    /// List tasks in insertion order
    List,
    /// Show one task
    Show {
        /// Task id (`task-<ulid>` or bare ulid)
        id: String,
    },
    /// Delete finished tasks older than the retention window, once
    Cleanup {
        /// Overrides OPSBOX_RETENTION_MINUTES
        #[arg(long)]
        retention_minutes: Option<i64>,
    },
    /// Enqueue every NEW/PENDING task and run workers + the reaper beat
    /// until ctrl-c
    Run,
    /// Create N tasks, run them through an in-process worker pool, print
    /// the resulting counts and metrics
    Demo {
        #[arg(long, default_value = "10")]
        tasks: usize,
        /// Per-task work time bounds
        #[arg(long, default_value = "500")]
        min_ms: u64,
        #[arg(long, default_value = "1500")]
        max_ms: u64,
        /// Probability that a task succeeds
        #[arg(long, default_value = "0.5")]
        success_rate: f64,
    },
}

fn print_task(task: &Task) {
    println!(
        "{} | {:<9} | {} | {}",
        task.id,
        task.status,
        task.created_at.to_rfc3339(),
        task.title.as_deref().unwrap_or("-"),
    );
}

fn print_counts(counts: &TaskCounts) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(counts)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = OpsboxConfig::from_env()?;
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }
    logging::init(config.log_format);

    match cli.command {
        Commands::Create { title } => {
            let store = open_store(&config.database_url).await?;
            let task = store.create(title).await?;
            print_task(&task);
        }
        Commands::List => {
            let store = open_store(&config.database_url).await?;
            for task in store.list().await? {
                print_task(&task);
            }
        }
        Commands::Show { id } => {
            let id: TaskId = id.parse().context("invalid task id")?;
            let store = open_store(&config.database_url).await?;
            let Some(task) = store.get(id).await? else {
                bail!("task not found: {id}");
            };
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        Commands::Cleanup { retention_minutes } => {
            if let Some(minutes) = retention_minutes {
                config.retention_minutes = minutes;
            }
            config.validate()?;
            let retention = config.retention();
            let app = AppBuilder::new()
                .store(open_store(&config.database_url).await?)
                .config(config)
                .build()?;
            let deleted = app.reaper().cleanup(retention).await?;
            println!("deleted {deleted} task(s)");
        }
        Commands::Run => {
            let app = AppBuilder::new()
                .store(open_store(&config.database_url).await?)
                .config(config)
                .build()?;

            // プロセス内キューは空で始まるので、待っているものを publish し直す
            let gateway = app.gateway();
            let mut enqueued = 0;
            for task in app.store().list().await? {
                if task.status.is_enqueueable() {
                    gateway.run(task.id).await?;
                    enqueued += 1;
                }
            }
            info!(enqueued, "queued waiting tasks");

            let running = app.start();
            tokio::signal::ctrl_c().await?;
            info!("ctrl-c received, shutting down");
            running.shutdown().await;
            print_counts(&app.counts().await?)?;
        }
        Commands::Demo {
            tasks,
            min_ms,
            max_ms,
            success_rate,
        } => {
            config.database_url = MEMORY_STORE_URL.to_string();
            let recorded = Arc::new(RecordingMetrics::new());
            let app = AppBuilder::new()
                .store(open_store(&config.database_url).await?)
                .handler(Arc::new(SimulatedWork::new(
                    Duration::from_millis(min_ms),
                    Duration::from_millis(max_ms),
                    success_rate,
                )))
                .metrics(Arc::new(FanoutMetrics::new(vec![
                    recorded.clone() as Arc<dyn MetricsSink>,
                    Arc::new(OtelMetrics::global()),
                ])))
                .config(config)
                .build()?;

            let store = app.store();
            let gateway = app.gateway();
            for n in 0..tasks {
                let task = store.create(Some(format!("demo task {n}"))).await?;
                let receipt = gateway.run(task.id).await?;
                info!(job_id = %receipt.job_id, task_id = %task.id, "enqueued");
            }

            let running = app.start();
            loop {
                let counts = app.counts().await?;
                if counts.is_settled() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            running.shutdown().await;

            for task in store.list().await? {
                print_task(&task);
            }
            print_counts(&app.counts().await?)?;
            println!("{}", serde_json::to_string_pretty(&recorded.snapshot())?);
        }
    }

    Ok(())
}
