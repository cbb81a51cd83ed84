//! okra CLI: operator interface to a work-item collection.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use okra_rs::config::Config;
use okra_rs::config::secrets::ExposeSecret;
use okra_rs::db::Db;
use okra_rs::model::{ItemId, NewWorkItem, Status, WorkItem};
use okra_rs::scheduler::Scheduler;
use okra_rs::telemetry::{TelemetryConfig, init_telemetry};
use okra_rs::worker::{Worker, WorkerConfig};

#[derive(Parser)]
#[command(name = "okra", about = "Lease-based work-item scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Schedule a new work item
    Schedule {
        /// Seconds from now until the item becomes eligible (may be negative)
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        delay_secs: i64,
        /// JSON payload carried with the item
        #[arg(long)]
        payload: Option<String>,
    },
    /// Claim one eligible item and print it, leaving it leased
    Peek,
    /// Claim one eligible item, acknowledge it, and print it
    Poll,
    /// Delete a work item by id
    Delete {
        /// Work item ID (full UUID)
        id: String,
    },
    /// Show item counts for the collection
    Stats,
    /// Run a worker that logs and acknowledges every item
    Worker {
        /// Maximum items processed at once
        #[arg(long, default_value_t = 4)]
        max_concurrent: usize,
        /// Seconds between lease renewals
        #[arg(long, default_value_t = 60)]
        heartbeat_secs: u64,
        /// Milliseconds to wait after finding the queue empty
        #[arg(long, default_value_t = 1000)]
        poll_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;

    match cli.command {
        Command::Worker {
            max_concurrent,
            heartbeat_secs,
            poll_ms,
        } => {
            let worker_config = WorkerConfig {
                poll_interval: Duration::from_millis(poll_ms),
                heartbeat_interval: Duration::from_secs(heartbeat_secs),
                max_concurrent,
            };
            cmd_worker(&config, db, worker_config).await
        }
        Command::Schedule {
            delay_secs,
            payload,
        } => cmd_schedule(&Scheduler::new(db, config.scheduler())?, delay_secs, payload).await,
        Command::Peek => print_claim(Scheduler::new(db, config.scheduler())?.peek().await?),
        Command::Poll => print_claim(Scheduler::new(db, config.scheduler())?.poll().await?),
        Command::Delete { id } => cmd_delete(&Scheduler::new(db, config.scheduler())?, id).await,
        Command::Stats => cmd_stats(&Scheduler::new(db, config.scheduler())?).await,
    }
}

async fn cmd_worker(config: &Config, db: Db, worker_config: WorkerConfig) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "okra".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let scheduler = Arc::new(Scheduler::new(db, config.scheduler())?);
    let worker = Worker::new(scheduler, worker_config)?;

    let stopper = worker.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        stopper.shutdown();
    });

    worker
        .run(|item: WorkItem| async move {
            tracing::info!(item_id = %item.id, payload = %item.payload, "processing item");
            Ok(())
        })
        .await?;
    Ok(())
}

async fn cmd_schedule(
    scheduler: &Scheduler<Db>,
    delay_secs: i64,
    payload: Option<String>,
) -> anyhow::Result<()> {
    let payload: serde_json::Value = match payload {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::Value::Null,
    };
    let item = NewWorkItem::delayed(chrono::Utc::now(), delay_secs)?.payload(payload);
    let run_date = item.run_date();

    let id = scheduler.schedule(item).await?;
    println!("Scheduled: {id} (runs at {})", run_date.format("%Y-%m-%d %H:%M:%S"));
    Ok(())
}

async fn cmd_delete(scheduler: &Scheduler<Db>, id: String) -> anyhow::Result<()> {
    let id: ItemId = id
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid item id {id:?}: {e}"))?;
    match scheduler.delete_by_id(id).await? {
        0 => println!("No item {id}"),
        _ => println!("Deleted: {id}"),
    }
    Ok(())
}

async fn cmd_stats(scheduler: &Scheduler<Db>) -> anyhow::Result<()> {
    let pending = scheduler.count_by_status(Status::Pending).await?;
    let processing = scheduler.count_by_status(Status::Processing).await?;
    let delayed = scheduler.count_delayed().await?;

    println!("Collection: {}", scheduler.collection());
    println!("Pending:    {pending}");
    println!("Processing: {processing}");
    println!("Delayed:    {delayed}");
    Ok(())
}

fn print_claim(item: Option<WorkItem>) -> anyhow::Result<()> {
    let Some(item) = item else {
        println!("Nothing to claim.");
        return Ok(());
    };

    println!("ID:         {}", item.id);
    println!("Status:     {}", item.status);
    println!("Run Date:   {}", item.run_date);
    if let Some(heartbeat) = item.heartbeat {
        println!("Heartbeat:  {heartbeat}");
    }
    println!(
        "Payload:    {}",
        serde_json::to_string_pretty(&item.payload)?
    );
    Ok(())
}
