use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use backbone_core::JobId;
use backbone_edge::{EdgeOperation, HttpPrimary, LocalBuffer, PosOperation, PrimaryEndpoint, SyncWorker, TelemetrySample};
use backbone_jobs::PgBackend;
use backbone_worker::{Collaborators, Worker, WorkerConfig, inspect};

#[derive(Parser)]
#[command(name = "backbone-worker", about = "Runs backbone jobs and operator commands")]
struct Cli {
    /// TOML config file; `BACKBONE_*` environment variables override it.
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatcher until interrupted.
    Run {
        /// Also replay an edge buffer of this family.
        #[arg(long)]
        edge: Option<Family>,
    },
    /// List discarded jobs.
    Discarded {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Requeue a discarded job.
    Requeue { job_id: JobId },
    /// Job counts per state.
    Stats,
    /// Show a saga parent and its steps.
    Saga { job_id: JobId },
    /// Replay an edge buffer once and report.
    EdgeSync { family: Family },
    /// List buffered edge operations that keep failing.
    EdgeStuck { family: Family },
}

#[derive(Clone, Copy, ValueEnum)]
enum Family {
    Pos,
    Telemetry,
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn connect(config: &WorkerConfig) -> anyhow::Result<PgBackend> {
    let backend = PgBackend::connect(&config.database_url, config.max_connections)
        .await
        .context("failed to connect to the database")?;
    backbone_worker::ensure_schema(&backend).await.context("failed to prepare schema")?;
    Ok(backend)
}

async fn open_buffer<T: EdgeOperation>(config: &WorkerConfig) -> anyhow::Result<LocalBuffer<T>> {
    let path = match &config.edge.buffer_path {
        Some(path) => path.clone(),
        None => backbone_edge::default_buffer_path()?,
    };
    LocalBuffer::<T>::open(&path)
        .await
        .with_context(|| format!("failed to open edge buffer at {}", path.display()))
}

async fn sync_worker<T>(config: &WorkerConfig) -> anyhow::Result<SyncWorker<T>>
where
    T: EdgeOperation + PrimaryEndpoint,
{
    let buffer = open_buffer::<T>(config).await?;
    let primary = HttpPrimary::<T>::new(&config.edge.primary_url, config.collaborators.request_timeout())?;
    Ok(SyncWorker::new(buffer, Arc::new(primary), config.edge.sync_config()))
}

async fn edge_sync<T: EdgeOperation + PrimaryEndpoint>(config: &WorkerConfig) -> anyhow::Result<()> {
    let report = sync_worker::<T>(config).await?.drain_all().await?;
    print_json(&report)
}

async fn edge_stuck<T: EdgeOperation>(config: &WorkerConfig) -> anyhow::Result<()> {
    let buffer = open_buffer::<T>(config).await?;
    print_json(&buffer.stuck(config.edge.stuck_after).await?)
}

async fn run(config: WorkerConfig, edge: Option<Family>) -> anyhow::Result<()> {
    let backend = Arc::new(connect(&config).await?);
    let collaborators = Collaborators::http(&config.collaborators).context("failed to build HTTP clients")?;
    let worker = Worker::assemble(backend, &collaborators, config.dispatch.retry.max_attempts)
        .context("failed to register job kinds")?;

    let dispatcher = worker.dispatcher(config.dispatcher_config()).spawn();
    let sync = match edge {
        Some(Family::Pos) => Some(sync_worker::<PosOperation>(&config).await?.spawn()),
        Some(Family::Telemetry) => Some(sync_worker::<TelemetrySample>(&config).await?.spawn()),
        None => None,
    };

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    if let Some(sync) = sync {
        sync.shutdown(Duration::from_millis(config.dispatch.shutdown_grace_ms)).await;
    }
    let stats = dispatcher.shutdown().await;
    tracing::info!(
        processed = stats.jobs_processed,
        succeeded = stats.jobs_succeeded,
        retried = stats.jobs_retried,
        discarded = stats.jobs_discarded,
        "worker stopped"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = WorkerConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    backbone_observability::init_with_format(config.log_format);

    match cli.command {
        Command::Run { edge } => run(config, edge).await,
        Command::Discarded { limit } => {
            let backend = connect(&config).await?;
            print_json(&inspect::discarded(&backend, limit).await?)
        }
        Command::Requeue { job_id } => {
            let backend = connect(&config).await?;
            print_json(&inspect::requeue(&backend, job_id).await?)
        }
        Command::Stats => {
            let backend = connect(&config).await?;
            print_json(&inspect::stats(&backend).await?)
        }
        Command::Saga { job_id } => {
            let backend = connect(&config).await?;
            match inspect::saga(&backend, job_id).await? {
                Some(report) => print_json(&report),
                None => bail!("no job {job_id}"),
            }
        }
        Command::EdgeSync { family: Family::Pos } => edge_sync::<PosOperation>(&config).await,
        Command::EdgeSync { family: Family::Telemetry } => edge_sync::<TelemetrySample>(&config).await,
        Command::EdgeStuck { family: Family::Pos } => edge_stuck::<PosOperation>(&config).await,
        Command::EdgeStuck { family: Family::Telemetry } => edge_stuck::<TelemetrySample>(&config).await,
    }
}
