//! kilnd - batch inference service daemon
//!
//! `kilnd serve` runs the HTTP API, `kilnd work` runs the GPU worker and
//! sweeper, `kilnd all` runs everything in one process.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use kiln_core::{BlobStore, Config, Database, Metrics};
use kiln_server::{api, AppState};
use kiln_worker::{default_handlers, HandlerPipeline, HttpEngine, ModelRegistry, Sweeper, Worker};

#[derive(Parser)]
#[command(name = "kilnd")]
#[command(author, version, about = "Self-hosted OpenAI-compatible batch inference service", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Data directory (or set KILN_DATA_DIR)
    #[arg(long, global = true, env = "KILN_DATA_DIR")]
    data_dir: Option<String>,

    /// API bind address (or set KILN_BIND_ADDR)
    #[arg(long, global = true, env = "KILN_BIND_ADDR")]
    bind: Option<String>,

    /// Engine daemon base URL (or set KILN_ENGINE_URL)
    #[arg(long, global = true, env = "KILN_ENGINE_URL")]
    engine_url: Option<String>,

    /// Worker identity (or set KILN_WORKER_ID)
    #[arg(long, global = true, env = "KILN_WORKER_ID")]
    worker_id: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    Serve,
    /// Run the GPU worker and the expiry sweeper
    Work,
    /// Run API, worker and sweeper in one process
    All,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();

    let cli = Cli::parse();

    let mut cfg = Config::from_env().context("loading configuration")?;
    if let Some(dir) = cli.data_dir {
        cfg.data_dir = dir.into();
    }
    if let Some(bind) = cli.bind {
        cfg.bind_addr = bind;
    }
    if let Some(url) = cli.engine_url {
        cfg.engine_url = url;
    }
    if let Some(id) = cli.worker_id {
        cfg.worker_id = id;
    }

    let db = Database::open(cfg.db_path()).await.context("opening job store")?;
    let blobs = BlobStore::open(cfg.blob_dir()).context("opening blob store")?;
    let metrics = Metrics::new().context("building metrics registry")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx);

    match cli.command {
        Commands::Serve => {
            run_api(cfg, db, blobs, metrics, shutdown_rx).await?;
        }
        Commands::Work => {
            run_worker(cfg, db, blobs, metrics, shutdown_rx).await;
        }
        Commands::All => {
            let api_cfg = cfg.clone();
            let api_db = db.clone();
            let api_blobs = blobs.clone();
            let api_metrics = metrics.clone();
            let api_shutdown = shutdown_rx.clone();
            let api = tokio::spawn(async move {
                run_api(api_cfg, api_db, api_blobs, api_metrics, api_shutdown).await
            });

            run_worker(cfg, db, blobs, metrics, shutdown_rx).await;
            api.await.context("api task")??;
        }
    }

    Ok(())
}

async fn run_api(
    cfg: Config,
    db: Database,
    blobs: BlobStore,
    metrics: Metrics,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let bind = cfg.bind_addr.clone();
    let state = AppState::new(db, blobs, cfg, metrics);
    let app = api::router(state).into_make_service_with_connect_info::<SocketAddr>();

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {}", bind))?;
    tracing::info!(addr = %bind, "API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("serving API")?;
    Ok(())
}

async fn run_worker(
    cfg: Config,
    db: Database,
    blobs: BlobStore,
    metrics: Metrics,
    shutdown: watch::Receiver<bool>,
) {
    let engine = Arc::new(HttpEngine::new(cfg.engine_url.clone()));
    let pipeline = HandlerPipeline::new(default_handlers(&cfg), &cfg, metrics.clone());
    let worker = Worker::new(
        db.clone(),
        blobs.clone(),
        engine,
        ModelRegistry::new(),
        cfg,
        metrics.clone(),
        pipeline,
    );

    let sweeper = Sweeper::new(db, blobs, metrics);
    let sweeper_shutdown = shutdown.clone();
    let sweeper_task = tokio::spawn(async move { sweeper.run(sweeper_shutdown).await });

    worker.run(shutdown).await;
    sweeper_task.await.ok();
}

fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });
}
