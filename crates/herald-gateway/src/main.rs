//! herald: recurring digest jobs plus a small status server.
//!
//! Usage:
//!   herald serve              Run the schedule runner and the HTTP server
//!   herald run [--once]       Run only the schedule runner

use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use herald_core::config::HeraldConfig;
use herald_lifecycle::{ShutdownManager, ShutdownOptions};
use herald_scheduler::{RunnerOptions, ScheduleRunner, ScheduleStore, SqliteScheduleStore};
use tracing::{info, warn};

mod app;
mod http;
mod jobs;
mod worker;

/// herald - recurring digest job runner
#[derive(Parser)]
#[command(name = "herald")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (default: $HERALD_CONFIG, then ~/.herald/herald.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<String>,

    /// SQLite database path
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<String>,

    /// Redis URL; when set, due jobs are queued instead of run locally
    #[arg(long, global = true, value_name = "URL")]
    queue_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the schedule runner and the HTTP status server
    Serve {
        /// Poll interval in seconds
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Run the schedule runner without the HTTP server
    Run {
        /// Run a single cycle, print the dispatched count and exit
        #[arg(long)]
        once: bool,

        /// Poll interval in seconds
        #[arg(long)]
        interval: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "herald=info,herald_scheduler=info,herald_lifecycle=info,tower_http=info".into()
            }),
        )
        .init();

    let cli = Cli::parse();

    let mut config = HeraldConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        HeraldConfig::default()
    });
    if let Some(db) = cli.db {
        config.database.path = db;
    }
    if let Some(url) = cli.queue_url {
        config.runner.queue_url = Some(url);
    }
    let interval = match &cli.command {
        Commands::Serve { interval } | Commands::Run { interval, .. } => *interval,
    };
    if let Some(secs) = interval {
        config.runner.poll_interval_secs = secs;
    }

    let shutdown = Arc::new(ShutdownManager::new(ShutdownOptions::from(&config.shutdown)));
    let _signals = herald_lifecycle::platform_default().install(shutdown.clone())?;

    match cli.command {
        Commands::Serve { .. } => serve(config, shutdown).await,
        Commands::Run { once: true, .. } => run_once(config, shutdown).await,
        Commands::Run { once: false, .. } => run_continuous(config, shutdown).await,
    }
}

fn open_store(config: &HeraldConfig) -> anyhow::Result<Arc<SqliteScheduleStore>> {
    let path = &config.database.path;
    ensure_parent_dir(path);
    info!(path = %path, "opening SQLite database");
    Ok(Arc::new(SqliteScheduleStore::open(path)?))
}

fn build_runner(
    config: &HeraldConfig,
    store: Arc<dyn ScheduleStore>,
    shutdown: &Arc<ShutdownManager>,
) -> anyhow::Result<ScheduleRunner> {
    let executor = jobs::build_executor(&config.runner, shutdown.clone())?;
    Ok(ScheduleRunner::new(store, executor).with_options(RunnerOptions::from(&config.runner)))
}

async fn serve(config: HeraldConfig, shutdown: Arc<ShutdownManager>) -> anyhow::Result<()> {
    let store = open_store(&config)?;
    let runner = build_runner(&config, store.clone(), &shutdown)?;
    let interval = Duration::from_secs(config.runner.poll_interval_secs);
    worker::spawn_runner(runner, interval, &shutdown)?;

    let lifecycle = Arc::new(http::lifecycle::ServerLifecycle::new(
        shutdown.clone(),
        &config.gateway,
    ));
    lifecycle.register()?;

    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    let state = Arc::new(app::AppState::new(
        config,
        shutdown.clone(),
        store,
        lifecycle.clone(),
    ));
    let router = app::build_router(state);

    info!("herald listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(lifecycle.stop_token().cancelled_owned())
        .await;
    lifecycle.mark_stopped();
    if let Err(e) = &served {
        warn!("server stopped with error: {e}");
    }

    finish(shutdown).await;
    served.map_err(Into::into)
}

async fn run_once(config: HeraldConfig, shutdown: Arc<ShutdownManager>) -> anyhow::Result<()> {
    let store = open_store(&config)?;
    let runner = build_runner(&config, store, &shutdown)?;
    let dispatched = tokio::task::spawn_blocking(move || runner.run_once()).await??;
    println!("{dispatched}");
    finish(shutdown).await;
    Ok(())
}

async fn run_continuous(config: HeraldConfig, shutdown: Arc<ShutdownManager>) -> anyhow::Result<()> {
    let store = open_store(&config)?;
    let runner = build_runner(&config, store, &shutdown)?;
    let interval = Duration::from_secs(config.runner.poll_interval_secs);
    worker::spawn_runner(runner, interval, &shutdown)?;
    info!("schedule runner running, press Ctrl+C to stop");

    let waiter = shutdown.clone();
    tokio::task::spawn_blocking(move || waiter.wait_for_completion(None)).await?;
    info!("Goodbye!");
    Ok(())
}

/// Run the shutdown sequence if nobody started it, and wait for it to end.
async fn finish(shutdown: Arc<ShutdownManager>) {
    let limit = shutdown.options().budgets.total() + Duration::from_secs(1);
    let completed = tokio::task::spawn_blocking(move || {
        if !shutdown.is_shutdown_requested() {
            shutdown.shutdown(false);
        }
        shutdown.wait_for_completion(Some(limit))
    })
    .await
    .unwrap_or(false);
    if !completed {
        warn!("shutdown sequence did not complete in time");
    }
}

/// Ensure the parent directory for a file path exists.
fn ensure_parent_dir(path: &str) {
    if let Some(parent) = Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
