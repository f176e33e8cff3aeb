//! SuperDuperFeeder server entry point.
//!
//! Loads configuration (TOML file, environment, CLI flags), connects the
//! store, and runs the HTTP adapter, worker pool and scheduler until a
//! shutdown signal arrives. Exits 0 on a clean shutdown, 1 on an
//! unrecoverable startup error.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use feeder_core::config::AppConfig;
use feeder_server::{build_router, AppState};

/// SuperDuperFeeder - a WebSub hub with fallback polling
#[derive(Parser, Debug)]
#[command(name = "superduperfeeder")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Port to listen on (overrides config and environment)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to
    #[arg(long)]
    host: Option<String>,

    /// Path to the configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Environment variable names
mod env_vars {
    pub const CONFIG_PATH: &str = "FEEDER_CONFIG";
    pub const DATABASE_URL: &str = "DATABASE_URL";
    pub const HOST: &str = "FEEDER_HOST";
    pub const PORT: &str = "FEEDER_PORT";
    pub const BASE_URL: &str = "FEEDER_BASE_URL";
}

fn init_tracing(default_filter: &str) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config
        .clone()
        .or_else(|| env::var(env_vars::CONFIG_PATH).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("./config/feeder.toml"))
}

/// Load configuration: defaults, then file, then environment, then CLI.
fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    let path = config_path(cli);
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str::<AppConfig>(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?
    } else {
        AppConfig::default()
    };

    if let Ok(url) = env::var(env_vars::DATABASE_URL) {
        config.database.url = url;
    }
    if let Ok(host) = env::var(env_vars::HOST) {
        config.server.host = host;
    }
    if let Ok(port) = env::var(env_vars::PORT) {
        config.server.port = port
            .parse()
            .with_context(|| format!("{} is not a port number: {port}", env_vars::PORT))?;
    }
    if let Ok(base_url) = env::var(env_vars::BASE_URL) {
        config.server.base_url = base_url;
    }

    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(host) = &cli.host {
        config.server.host = host.clone();
    }

    Ok(config)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => warn!(error = %err, "Failed to listen for SIGTERM"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    info!(
        host = %config.server.host,
        port = config.server.port,
        base_url = %config.server.base_url,
        backend = ?config.database.backend,
        "Configuration loaded"
    );

    let state = AppState::connect(config.clone())
        .await
        .context("Failed to initialize storage")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background = feeder_server::worker::spawn_workers(state.clone(), shutdown_rx.clone());
    background.push(feeder_server::scheduler::spawn_scheduler(
        state.clone(),
        shutdown_rx,
    ));
    info!(workers = config.queue.workers, "Worker pool started");

    let addr: SocketAddr = config
        .server
        .address()
        .parse()
        .with_context(|| format!("Invalid bind address {}", config.server.address()))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("=================================================");
    info!("SuperDuperFeeder listening on http://{addr}");
    info!("Hub endpoint:  POST http://{addr}/");
    info!("Webhook API:   POST http://{addr}/api/webhook");
    info!("Health check:  GET  http://{addr}/health");
    info!("=================================================");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Drain in-flight queue handlers before giving up on them
    let _ = shutdown_tx.send(true);
    let drain = futures::future::join_all(background);
    match tokio::time::timeout(config.server.shutdown_timeout(), drain).await {
        Ok(_) => info!("Background tasks drained"),
        Err(_) => warn!(
            timeout_secs = config.server.shutdown_timeout_secs,
            "Background tasks did not drain in time, abandoning"
        ),
    }

    info!("Server shutdown complete");
    Ok(())
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("superduperfeeder: {err:#}");
            return std::process::ExitCode::FAILURE;
        }
    };
    init_tracing(&config.logging.filter);

    match run(config).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "Fatal error");
            std::process::ExitCode::FAILURE
        }
    }
}
