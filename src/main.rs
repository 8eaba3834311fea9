use anyhow::Result;
use clap::Parser;
use foreman::{config::Config, server::run_server};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser)]
#[command(name = "foreman")]
#[command(about = "Run lifecycle orchestrator for CLI coding agents")]
struct Args {
    /// Configuration file (TOML). Defaults to ./foreman.toml when present
    #[arg(long)]
    config: Option<String>,

    /// Database file path
    #[arg(long)]
    database_path: Option<String>,

    /// Server host
    #[arg(long)]
    host: Option<String>,

    /// Server port
    #[arg(long)]
    port: Option<u16>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Directory for rolling server logs
    #[arg(long, default_value = ".foreman/logs")]
    logs_dir: String,

    /// Skip orphan reconciliation and queued-run resume on startup
    #[arg(long)]
    no_reconcile: bool,

    /// Do not tick autopilot from the scheduler
    #[arg(long)]
    no_autopilot: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing with both console and file logging
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    let logs_dir = std::path::Path::new(&args.logs_dir);
    std::fs::create_dir_all(logs_dir)?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, "server.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter.clone()))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(env_filter),
        )
        .init();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(path) = args.database_path {
        config.database.path = path;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if args.no_reconcile {
        config.scheduler.reconcile = false;
    }
    if args.no_autopilot {
        config.scheduler.autopilot = false;
    }

    info!("Starting Foreman");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Database: {}", config.database.path);
    info!("Server: {}", config.server_address());
    info!(
        "Reconcile: {}, autopilot: {}",
        config.scheduler.reconcile, config.scheduler.autopilot
    );

    run_server(config).await?;

    Ok(())
}
