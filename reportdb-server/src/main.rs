//! ReportDB Server - HTTP ingestion and query transport

mod api;

use anyhow::Context;
use clap::Parser;
use reportdb_core::{LogFormat, ReportConfig, ReportDb};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// ReportDB server
#[derive(Parser, Debug)]
#[command(name = "reportdb")]
#[command(about = "Counter storage and reporting server", long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Override the listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Override the data directory
    #[arg(short, long)]
    base_dir: Option<PathBuf>,
}

fn init_logging(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = ReportConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(base_dir) = args.base_dir {
        config.base_dir = base_dir;
    }

    init_logging(&config.log_level, config.log_format);

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address {}", config.listen_addr))?;

    info!("Starting ReportDB server...");
    info!("Data directory: {:?}", config.base_dir);

    let db = Arc::new(ReportDb::start(config)?);
    let app = api::create_router(db.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("ReportDB server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    db.shutdown().await;
    Ok(())
}
