//! GANTRY gateway daemon

#![warn(missing_docs)]
#![warn(clippy::all)]

use anyhow::{Context, Result};
use clap::Parser;
use gantry_server::config::LogSection;
use gantry_server::{Backends, Daemon, GatewayConfig, LogFormat};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "gantryd")]
#[command(about = "GANTRY task gateway", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address, overrides the configuration file
    #[arg(short, long)]
    bind: Option<String>,

    /// Log format, overrides the configuration file
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

fn init_logging(log: &LogSection) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log.filter))
        .context("invalid log filter")?;
    let registry = tracing_subscriber::registry().with(filter);
    match log.format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    }
    .context("failed to install log subscriber")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for ctrl-c");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => GatewayConfig::load(path)?,
        None => GatewayConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(format) = args.log_format {
        config.log.format = format;
    }

    init_logging(&config.log)?;

    let daemon = Daemon::start(&config, &Backends::default()).await?;
    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    tracing::info!(bind = %config.bind, "Listening");

    axum::serve(listener, gantry_server::router(daemon.gateway.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    daemon.supervisor.shutdown().await;
    tracing::info!("Gateway stopped");
    Ok(())
}
