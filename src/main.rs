use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bulwark::config::BulwarkConfig;
use bulwark::http::HttpServer;
use bulwark::Bulwark;

#[derive(Debug, Parser)]
#[command(name = "bulwark", version, about = "Request throttling and resilient caching layer")]
struct Args {
    /// Path to a configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Bulwark");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = BulwarkConfig::load(args.config.as_deref())?;
    info!(
        http_addr = %config.server.http_addr,
        backend_configured = config.backend.is_configured(),
        "Configuration loaded"
    );

    let bulwark = Arc::new(Bulwark::connect(&config).await?);

    let server = HttpServer::new(config.server.http_addr, Arc::clone(&bulwark));
    server.serve_with_shutdown(shutdown_signal()).await?;

    if let Ok(bulwark) = Arc::try_unwrap(bulwark) {
        bulwark.shutdown().await;
    }

    info!("Bulwark stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
