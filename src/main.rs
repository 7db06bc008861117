//! camrelay daemon
//!
//! Run with: camrelay [CONFIG_PATH]   (default: config.txt)
//!
//! Starts a relay and a recorder for every configured camera plus the
//! live-view WebSocket server on `VIEWER_PORT` (default 8080). Ctrl-C shuts
//! down the live view first, then every relay and recorder.

use tokio::sync::oneshot;

use camrelay::process::RelaySettings;
use camrelay::{AppConfig, LiveViewHub, LiveViewServer, PipelineService, ServerConfig};

const DEFAULT_CONFIG_PATH: &str = "config.txt";

fn print_usage() {
    eprintln!("Usage: camrelay [CONFIG_PATH]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  CONFIG_PATH  Deployment configuration file (default: {})", DEFAULT_CONFIG_PATH);
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  VIEWER_PORT  Live-view port (default: 8080)");
    eprintln!("  RUST_LOG     Log filter (default: camrelay=info)");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("camrelay=info")),
        )
        .init();

    let config_path = args.get(1).map(String::as_str).unwrap_or(DEFAULT_CONFIG_PATH);
    let config = AppConfig::load(config_path)?;

    let mut relays = PipelineService::relays(&config, &RelaySettings::default())?;
    let mut recorders = PipelineService::recorders(&config);

    let hub = LiveViewHub::new(&config);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server_task = match LiveViewServer::bind(ServerConfig::from_env(), hub).await {
        Ok(server) => Some(tokio::spawn(server.run_until(async {
            let _ = stop_rx.await;
        }))),
        Err(e) => {
            // relays and recordings keep running without live view
            tracing::error!(error = %e, "Live-view server failed to start");
            None
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C, shutting down");
    }
    tracing::info!("Shutting down");

    let _ = stop_tx.send(());
    if let Some(task) = server_task {
        match task.await {
            Ok(Err(e)) => tracing::error!(error = %e, "Live-view server error"),
            Err(e) => tracing::error!(error = %e, "Live-view server task failed"),
            Ok(Ok(())) => {}
        }
    }

    tokio::join!(relays.stop_all(), recorders.stop_all());

    tracing::info!("Shutdown complete");
    Ok(())
}
