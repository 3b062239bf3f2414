use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{oneshot, Mutex};
use tokio_serial::SerialStream;

use ferry::config::{ConfigManager, DeviceConfig};
use ferry::orchestrator::Orchestrator;
use ferry::talker::Talker;
use ferry::websocket::WebSocketServer;

fn open_device(name: &str, config: &DeviceConfig) -> Result<Talker<SerialStream>> {
    Talker::open_serial(name, config).with_context(|| format!("Failed to connect to {}", name))
}

/// Connect to all three microcontrollers
fn initialize_orchestrator(config_manager: &ConfigManager) -> Result<Orchestrator<SerialStream>> {
    let devices = config_manager.get_devices_config();
    let workflow = config_manager.get_workflow_config();

    tracing::info!("Workflow configuration:");
    tracing::info!("  Default slot: {}", workflow.default_slot);
    tracing::info!("  Extrude amount: {}", workflow.extrude_amount);
    tracing::info!("  Deliver length: {} mm", workflow.deliver_length_mm);
    tracing::info!("  Intake poll timeout: {} s", workflow.intake_poll_timeout_secs);

    let gantry = open_device("gantry", &devices.gantry)?;
    let storage = open_device("storage", &devices.storage)?;
    let printer_spool = open_device("printer_spool", &devices.printer_spool)?;

    let orchestrator = Orchestrator::new(gantry, storage, printer_spool, workflow)?;
    tracing::info!("Connected to all devices");

    Ok(orchestrator)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ferry=info".into()),
        )
        .init();

    tracing::info!("Starting ferry filament handler v{}", env!("CARGO_PKG_VERSION"));

    let config_manager = ConfigManager::new().await?;
    let ws_config = config_manager.get_websocket_config();

    // Command-line arguments override config values
    let args: Vec<String> = std::env::args().collect();
    let host = args
        .iter()
        .position(|arg| arg == "--host")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.to_string())
        .unwrap_or(ws_config.host);

    let port = args
        .iter()
        .position(|arg| arg == "--port")
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(ws_config.port);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;

    let orchestrator = Arc::new(Mutex::new(initialize_orchestrator(&config_manager)?));
    let server = Arc::new(WebSocketServer::new(addr, orchestrator.clone()));

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server_handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };
        if let Err(e) = server.start(shutdown).await {
            tracing::error!("WebSocket server error: {}", e);
        }
    });

    match signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received shutdown signal");
        }
        Err(err) => {
            tracing::error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    tracing::info!("Shutting down...");
    let _ = shutdown_tx.send(());
    if let Err(e) = server_handle.await {
        tracing::error!("WebSocket server task failed: {}", e);
    }

    match Arc::try_unwrap(orchestrator) {
        Ok(orchestrator) => orchestrator.into_inner().close().await,
        Err(_) => tracing::warn!("Devices still in use, leaving links to close on exit"),
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
