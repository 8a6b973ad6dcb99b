//! Gateway service entry point.
//!
//! Wires the upstream link, fan-out router, hub, and downstream WebSocket
//! server together and runs until interrupted.

use anyhow::Result;
use common::{ControlCommand, WsManager, WsManagerConfig};
use gateway::{create_router, AppState, ClientRegistry, DeribitHandler, MarketHub, MarketRouter};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Commands that fit in flight while the upstream link is down. Anything
/// beyond this is dropped; reconciliation at reconnect covers the loss.
const UPSTREAM_COMMAND_BUFFER: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting market-data gateway");

    let deribit_ws_url = env::var("DERIBIT_WS_URL")
        .unwrap_or_else(|_| gateway::upstream::DEFAULT_WS_URL.to_string());
    let http_port: u16 = env::var("HTTP_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .expect("HTTP_PORT must be a number");
    let metrics_port: u16 = env::var("METRICS_PORT")
        .unwrap_or_else(|_| "9090".to_string())
        .parse()
        .expect("METRICS_PORT must be a number");
    let reconnect_delay_secs: u64 = env::var("RECONNECT_DELAY_SECS")
        .unwrap_or_else(|_| "1".to_string())
        .parse()
        .expect("RECONNECT_DELAY_SECS must be a number");

    info!("Configuration:");
    info!("  DERIBIT_WS_URL: {}", deribit_ws_url);
    info!("  HTTP_PORT: {}", http_port);
    info!("  METRICS_PORT: {}", metrics_port);
    info!("  RECONNECT_DELAY_SECS: {}", reconnect_delay_secs);

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], metrics_port))
        .install()
        .expect("Failed to start Prometheus exporter");
    info!("Prometheus metrics server started on port {}", metrics_port);

    let registry = Arc::new(ClientRegistry::new());

    // Upstream frames flow to the router over this channel; it decouples
    // venue I/O timing from fan-out dispatch timing.
    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    let (upstream_tx, upstream_rx) = mpsc::channel::<ControlCommand>(UPSTREAM_COMMAND_BUFFER);

    let handler = DeribitHandler::new(deribit_ws_url, registry.clone(), frame_tx);
    let manager = WsManager::new(
        handler,
        WsManagerConfig {
            reconnect_delay: Duration::from_secs(reconnect_delay_secs),
            idle_timeout: Duration::from_secs(
                2 * gateway::upstream::HEARTBEAT_INTERVAL_SECS,
            ),
            venue_label: "deribit".to_string(),
        },
        upstream_rx,
    );
    let upstream_handle = tokio::spawn(manager.run());

    // The router stops on its own once the upstream side drops its sender.
    let router = MarketRouter::new(registry.clone(), frame_rx);
    tokio::spawn(router.run());

    let hub = Arc::new(MarketHub::new(registry, upstream_tx.clone()));
    let state = Arc::new(AppState { hub });
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down upstream link...");
    let _ = upstream_tx.send(ControlCommand::Shutdown).await;
    let _ = upstream_handle.await;

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
