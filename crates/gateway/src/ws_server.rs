//! Downstream WebSocket server using Axum.
//!
//! One task per consumer connection. Each connection owns a bounded
//! outbound buffer drained by a writer task, so a consumer that stops
//! reading only loses its own frames and never backpressures the upstream
//! link or other consumers.

use crate::client::{ClientState, CLIENT_CHANNEL_BUFFER_SIZE};
use crate::error::Result;
use crate::hub::MarketHub;
use crate::protocol::{ClientMessage, ServerMessage};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// Shared application state.
pub struct AppState {
    pub hub: Arc<MarketHub>,
}

/// Create the HTTP/WebSocket router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws/market", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let registry = state.hub.registry();
    format!(
        r#"{{"status":"ok","clients":{},"channels":{}}}"#,
        registry.client_count(),
        registry.subscription_count()
    )
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Run one consumer session to completion.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (tx, mut rx) = mpsc::channel::<Message>(CLIENT_CHANNEL_BUFFER_SIZE);
    let client = Arc::new(ClientState::new(tx));
    let client_id = state.hub.registry().register(client.clone());

    counter!("gateway_connections_total").increment(1);
    gauge!("gateway_active_connections").set(state.hub.registry().client_count() as f64);
    info!("Client {} connected", client_id);

    // Writer task: drains the bounded buffer into the socket.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut ping_interval = interval(Duration::from_secs(30));
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        if let Err(e) = handle_message(&state, &client, msg) {
                            debug!("Error handling message from {}: {:?}", client_id, e);
                            let _ = client.send(&ServerMessage::Error {
                                message: e.to_string(),
                            });
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {:?}", client_id, e);
                        break;
                    }
                    None => break,
                }
            }

            _ = ping_interval.tick() => {
                if client.tx.try_send(Message::Ping(Vec::new())).is_err() {
                    break;
                }
            }
        }
    }

    // Every exit path lands here: interest entries are released and channels
    // left without consumers are retracted upstream.
    state.hub.disconnect(&client_id);
    send_task.abort();

    counter!("gateway_disconnections_total").increment(1);
    gauge!("gateway_active_connections").set(state.hub.registry().client_count() as f64);
    info!("Client {} disconnected", client_id);
}

/// Handle one inbound WebSocket message.
fn handle_message(state: &Arc<AppState>, client: &Arc<ClientState>, msg: Message) -> Result<()> {
    match msg {
        Message::Text(text) => {
            let client_msg: ClientMessage = serde_json::from_str(&text)?;
            handle_client_message(state, client, client_msg)
        }
        Message::Binary(data) => {
            let client_msg: ClientMessage = serde_json::from_slice(&data)?;
            handle_client_message(state, client, client_msg)
        }
        Message::Ping(_) | Message::Pong(_) => Ok(()),
        // Close is observed by the connection loop.
        Message::Close(_) => Ok(()),
    }
}

/// Apply a parsed consumer request through the hub and acknowledge it.
fn handle_client_message(
    state: &Arc<AppState>,
    client: &Arc<ClientState>,
    msg: ClientMessage,
) -> Result<()> {
    match msg {
        ClientMessage::Subscribe { channels } => {
            debug!("Client {} subscribing to {:?}", client.id, channels);
            let outcome = state.hub.subscribe(&client.id, channels)?;

            if !outcome.rejected.is_empty() {
                let _ = client.send(&ServerMessage::Rejected {
                    channels: outcome.rejected,
                    reason: "channel not allowed".to_string(),
                });
            }
            if !outcome.accepted.is_empty() {
                counter!("gateway_subscriptions_total").increment(outcome.accepted.len() as u64);
                client.send(&ServerMessage::Subscribed {
                    channels: outcome.accepted,
                })?;
            }
            Ok(())
        }
        ClientMessage::Unsubscribe { channels } => {
            debug!("Client {} unsubscribing from {:?}", client.id, channels);
            let outcome = state.hub.unsubscribe(&client.id, channels)?;

            if !outcome.rejected.is_empty() {
                let _ = client.send(&ServerMessage::Rejected {
                    channels: outcome.rejected,
                    reason: "channel not allowed".to_string(),
                });
            }
            client.send(&ServerMessage::Unsubscribed {
                channels: outcome.accepted,
            })?;
            Ok(())
        }
    }
}
