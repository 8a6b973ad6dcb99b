//! Deribit upstream handler.
//!
//! Implements [`common::WsHandler`] for the venue connection: JSON-RPC
//! subscribe/unsubscribe frames, the heartbeat exchange, and resolving
//! inbound subscription frames to a channel for the router. On every
//! (re)connect it re-asserts the registry's full desired channel set, so the
//! upstream view converges no matter how many reconnects happened meanwhile.

use crate::client::ClientRegistry;
use crate::router::RoutedFrame;
use async_trait::async_trait;
use common::error::Result;
use common::{ControlCommand, WsHandler};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::UpstreamFrame;

/// Deribit public market-data endpoint.
pub const DEFAULT_WS_URL: &str = "wss://streams.deribit.com/ws/api/v2";

/// Heartbeat interval requested from the venue, in seconds.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

pub struct DeribitHandler {
    url: String,
    registry: Arc<ClientRegistry>,
    frame_tx: mpsc::UnboundedSender<RoutedFrame>,
    req_id: AtomicU64,
}

impl DeribitHandler {
    pub fn new(
        url: String,
        registry: Arc<ClientRegistry>,
        frame_tx: mpsc::UnboundedSender<RoutedFrame>,
    ) -> Self {
        Self {
            url,
            registry,
            frame_tx,
            req_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.req_id.fetch_add(1, Ordering::Relaxed)
    }

    fn rpc(&self, method: &str, params: serde_json::Value) -> String {
        json!({
            "jsonrpc": "2.0",
            "id": self.next_id(),
            "method": method,
            "params": params,
        })
        .to_string()
    }

    fn subscribe_frame(&self, mut channels: Vec<String>) -> String {
        channels.sort();
        self.rpc("public/subscribe", json!({ "channels": channels }))
    }

    fn unsubscribe_frame(&self, mut channels: Vec<String>) -> String {
        channels.sort();
        self.rpc("public/unsubscribe", json!({ "channels": channels }))
    }
}

#[async_trait]
impl WsHandler for DeribitHandler {
    fn url(&self) -> &str {
        &self.url
    }

    fn on_connect_messages(&self) -> Vec<String> {
        let mut frames = vec![self.rpc(
            "public/set_heartbeat",
            json!({ "interval": HEARTBEAT_INTERVAL_SECS }),
        )];

        // Reconciliation: one subscribe covering everything the registry
        // currently wants, not a replay of commands queued during outage.
        let channels = self.registry.all_channels();
        if !channels.is_empty() {
            frames.push(self.subscribe_frame(channels));
        }
        frames
    }

    async fn on_message(&self, msg: &str) -> Result<Option<String>> {
        let frame: UpstreamFrame = match serde_json::from_str(msg) {
            Ok(f) => f,
            Err(e) => {
                // Malformed or out-of-protocol frames are not an error for
                // the gateway; drop and move on.
                debug!("Unparseable upstream frame ({}): {}", e, msg);
                return Ok(None);
            }
        };

        match frame.method.as_deref() {
            Some("heartbeat") => {
                let kind = frame.params.and_then(|p| p.kind);
                if kind.as_deref() == Some("test_request") {
                    return Ok(Some(self.rpc("public/test", json!({}))));
                }
                Ok(None)
            }
            Some("subscription") => {
                let Some(channel) = frame.params.and_then(|p| p.channel) else {
                    return Ok(None);
                };
                let routed = RoutedFrame {
                    channel,
                    payload: msg.to_string(),
                };
                if self.frame_tx.send(routed).is_err() {
                    warn!("Router task gone, dropping upstream frame");
                }
                Ok(None)
            }
            // RPC responses and anything unrecognized carry no channel.
            _ => Ok(None),
        }
    }

    async fn on_disconnect(&self) {
        warn!("Deribit connection lost, downstream streams pause until reconnect");
    }

    async fn handle_command(&self, cmd: ControlCommand) -> Option<String> {
        match cmd {
            ControlCommand::Subscribe(channels) if !channels.is_empty() => {
                Some(self.subscribe_frame(channels))
            }
            ControlCommand::Unsubscribe(channels) if !channels.is_empty() => {
                Some(self.unsubscribe_frame(channels))
            }
            _ => None,
        }
    }
}
