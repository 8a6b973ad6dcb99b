//! Fan-out router: upstream frames → subscribed WebSocket clients.
//!
//! One task consumes `(channel, raw frame)` pairs from the upstream handler
//! and dispatches each frame to every client interested in that channel.
//! A single consuming task keeps per-channel delivery order equal to
//! upstream arrival order; per-client buffers keep a slow client from
//! stalling anyone else.

use crate::client::ClientRegistry;
use axum::extract::ws::Message;
use metrics::counter;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// One upstream subscription frame, resolved to its channel. The payload is
/// the verbatim upstream JSON; the router never re-shapes market data.
#[derive(Debug, Clone)]
pub struct RoutedFrame {
    pub channel: String,
    pub payload: String,
}

/// Routes upstream market-data frames to subscribed clients.
pub struct MarketRouter {
    registry: Arc<ClientRegistry>,
    frame_rx: mpsc::UnboundedReceiver<RoutedFrame>,
}

impl MarketRouter {
    pub fn new(registry: Arc<ClientRegistry>, frame_rx: mpsc::UnboundedReceiver<RoutedFrame>) -> Self {
        Self { registry, frame_rx }
    }

    /// Run until the upstream side drops its sender.
    pub async fn run(mut self) {
        info!("MarketRouter running");
        while let Some(frame) = self.frame_rx.recv().await {
            self.dispatch(frame);
        }
        info!("MarketRouter stopped");
    }

    /// Deliver one frame to every client interested in its channel.
    fn dispatch(&self, frame: RoutedFrame) {
        // Snapshot the consumer set; deliveries happen outside any registry
        // lock so dispatch never serializes against interest updates.
        let clients = self.registry.subscribers(&frame.channel);
        if clients.is_empty() {
            debug!("No clients subscribed to {}", frame.channel);
            return;
        }

        for client in clients {
            if client.try_send_raw(Message::Text(frame.payload.clone())) {
                counter!("gateway_frames_routed_total").increment(1);
            } else {
                // Buffer full or writer gone: drop for this client only.
                debug!("Dropping frame on {} for client {}", frame.channel, client.id);
                counter!("gateway_frames_dropped_total").increment(1);
            }
        }
    }
}
