//! WebSocket connection manager: connect, heartbeat watchdog, reconnect,
//! and dynamic subscription updates via control commands.

use crate::error::{Error, Result};
use crate::messages::ControlCommand;
use crate::ws_handler::WsHandler;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, Message},
};
use tracing::{debug, info, warn};

/// Configuration for the WebSocket manager.
#[derive(Debug, Clone)]
pub struct WsManagerConfig {
    /// Delay between reconnection attempts. The delay is flat: the venue is
    /// a single upstream, so bounded reconnection latency wins over backoff
    /// growth, and the link retries for as long as the process lives.
    pub reconnect_delay: Duration,
    /// Staleness window: if no frame arrives within this duration the
    /// connection is treated as dead, same as a transport-level disconnect.
    pub idle_timeout: Duration,
    /// Label for logs and metrics (e.g. "deribit").
    pub venue_label: String,
}

impl Default for WsManagerConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(60),
            venue_label: "unknown".to_string(),
        }
    }
}

/// Owns one logical upstream connection. Reconnects forever on failure;
/// the handler re-asserts desired subscription state on every connect.
pub struct WsManager<H: WsHandler> {
    handler: Arc<H>,
    config: WsManagerConfig,
    command_rx: mpsc::Receiver<ControlCommand>,
}

impl<H: WsHandler> WsManager<H> {
    pub fn new(handler: H, config: WsManagerConfig, command_rx: mpsc::Receiver<ControlCommand>) -> Self {
        Self {
            handler: Arc::new(handler),
            config,
            command_rx,
        }
    }

    /// Run the connection loop until shutdown. Never returns an error to the
    /// caller for transport failures; those are absorbed by reconnecting.
    pub async fn run(mut self) -> Result<()> {
        let mut shutdown = false;

        while !shutdown {
            match self.connect_and_run_loop(&mut shutdown).await {
                Ok(()) => {
                    info!("[{}] WebSocket closed gracefully", self.config.venue_label);
                    break;
                }
                Err(e) => {
                    counter!("gateway_upstream_disconnects_total", "venue" => self.config.venue_label.clone())
                        .increment(1);
                    warn!(
                        "[{}] WebSocket disconnected: {:?}, reconnecting in {:?}",
                        self.config.venue_label, e, self.config.reconnect_delay
                    );
                    self.handler.on_disconnect().await;

                    // While down there is nothing to retract or assert
                    // upstream; queued commands are dropped and the desired
                    // set re-asserted at the next connect. Shutdown is the
                    // one command honored immediately.
                    while let Ok(cmd) = self.command_rx.try_recv() {
                        if matches!(cmd, ControlCommand::Shutdown) {
                            shutdown = true;
                        }
                    }
                    if shutdown {
                        break;
                    }

                    tokio::time::sleep(self.config.reconnect_delay).await;
                }
            }
        }

        gauge!("gateway_upstream_connected", "venue" => self.config.venue_label.clone()).set(0.0);
        Ok(())
    }

    async fn connect_and_run_loop(&mut self, shutdown: &mut bool) -> Result<()> {
        let url = self.handler.url();
        info!("[{}] Connecting to {}", self.config.venue_label, url);

        let (ws_stream, response) = connect_async(url).await?;
        debug!(
            "[{}] WebSocket handshake complete, status: {:?}",
            self.config.venue_label,
            response.status()
        );
        let (mut write, mut read) = ws_stream.split();

        gauge!("gateway_upstream_connected", "venue" => self.config.venue_label.clone()).set(1.0);
        counter!("gateway_upstream_connects_total", "venue" => self.config.venue_label.clone())
            .increment(1);

        // Discard commands queued while we were down: the handler rebuilds
        // the full desired channel set in its on-connect frames, so stale
        // commands are never replayed. Draining happens BEFORE that snapshot
        // is taken, so a command racing the reconnect is either covered by
        // the snapshot or processed by the loop below, never lost.
        loop {
            match self.command_rx.try_recv() {
                Ok(ControlCommand::Shutdown) => {
                    *shutdown = true;
                    return self.close(&mut write).await;
                }
                Ok(cmd) => debug!(
                    "[{}] Dropping command queued during outage: {:?}",
                    self.config.venue_label, cmd
                ),
                Err(_) => break,
            }
        }

        // Handshake and reconciliation frames.
        for frame in self.handler.on_connect_messages() {
            debug!("[{}] Sending on-connect frame: {}", self.config.venue_label, frame);
            write.send(Message::Text(frame)).await?;
        }

        let mut last_rx = Instant::now();
        let mut idle_check = interval(self.config.idle_timeout);
        idle_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        idle_check.reset();

        loop {
            tokio::select! {
                msg = read.next() => {
                    last_rx = Instant::now();
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            counter!("gateway_upstream_messages_total", "venue" => self.config.venue_label.clone())
                                .increment(1);
                            if let Some(reply) = self.handler.on_message(&text).await? {
                                write.send(Message::Text(reply)).await?;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            debug!("[{}] Received pong", self.config.venue_label);
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!("[{}] Received close frame: {:?}", self.config.venue_label, frame);
                            return Err(Error::ConnectionClosed);
                        }
                        Some(Ok(_)) => {
                            // Binary and raw frames carry nothing we route.
                        }
                        Some(Err(e)) => {
                            return Err(Error::WebSocket(e));
                        }
                        None => {
                            return Err(Error::ConnectionClosed);
                        }
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(ControlCommand::Shutdown) => {
                            *shutdown = true;
                            return self.close(&mut write).await;
                        }
                        Some(cmd) => {
                            if let Some(frame) = self.handler.handle_command(cmd).await {
                                debug!("[{}] Sending subscription update: {}", self.config.venue_label, frame);
                                write.send(Message::Text(frame)).await?;
                            }
                        }
                        None => {
                            // Command channel closed, treat as shutdown.
                            *shutdown = true;
                            return Ok(());
                        }
                    }
                }

                _ = idle_check.tick() => {
                    if last_rx.elapsed() >= self.config.idle_timeout {
                        warn!(
                            "[{}] No frame received for {:?}, dropping connection",
                            self.config.venue_label, self.config.idle_timeout
                        );
                        return Err(Error::HeartbeatTimeout);
                    }
                }
            }
        }
    }

    async fn close<S>(&self, write: &mut S) -> Result<()>
    where
        S: SinkExt<Message> + Unpin,
    {
        info!("[{}] Shutting down upstream connection", self.config.venue_label);
        let close_frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "shutdown".into(),
        };
        let _ = write.send(Message::Close(Some(close_frame))).await;
        Ok(())
    }
}
