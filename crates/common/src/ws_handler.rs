//! WebSocket handler trait implemented by venue adapters.

use crate::error::Result;
use crate::messages::ControlCommand;
use async_trait::async_trait;

/// Trait a venue adapter implements to drive one upstream connection.
/// The [`crate::WsManager`] owns the socket and calls these methods as
/// events occur; the adapter never touches the socket directly.
#[async_trait]
pub trait WsHandler: Send + Sync + 'static {
    /// WebSocket URL to connect to.
    fn url(&self) -> &str;

    /// Frames to send immediately after the connection opens, in order.
    /// This is where a venue handshake and subscription reconciliation
    /// happen; returning an empty vec sends nothing.
    fn on_connect_messages(&self) -> Vec<String>;

    /// Called for each text frame received from the venue.
    /// May return a reply frame to send back (e.g. a heartbeat response).
    async fn on_message(&self, msg: &str) -> Result<Option<String>>;

    /// Called when the connection is lost, before the reconnect delay.
    async fn on_disconnect(&self) {}

    /// Translate a control command into a venue frame to send, or `None`
    /// if the command requires no traffic.
    async fn handle_command(&self, cmd: ControlCommand) -> Option<String>;
}
