//! Control messages for dynamic subscription management.

/// Commands sent to a running [`crate::WsManager`] to update upstream
/// subscriptions at runtime.
///
/// Commands that arrive while the connection is down sit in the command
/// channel; the manager discards them on reconnect because the handler
/// re-asserts the full desired channel set itself (reconciliation), so a
/// stale queued command is never worth replaying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Subscribe to additional channels.
    Subscribe(Vec<String>),
    /// Unsubscribe from channels.
    Unsubscribe(Vec<String>),
    /// Graceful shutdown.
    Shutdown,
}
