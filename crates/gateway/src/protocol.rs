//! Wire protocol types.
//!
//! Downstream (gateway ↔ consumer) messages are JSON keyed on `op` for
//! requests and `type` for responses. Market data itself is never re-shaped:
//! upstream subscription frames are passed through to consumers verbatim.

use serde::{Deserialize, Serialize};

// ============================================================================
// Consumer → Gateway
// ============================================================================

/// Request sent by a downstream consumer.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Subscribe to market-data channels.
    Subscribe { channels: Vec<String> },
    /// Unsubscribe from market-data channels.
    Unsubscribe { channels: Vec<String> },
}

// ============================================================================
// Gateway → Consumer
// ============================================================================

/// Control response sent by the gateway. Market-data frames bypass this enum
/// entirely (verbatim passthrough of the upstream JSON-RPC notification).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Channels accepted in a subscribe request.
    Subscribed { channels: Vec<String> },
    /// Channels accepted in an unsubscribe request.
    Unsubscribed { channels: Vec<String> },
    /// Channels refused by the allowlist. The rest of the batch still
    /// proceeds; rejection is per channel, never fatal to the session.
    Rejected { channels: Vec<String>, reason: String },
    /// Request could not be processed at all (e.g. unparseable JSON).
    Error { message: String },
}

// ============================================================================
// Upstream (Deribit JSON-RPC)
// ============================================================================

/// Minimal view of an inbound upstream frame, just enough to route it.
/// Everything else in the frame is opaque to the gateway.
#[derive(Debug, Deserialize)]
pub struct UpstreamFrame {
    pub method: Option<String>,
    pub params: Option<UpstreamParams>,
}

#[derive(Debug, Deserialize)]
pub struct UpstreamParams {
    pub channel: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}
