//! Channel-name validation against the public allowlist.
//!
//! The gateway never parses instrument, expiry, or interval out of a channel
//! name; a channel is an opaque key. Validation only gates which upstream
//! streams a consumer may reach.

/// Prefixes of Deribit public channels the gateway will relay.
pub const ALLOWED_PREFIXES: &[&str] = &[
    "ticker.",
    "book.",
    "trades.",
    "chart.trades.",
    "deribit_price_index.",
];

/// Check whether a channel name may be subscribed through the gateway.
/// Names must be non-empty, use the venue's channel charset, and start with
/// an allowlisted prefix.
pub fn is_allowed(channel: &str) -> bool {
    if channel.is_empty() {
        return false;
    }
    if !channel
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
    {
        return false;
    }
    ALLOWED_PREFIXES.iter().any(|p| channel.starts_with(p))
}

/// Split a batch of requested channels into (accepted, rejected).
/// Rejection is per channel; one bad name never poisons the batch.
pub fn partition(channels: Vec<String>) -> (Vec<String>, Vec<String>) {
    channels.into_iter().partition(|c| is_allowed(c))
}
