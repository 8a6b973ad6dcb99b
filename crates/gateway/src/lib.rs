//! Market-data fan-out gateway.
//!
//! Maintains exactly one upstream WebSocket connection to Deribit and
//! multiplexes any number of downstream subscribers over independent
//! channel subscriptions, re-sharing received frames without redundant
//! upstream requests.
//!
//! ## Architecture
//!
//! ```text
//! Deribit (one connection)
//!         ↓ WsManager + DeribitHandler
//! MarketRouter (mpsc-fed fan-out task)
//!         ↓ ClientRegistry lookup
//! WebSocket consumers (bounded buffer each)
//! ```
//!
//! The registry is the single source of truth for the desired upstream
//! channel set; the upstream link re-asserts that set on every reconnect,
//! so subscription state converges regardless of outages.

pub mod channel;
pub mod client;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod router;
pub mod upstream;
pub mod ws_server;

pub use client::{ClientId, ClientRegistry, ClientState};
pub use error::{GatewayError, Result};
pub use hub::{MarketHub, RequestOutcome};
pub use protocol::{ClientMessage, ServerMessage};
pub use router::{MarketRouter, RoutedFrame};
pub use upstream::DeribitHandler;
pub use ws_server::{create_router, AppState};
