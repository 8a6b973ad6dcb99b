//! Gateway coordinator: owns the registry and the upstream command channel.
//!
//! Downstream sessions talk only to the hub; the hub decides when a
//! registry change owes upstream traffic (0→1 and 1→0 transitions) and
//! requests it through the upstream link's command channel. The upstream
//! socket itself is single-writer: only the link task ever touches it.

use crate::channel;
use crate::client::{ClientId, ClientRegistry};
use crate::error::Result;
use common::ControlCommand;
use metrics::counter;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Result of applying one subscribe/unsubscribe request: which channels the
/// allowlist let through and which it refused.
#[derive(Debug, Default)]
pub struct RequestOutcome {
    pub accepted: Vec<String>,
    pub rejected: Vec<String>,
}

pub struct MarketHub {
    registry: Arc<ClientRegistry>,
    upstream_tx: mpsc::Sender<ControlCommand>,
}

impl MarketHub {
    pub fn new(registry: Arc<ClientRegistry>, upstream_tx: mpsc::Sender<ControlCommand>) -> Self {
        Self {
            registry,
            upstream_tx,
        }
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Subscribe a client to a batch of channels. Disallowed channels are
    /// refused individually; the valid remainder proceeds. Channels gaining
    /// their first consumer are requested upstream.
    pub fn subscribe(&self, client_id: &ClientId, channels: Vec<String>) -> Result<RequestOutcome> {
        let (accepted, rejected) = channel::partition(channels);
        if !rejected.is_empty() {
            counter!("gateway_channels_rejected_total").increment(rejected.len() as u64);
        }

        if !accepted.is_empty() {
            let newly_first = self.registry.subscribe(client_id, &accepted)?;
            self.request_upstream(ControlCommand::Subscribe(newly_first));
        }

        Ok(RequestOutcome { accepted, rejected })
    }

    /// Unsubscribe a client from a batch of channels. Channels losing their
    /// last consumer are retracted upstream.
    pub fn unsubscribe(&self, client_id: &ClientId, channels: Vec<String>) -> Result<RequestOutcome> {
        let (accepted, rejected) = channel::partition(channels);

        if !accepted.is_empty() {
            let emptied = self.registry.unsubscribe(client_id, &accepted)?;
            self.request_upstream(ControlCommand::Unsubscribe(emptied));
        }

        Ok(RequestOutcome { accepted, rejected })
    }

    /// Tear down a client on any disconnect path. Every interest entry is
    /// removed and channels left without consumers are retracted upstream.
    pub fn disconnect(&self, client_id: &ClientId) {
        let emptied = self.registry.unregister(client_id);
        self.request_upstream(ControlCommand::Unsubscribe(emptied));
    }

    fn request_upstream(&self, cmd: ControlCommand) {
        let relevant = match &cmd {
            ControlCommand::Subscribe(chs) | ControlCommand::Unsubscribe(chs) => !chs.is_empty(),
            ControlCommand::Shutdown => true,
        };
        if !relevant {
            return;
        }
        // Non-blocking: a full queue means the link is down or far behind,
        // and reconciliation at the next connect re-asserts desired state.
        if let Err(e) = self.upstream_tx.try_send(cmd) {
            warn!("Upstream command queue unavailable: {}", e);
        }
    }
}
