//! Downstream client state and the subscription registry.
//!
//! The registry is the single source of truth for the desired upstream
//! channel set: a channel has an entry iff at least one client wants it,
//! so `all_channels()` is exactly what must be subscribed upstream.

use crate::error::{GatewayError, Result};
use crate::protocol::ServerMessage;
use axum::extract::ws::Message;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Unique client identifier.
pub type ClientId = Uuid;

/// Outbound buffer per client. A client that falls this far behind starts
/// losing frames rather than slowing anyone else down.
pub const CLIENT_CHANNEL_BUFFER_SIZE: usize = 512;

/// State for one connected downstream client.
pub struct ClientState {
    /// Unique client identifier.
    pub id: ClientId,
    /// Bounded channel feeding the client's WebSocket writer task.
    pub tx: mpsc::Sender<Message>,
    /// Channels this client currently holds interest in.
    pub subscriptions: DashSet<String>,
}

impl ClientState {
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
            subscriptions: DashSet::new(),
        }
    }

    /// Send a control response to this client. Non-blocking; a full buffer
    /// is an error the caller may ignore (the client is lagging).
    pub fn send(&self, msg: &ServerMessage) -> Result<()> {
        let json = serde_json::to_string(msg)?;
        self.tx
            .try_send(Message::Text(json))
            .map_err(|_| GatewayError::ChannelSend)
    }

    /// Try to hand a raw frame to this client's writer. Returns false if the
    /// buffer is full or the connection is gone; the frame is dropped for
    /// this client only.
    pub fn try_send_raw(&self, msg: Message) -> bool {
        self.tx.try_send(msg).is_ok()
    }
}

/// Concurrent registry mapping channels to interested clients.
pub struct ClientRegistry {
    /// Client ID → client state.
    clients: DashMap<ClientId, Arc<ClientState>>,
    /// Channel → interested client IDs. Entries are removed when the set
    /// empties, never left behind.
    channels: DashMap<String, DashSet<ClientId>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            channels: DashMap::new(),
        }
    }

    /// Register a new client.
    pub fn register(&self, client: Arc<ClientState>) -> ClientId {
        let id = client.id;
        self.clients.insert(id, client);
        info!("Client {} registered", id);
        id
    }

    /// Get a client by ID.
    pub fn get(&self, client_id: &ClientId) -> Option<Arc<ClientState>> {
        self.clients.get(client_id).map(|r| r.clone())
    }

    /// Add interest in `channels` for a client. Idempotent per pair.
    /// Returns the channels that gained their FIRST interested client;
    /// the caller owes an upstream subscribe for exactly those.
    pub fn subscribe(&self, client_id: &ClientId, channels: &[String]) -> Result<Vec<String>> {
        // Clone the state out so no clients-shard guard is held while the
        // channel map is locked below; holding both invites a lock cycle
        // with readers that traverse the maps in the other order.
        let client = self
            .clients
            .get(client_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| GatewayError::ClientNotFound(client_id.to_string()))?;

        let mut newly_first = Vec::new();
        for channel in channels {
            client.subscriptions.insert(channel.clone());

            // Entry API keeps the 0→1 transition atomic per channel.
            match self.channels.entry(channel.clone()) {
                Entry::Occupied(entry) => {
                    entry.get().insert(*client_id);
                }
                Entry::Vacant(entry) => {
                    let ids = DashSet::new();
                    ids.insert(*client_id);
                    entry.insert(ids);
                    newly_first.push(channel.clone());
                }
            }
        }

        debug!(
            "Client {} subscribed to {} channels ({} new upstream)",
            client_id,
            channels.len(),
            newly_first.len()
        );
        Ok(newly_first)
    }

    /// Drop interest in `channels` for a client. Idempotent.
    /// Returns the channels whose LAST interested client this was; the
    /// caller owes an upstream unsubscribe for exactly those.
    pub fn unsubscribe(&self, client_id: &ClientId, channels: &[String]) -> Result<Vec<String>> {
        // Same rule as subscribe: no clients guard across the channel map.
        let client = self
            .clients
            .get(client_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| GatewayError::ClientNotFound(client_id.to_string()))?;

        let mut emptied = Vec::new();
        for channel in channels {
            client.subscriptions.remove(channel);
            if self.remove_interest(channel, client_id) {
                emptied.push(channel.clone());
            }
        }

        debug!(
            "Client {} unsubscribed from {} channels ({} gone upstream)",
            client_id,
            channels.len(),
            emptied.len()
        );
        Ok(emptied)
    }

    /// Remove a client and every interest it held. Returns the channels
    /// that lost their last client.
    pub fn unregister(&self, client_id: &ClientId) -> Vec<String> {
        let mut emptied = Vec::new();
        if let Some((_, client)) = self.clients.remove(client_id) {
            for channel in client.subscriptions.iter() {
                if self.remove_interest(channel.key(), client_id) {
                    emptied.push(channel.key().clone());
                }
            }
            info!("Client {} unregistered", client_id);
        }
        emptied
    }

    /// Remove one (channel, client) interest pair; deletes the channel entry
    /// if it empties. Returns true on the 1→0 transition.
    fn remove_interest(&self, channel: &str, client_id: &ClientId) -> bool {
        if let Entry::Occupied(entry) = self.channels.entry(channel.to_string()) {
            entry.get().remove(client_id);
            if entry.get().is_empty() {
                entry.remove();
                return true;
            }
        }
        false
    }

    /// Snapshot of the clients currently interested in a channel.
    /// Empty if the channel is unknown.
    pub fn subscribers(&self, channel: &str) -> Vec<Arc<ClientState>> {
        // Snapshot the IDs first so the channels guard is released before
        // the clients map is touched; resolving under both guards can
        // deadlock against a writer on the interest side.
        let ids: Vec<ClientId> = match self.channels.get(channel) {
            Some(ids) => ids.iter().map(|id| *id).collect(),
            None => return Vec::new(),
        };
        ids.iter()
            .filter_map(|id| self.clients.get(id).map(|c| c.clone()))
            .collect()
    }

    /// The full desired upstream channel set, used for reconciliation after
    /// a reconnect.
    pub fn all_channels(&self) -> Vec<String> {
        self.channels.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Number of channels with at least one interested client.
    pub fn subscription_count(&self) -> usize {
        self.channels.len()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> Arc<ClientState> {
        let (tx, _rx) = mpsc::channel(8);
        Arc::new(ClientState::new(tx))
    }

    const CH: &str = "ticker.BTC-PERPETUAL.100ms";

    #[test]
    fn first_and_last_transitions_fire_once() {
        let registry = ClientRegistry::new();
        let a = client();
        let b = client();
        registry.register(a.clone());
        registry.register(b.clone());

        let first = registry.subscribe(&a.id, &[CH.to_string()]).unwrap();
        assert_eq!(first, vec![CH.to_string()]);

        // second client on the same channel: no new upstream work
        let first = registry.subscribe(&b.id, &[CH.to_string()]).unwrap();
        assert!(first.is_empty());

        // repeat subscribe is idempotent
        let first = registry.subscribe(&a.id, &[CH.to_string()]).unwrap();
        assert!(first.is_empty());

        let emptied = registry.unsubscribe(&a.id, &[CH.to_string()]).unwrap();
        assert!(emptied.is_empty());

        let emptied = registry.unsubscribe(&b.id, &[CH.to_string()]).unwrap();
        assert_eq!(emptied, vec![CH.to_string()]);

        // repeat unsubscribe is idempotent
        let emptied = registry.unsubscribe(&b.id, &[CH.to_string()]).unwrap();
        assert!(emptied.is_empty());

        assert!(registry.all_channels().is_empty());
    }

    #[test]
    fn unregister_cleans_every_interest() {
        let registry = ClientRegistry::new();
        let a = client();
        let b = client();
        registry.register(a.clone());
        registry.register(b.clone());

        let shared = "trades.ETH-PERPETUAL.raw".to_string();
        registry.subscribe(&a.id, &[CH.to_string(), shared.clone()]).unwrap();
        registry.subscribe(&b.id, &[shared.clone()]).unwrap();

        let mut emptied = registry.unregister(&a.id);
        emptied.sort();
        // shared channel survives because b still wants it
        assert_eq!(emptied, vec![CH.to_string()]);
        assert_eq!(registry.all_channels(), vec![shared.clone()]);
        assert_eq!(registry.client_count(), 1);

        let emptied = registry.unregister(&b.id);
        assert_eq!(emptied, vec![shared]);
        assert_eq!(registry.subscription_count(), 0);
    }

    #[test]
    fn unregister_unknown_client_is_noop() {
        let registry = ClientRegistry::new();
        assert!(registry.unregister(&Uuid::new_v4()).is_empty());
    }

    #[test]
    fn subscribers_snapshot_matches_interest() {
        let registry = ClientRegistry::new();
        let a = client();
        registry.register(a.clone());
        registry.subscribe(&a.id, &[CH.to_string()]).unwrap();

        let subs = registry.subscribers(CH);
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].id, a.id);

        assert!(registry.subscribers("ticker.ETH-PERPETUAL.100ms").is_empty());
    }

    #[test]
    fn concurrent_interest_churn_makes_progress() {
        // Register/subscribe/lookup/unregister racing across threads must
        // never wedge: no registry operation may hold a guard on one map
        // while locking the other. A lock cycle here hangs this test.
        let registry = Arc::new(ClientRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let registry = Arc::clone(&registry);
            handles.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    let (tx, _rx) = mpsc::channel(1);
                    let c = Arc::new(ClientState::new(tx));
                    registry.register(c.clone());
                    registry.subscribe(&c.id, &[CH.to_string()]).unwrap();
                    let _ = registry.subscribers(CH);
                    registry.unregister(&c.id);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.client_count(), 0);
        assert!(registry.all_channels().is_empty());
    }

    #[test]
    fn subscribe_requires_registered_client() {
        let registry = ClientRegistry::new();
        let err = registry.subscribe(&Uuid::new_v4(), &[CH.to_string()]);
        assert!(matches!(err, Err(GatewayError::ClientNotFound(_))));
    }
}
