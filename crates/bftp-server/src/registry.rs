//! Shared connection registry.
//!
//! The one piece of state crossing connection boundaries: the send-capability
//! map (connection id → channel into that connection's writer task), the
//! login map, the reader/writer gate over the file namespace, and the
//! per-filename write reservations. Nothing outside this module touches the
//! maps directly.

use bftp_wire::Packet;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock;
use tracing::debug;

pub type ConnectionId = u64;

#[derive(Debug, Default)]
pub struct Registry {
    connections: DashMap<ConnectionId, UnboundedSender<Packet>>,
    logins: DashMap<String, ConnectionId>,
    /// Filenames with an upload in flight, keyed to the uploading
    /// connection. Checked (not held) across ACK/DATA round-trips, so the
    /// namespace gate itself never spans a network wait.
    reservations: DashMap<String, ConnectionId>,
    gate: RwLock<()>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a send capability for `id`. Idempotent: a second register for
    /// a live id keeps the existing capability.
    pub fn register(&self, id: ConnectionId, tx: UnboundedSender<Packet>) {
        self.connections.entry(id).or_insert(tx);
    }

    pub fn unregister(&self, id: ConnectionId) {
        self.connections.remove(&id);
    }

    /// Best-effort delivery to one connection.
    pub fn send(&self, id: ConnectionId, packet: Packet) -> bool {
        match self.connections.get(&id) {
            Some(tx) => tx.send(packet).is_ok(),
            None => false,
        }
    }

    /// Atomically claim `name` for `id`. Returns false if some session
    /// already holds the name.
    pub fn login(&self, name: &str, id: ConnectionId) -> bool {
        match self.logins.entry(name.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(id);
                true
            }
        }
    }

    pub fn logout(&self, name: &str) {
        self.logins.remove(name);
    }

    pub fn is_logged_in(&self, name: &str) -> bool {
        self.logins.contains_key(name)
    }

    /// Deliver `packet` to every logged-in connection except `except_id`.
    /// Per-recipient best-effort: one dead connection does not stop the rest.
    pub fn broadcast(&self, except_id: ConnectionId, packet: Packet) {
        for entry in self.logins.iter() {
            let id = *entry.value();
            if id != except_id && !self.send(id, packet.clone()) {
                debug!(connection = id, "broadcast recipient unreachable");
            }
        }
    }

    /// Run `f` while holding the namespace gate shared. `f` must be a single
    /// local file operation, never a network wait.
    pub async fn with_read_access<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.gate.read().await;
        f()
    }

    /// Run `f` while holding the namespace gate exclusively.
    pub async fn with_write_access<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.gate.write().await;
        f()
    }

    /// Mark `name` as having an upload in flight by `id`.
    pub fn reserve(&self, name: &str, id: ConnectionId) -> bool {
        match self.reservations.entry(name.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(id);
                true
            }
        }
    }

    /// Drop `id`'s reservation of `name`, if it holds one.
    pub fn release(&self, name: &str, id: ConnectionId) {
        self.reservations.remove_if(name, |_, owner| *owner == id);
    }

    pub fn is_reserved(&self, name: &str) -> bool {
        self.reservations.contains_key(name)
    }
}
