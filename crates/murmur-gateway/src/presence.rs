use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast, mpsc};
use uuid::Uuid;

use murmur_types::events::ServerEvent;
use murmur_types::models::UserId;

/// What a connection's send task is asked to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(ServerEvent),
    /// Send a close frame and stop.
    Close,
}

/// The registry's grip on one live connection: an id plus the sending half of
/// the connection's targeted queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    conn_id: Uuid,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                conn_id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    /// Queue an event. Never blocks; returns false if the connection is gone.
    pub fn push(&self, event: ServerEvent) -> bool {
        self.tx.send(Outbound::Event(event)).is_ok()
    }

    pub fn close(&self) -> bool {
        self.tx.send(Outbound::Close).is_ok()
    }
}

/// Who is reachable right now: user id -> live connection.
///
/// Also owns the global broadcast channel every connection subscribes to.
#[derive(Clone)]
pub struct PresenceRegistry {
    inner: Arc<PresenceInner>,
}

struct PresenceInner {
    /// Broadcast channel for gateway events; every connected client receives every event
    broadcast_tx: broadcast::Sender<ServerEvent>,

    connections: RwLock<HashMap<UserId, ConnectionHandle>>,
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceRegistry {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(PresenceInner {
                broadcast_tx,
                connections: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to gateway events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Broadcast an event to all connected clients.
    pub fn broadcast(&self, event: ServerEvent) {
        let _ = self.inner.broadcast_tx.send(event);
    }

    /// Bind `user_id` to `handle`, replacing any previous connection (last one
    /// wins). The replaced handle is returned and left open. Broadcasts one
    /// `PresenceChanged { online: true }`.
    pub async fn register(&self, user_id: UserId, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let mut connections = self.inner.connections.write().await;
        let previous = connections.insert(user_id, handle);
        // Broadcast under the lock so notification order follows mutation order.
        self.broadcast(ServerEvent::PresenceChanged {
            user_id,
            online: true,
        });
        previous
    }

    /// Remove the entry for `user_id`, but only if it still belongs to
    /// `conn_id`. Broadcasts one `PresenceChanged { online: false }` when an
    /// entry was removed; stale or repeated calls change nothing.
    pub async fn deregister(&self, user_id: UserId, conn_id: Uuid) -> bool {
        let mut connections = self.inner.connections.write().await;
        let owns_entry = connections
            .get(&user_id)
            .is_some_and(|handle| handle.conn_id == conn_id);
        if !owns_entry {
            return false;
        }

        connections.remove(&user_id);
        self.broadcast(ServerEvent::PresenceChanged {
            user_id,
            online: false,
        });
        true
    }

    pub async fn lookup(&self, user_id: UserId) -> Option<ConnectionHandle> {
        self.inner.connections.read().await.get(&user_id).cloned()
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.inner.connections.read().await.contains_key(&user_id)
    }

    pub async fn online_ids(&self) -> HashSet<UserId> {
        self.inner.connections.read().await.keys().copied().collect()
    }

    /// Send a targeted event to a specific user. Returns false if the user is
    /// not connected.
    pub async fn send_to_user(&self, user_id: UserId, event: ServerEvent) -> bool {
        let connections = self.inner.connections.read().await;
        match connections.get(&user_id) {
            Some(handle) => handle.push(event),
            None => false,
        }
    }
}
