use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    RwLock,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::WebSocketError;
use crate::Result;

/// Server-assigned identifier of one live WebSocket session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

struct ConnectionEntry {
    sender: UnboundedSender<String>,
    rooms: HashSet<String>,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    // room label (user id) -> members
    rooms: HashMap<String, HashSet<ConnectionId>>,
}

impl Inner {
    fn drop_connection(&mut self, id: ConnectionId) -> Option<ConnectionEntry> {
        let entry = self.connections.remove(&id)?;
        for room in &entry.rooms {
            if let Some(members) = self.rooms.get_mut(room) {
                members.remove(&id);
                if members.is_empty() {
                    self.rooms.remove(room);
                }
            }
        }
        Some(entry)
    }
}

/// Maps user ids to the connections that joined their room.
///
/// Every operation runs under one write or read lock, so joins, disconnects
/// and broadcasts never interleave half-way.
#[derive(Default, Clone)]
pub struct RoomRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new connection and returns the receiving half of its
    /// outbound channel.
    pub async fn register(&self) -> (ConnectionId, UnboundedReceiver<String>) {
        let (tx, rx) = unbounded_channel();
        let id = ConnectionId::new();

        let mut guard = self.inner.write().await;
        guard.connections.insert(
            id,
            ConnectionEntry {
                sender: tx,
                rooms: HashSet::new(),
            },
        );
        debug!("Registered connection {}, total: {}", id, guard.connections.len());

        (id, rx)
    }

    /// Adds `id` to room `room`. Returns `false` if it was already a member
    /// or the connection is gone.
    pub async fn join(&self, id: ConnectionId, room: &str) -> bool {
        let mut guard = self.inner.write().await;

        let Some(entry) = guard.connections.get_mut(&id) else {
            debug!("Ignoring join of room {} by unknown connection {}", room, id);
            return false;
        };
        if !entry.rooms.insert(room.to_string()) {
            return false;
        }

        guard.rooms.entry(room.to_string()).or_default().insert(id);
        info!("Connection {} joined room {}", id, room);
        true
    }

    /// Removes the connection from every room it joined and drops its sender.
    pub async fn disconnect(&self, id: ConnectionId) {
        let mut guard = self.inner.write().await;
        if let Some(entry) = guard.drop_connection(id) {
            debug!(
                "Connection {} left {} room(s), remaining connections: {}",
                id,
                entry.rooms.len(),
                guard.connections.len()
            );
        }
    }

    /// Sends `msg` to every member of `room` and returns how many received it.
    ///
    /// An empty or unknown room is not an error. Members whose channel is
    /// closed are disconnected.
    pub async fn broadcast(&self, room: &str, msg: &str) -> usize {
        let mut guard = self.inner.write().await;

        let Some(members) = guard.rooms.get(room) else {
            return 0;
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for id in members {
            match guard.connections.get(id) {
                Some(entry) if entry.sender.send(msg.to_string()).is_ok() => delivered += 1,
                _ => dead.push(*id),
            }
        }

        for id in dead {
            guard.drop_connection(id);
            debug!("Pruned dead connection {} while broadcasting to room {}", id, room);
        }

        delivered
    }

    pub async fn broadcast_json<T: Serialize>(&self, room: &str, payload: &T) -> Result<usize> {
        let text = serde_json::to_string(payload)
            .map_err(|e| WebSocketError::InvalidFormat(format!("Failed to serialize message: {}", e)))?;
        Ok(self.broadcast(room, &text).await)
    }

    pub async fn room_size(&self, room: &str) -> usize {
        let guard = self.inner.read().await;
        guard.rooms.get(room).map(|m| m.len()).unwrap_or(0)
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    pub async fn room_count(&self) -> usize {
        self.inner.read().await.rooms.len()
    }
}
