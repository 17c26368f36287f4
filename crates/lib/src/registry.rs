//! Connection registry: live connections keyed by id, with their bound username and room.
//!
//! Room membership itself lives in the broadcaster; the `room` field here mirrors it so a
//! connection can be removed from its room when it goes away. Removal and room binding are
//! crate-private: outside callers go through [`crate::room::RoomBroadcaster`], which keeps
//! both sides in step.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;

use crate::error::RelayError;
use crate::gateway::ServerFrame;

/// Unique connection identifier (opaque string).
pub type ConnectionId = String;

/// Sending half of a connection's bounded outbox. The session task owns the receiver.
pub type Outbox = mpsc::Sender<ServerFrame>;

/// One open duplex channel to a client.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    /// Set by the first join, never re-validated.
    pub username: Option<String>,
    pub room: Option<String>,
    outbox: Outbox,
}

impl Connection {
    /// Queue a frame without waiting. Fails when the outbox is full or the session is gone.
    pub fn deliver(&self, frame: ServerFrame) -> Result<(), TrySendError<ServerFrame>> {
        self.outbox.try_send(frame)
    }
}

/// Table of live connections. Shared across the gateway.
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<ConnectionId, Connection>>>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Admit a connection with no username and no room; returns its new id.
    pub async fn register(&self, outbox: Outbox) -> ConnectionId {
        let id = format!("conn-{}", uuid::Uuid::new_v4());
        let connection = Connection {
            id: id.clone(),
            username: None,
            room: None,
            outbox,
        };
        self.inner.write().await.insert(id.clone(), connection);
        id
    }

    /// Return a clone of the connection if it is still registered.
    pub async fn lookup(&self, id: &str) -> Option<Connection> {
        self.inner.read().await.get(id).cloned()
    }

    /// Remove the connection; dropping it closes its outbox. Absent ids are a no-op.
    pub(crate) async fn remove(&self, id: &str) -> Option<Connection> {
        self.inner.write().await.remove(id)
    }

    /// Bind the username on first call (later calls keep the original) and set the current room.
    /// Returns the username in effect.
    pub(crate) async fn bind(
        &self,
        id: &str,
        username: &str,
        room: Option<String>,
    ) -> Result<String, RelayError> {
        let mut g = self.inner.write().await;
        let connection = g
            .get_mut(id)
            .ok_or_else(|| RelayError::NotRegistered(id.to_string()))?;
        let bound = connection
            .username
            .get_or_insert_with(|| username.to_string())
            .clone();
        connection.room = room;
        Ok(bound)
    }

    /// Clear the room field; returns the room the connection was in.
    pub(crate) async fn clear_room(&self, id: &str) -> Option<String> {
        let mut g = self.inner.write().await;
        g.get_mut(id).and_then(|c| c.room.take())
    }

    /// Current room of the connection, if registered and joined.
    pub async fn room_of(&self, id: &str) -> Option<String> {
        self.inner.read().await.get(id).and_then(|c| c.room.clone())
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Remove every connection and return them (used at shutdown).
    pub(crate) async fn drain(&self) -> Vec<Connection> {
        let mut g = self.inner.write().await;
        g.drain().map(|(_, c)| c).collect()
    }
}
