//! Room broadcaster: per-room member sets and ordered fan-out of chat messages.
//!
//! Locking: the room table is an `RwLock`. Membership changes (join, leave, unregister)
//! take it for writing; broadcasts take it for reading and then the room's own mutex, so
//! broadcasts into different rooms run concurrently while broadcasts into the same room
//! are serialized. Lock order is room table, then room members, then registry.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::error::RelayError;
use crate::gateway::{MessagePayload, ServerFrame};
use crate::registry::{ConnectionId, ConnectionRegistry, Outbox};

/// One chat message in transit. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub sender_id: ConnectionId,
    pub username: String,
    pub room: String,
    pub body: String,
    /// Assigned by the server when the message is constructed.
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(
        sender_id: impl Into<ConnectionId>,
        username: impl Into<String>,
        room: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            username: username.into(),
            room: room.into(),
            body: body.into(),
            timestamp: Utc::now(),
        }
    }

    /// Prefixed form shown by clients: `"<username>: <body>"`.
    pub fn display_text(&self) -> String {
        format!("{}: {}", self.username, self.body)
    }
}

#[derive(Default)]
struct Room {
    members: Mutex<HashSet<ConnectionId>>,
}

/// Owns the room table and the connection registry for the lifetime of the gateway.
pub struct RoomBroadcaster {
    registry: Arc<ConnectionRegistry>,
    rooms: RwLock<HashMap<String, Arc<Room>>>,
}

impl Default for RoomBroadcaster {
    fn default() -> Self {
        Self::new(Arc::new(ConnectionRegistry::new()))
    }
}

impl RoomBroadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Whether the connection is still registered.
    pub async fn is_registered(&self, id: &str) -> bool {
        self.registry.contains(id).await
    }

    /// Admit a new connection (no room yet).
    pub async fn register(&self, outbox: Outbox) -> ConnectionId {
        self.registry.register(outbox).await
    }

    /// Remove the connection from the registry and from its room. Idempotent.
    pub async fn unregister(&self, id: &str) {
        let mut rooms = self.rooms.write().await;
        if let Some(connection) = self.registry.remove(id).await {
            if let Some(room) = connection.room {
                remove_member(&mut rooms, &room, id).await;
            }
            log::info!(
                "connection {} ({}) unregistered",
                id,
                connection.username.as_deref().unwrap_or("anonymous")
            );
        }
    }

    /// Add the connection to `room`, leaving any previous room first. Creates the room if absent.
    /// No event is emitted to other members. Returns the username bound to the connection.
    pub async fn join(
        &self,
        room: &str,
        id: &str,
        username: &str,
    ) -> Result<String, RelayError> {
        let room = room.trim();
        if room.is_empty() {
            return Err(RelayError::EmptyRoomName);
        }
        let username = username.trim();
        if username.is_empty() {
            return Err(RelayError::EmptyUsername);
        }

        let mut rooms = self.rooms.write().await;
        let previous = match self.registry.lookup(id).await {
            Some(connection) => connection.room,
            None => return Err(RelayError::NotRegistered(id.to_string())),
        };
        if let Some(prev) = previous.as_deref().filter(|p| *p != room) {
            remove_member(&mut rooms, prev, id).await;
        }
        let entry = rooms.entry(room.to_string()).or_default().clone();
        entry.members.lock().await.insert(id.to_string());
        let bound = self.registry.bind(id, username, Some(room.to_string())).await?;
        log::info!("{} ({}) joined room {}", bound, id, room);
        Ok(bound)
    }

    /// Remove the connection from whatever room it is in. No-op when not in a room.
    pub async fn leave(&self, id: &str) {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = self.registry.clear_room(id).await {
            remove_member(&mut rooms, &room, id).await;
            log::info!("{} left room {}", id, room);
        }
    }

    /// Queue `message` to every member of `room`, sender included. Members whose outbox is
    /// full or closed, or who are no longer registered, are unregistered and skipped.
    /// A sender that is not (or no longer) a member of `room` relays nothing.
    /// Returns the number of members the message was queued for.
    pub async fn broadcast(&self, room: &str, message: &ChatMessage) -> usize {
        let frame = ServerFrame::Message(MessagePayload::from(message));
        let mut delivered = 0;
        let mut failed = Vec::new();
        {
            let rooms = self.rooms.read().await;
            let Some(entry) = rooms.get(room) else {
                return 0;
            };
            let members = entry.members.lock().await;
            if !members.contains(&message.sender_id) {
                log::debug!(
                    "{} is not a member of {}, dropping message",
                    message.sender_id,
                    room
                );
                return 0;
            }
            for id in members.iter() {
                match self.registry.lookup(id).await {
                    Some(connection) => match connection.deliver(frame.clone()) {
                        Ok(()) => delivered += 1,
                        Err(e) => {
                            log::debug!("delivery to {} failed: {}", id, e);
                            failed.push(id.clone());
                        }
                    },
                    None => {
                        log::debug!("room {} member {} no longer registered", room, id);
                        failed.push(id.clone());
                    }
                }
            }
        }
        for id in failed {
            self.evict(room, &id).await;
        }
        delivered
    }

    /// Drop a member that could not be reached: unregister it and make sure `room` no longer lists it.
    async fn evict(&self, room: &str, id: &str) {
        let mut rooms = self.rooms.write().await;
        if let Some(connection) = self.registry.remove(id).await {
            if let Some(current) = connection.room.as_deref().filter(|r| *r != room) {
                remove_member(&mut rooms, current, id).await;
            }
        }
        remove_member(&mut rooms, room, id).await;
    }

    /// Snapshot of a room's member set; empty when the room does not exist.
    pub async fn members(&self, room: &str) -> HashSet<ConnectionId> {
        let rooms = self.rooms.read().await;
        match rooms.get(room) {
            Some(entry) => entry.members.lock().await.clone(),
            None => HashSet::new(),
        }
    }

    /// Member count per room, ordered by room name.
    pub async fn room_sizes(&self) -> BTreeMap<String, usize> {
        let rooms = self.rooms.read().await;
        let mut sizes = BTreeMap::new();
        for (name, entry) in rooms.iter() {
            sizes.insert(name.clone(), entry.members.lock().await.len());
        }
        sizes
    }

    pub async fn room_of(&self, id: &str) -> Option<String> {
        self.registry.room_of(id).await
    }

    pub async fn room_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.len().await
    }

    /// Queue a shutdown event to every connection, then clear the registry and all rooms.
    /// Dropping the registry entries closes each outbox after the shutdown frame.
    pub async fn shutdown(&self) {
        let mut rooms = self.rooms.write().await;
        let connections = self.registry.drain().await;
        for connection in &connections {
            if connection.deliver(ServerFrame::Shutdown).is_err() {
                log::debug!("could not queue shutdown for {}", connection.id);
            }
        }
        rooms.clear();
        log::info!("broadcaster shut down ({} connection(s) closed)", connections.len());
    }
}

/// Remove `id` from `room`, dropping the room once it is empty.
async fn remove_member(rooms: &mut HashMap<String, Arc<Room>>, room: &str, id: &str) {
    let now_empty = match rooms.get(room) {
        Some(entry) => {
            let mut members = entry.members.lock().await;
            members.remove(id);
            members.is_empty()
        }
        None => false,
    };
    if now_empty {
        rooms.remove(room);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn connect(b: &RoomBroadcaster) -> (ConnectionId, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(16);
        (b.register(tx).await, rx)
    }

    fn recv_msg(rx: &mut mpsc::Receiver<ServerFrame>) -> Option<String> {
        match rx.try_recv() {
            Ok(ServerFrame::Message(p)) => Some(p.msg),
            _ => None,
        }
    }

    #[tokio::test]
    async fn join_creates_room_lazily_and_tracks_members() {
        let b = RoomBroadcaster::default();
        let (a, _ra) = connect(&b).await;
        let (c, _rc) = connect(&b).await;
        assert!(b.room_names().await.is_empty());

        b.join("default", &a, "alice").await.expect("join a");
        b.join("default", &c, "bob").await.expect("join c");

        let members = b.members("default").await;
        assert_eq!(members, HashSet::from([a.clone(), c.clone()]));
        assert_eq!(b.room_names().await, vec!["default".to_string()]);
        assert_eq!(b.room_sizes().await.get("default"), Some(&2));
    }

    #[tokio::test]
    async fn rejoin_moves_connection_to_latest_room() {
        let b = RoomBroadcaster::default();
        let (a, _ra) = connect(&b).await;
        b.join("one", &a, "alice").await.expect("join one");
        b.join("two", &a, "alice").await.expect("join two");
        b.join("three", &a, "alice").await.expect("join three");

        assert_eq!(b.room_of(&a).await.as_deref(), Some("three"));
        assert!(b.members("one").await.is_empty());
        assert!(b.members("two").await.is_empty());
        assert_eq!(b.members("three").await, HashSet::from([a.clone()]));
        assert_eq!(b.room_names().await, vec!["three".to_string()]);
    }

    #[tokio::test]
    async fn join_same_room_twice_is_stable() {
        let b = RoomBroadcaster::default();
        let (a, _ra) = connect(&b).await;
        b.join("default", &a, "alice").await.expect("join");
        b.join("default", &a, "alice").await.expect("join again");
        assert_eq!(b.members("default").await.len(), 1);
    }

    #[tokio::test]
    async fn join_emits_nothing_to_members() {
        let b = RoomBroadcaster::default();
        let (a, mut ra) = connect(&b).await;
        let (c, _rc) = connect(&b).await;
        b.join("default", &a, "alice").await.expect("join a");
        b.join("default", &c, "bob").await.expect("join c");
        assert!(ra.try_recv().is_err());
    }

    #[tokio::test]
    async fn join_rejects_unknown_or_blank_input() {
        let b = RoomBroadcaster::default();
        let (a, _ra) = connect(&b).await;
        assert_eq!(b.join("  ", &a, "alice").await, Err(RelayError::EmptyRoomName));
        assert_eq!(b.join("default", &a, " ").await, Err(RelayError::EmptyUsername));
        assert_eq!(
            b.join("default", "conn-ghost", "ghost").await,
            Err(RelayError::NotRegistered("conn-ghost".into()))
        );
        assert!(b.room_names().await.is_empty());
    }

    #[tokio::test]
    async fn broadcast_reaches_every_member_including_sender() {
        let b = RoomBroadcaster::default();
        let (a, mut ra) = connect(&b).await;
        let (c, mut rc) = connect(&b).await;
        b.join("default", &a, "alice").await.expect("join a");
        b.join("default", &c, "bob").await.expect("join c");

        let delivered = b
            .broadcast("default", &ChatMessage::new(a.clone(), "alice", "default", "hi"))
            .await;
        assert_eq!(delivered, 2);
        assert_eq!(recv_msg(&mut ra).as_deref(), Some("alice: hi"));
        assert_eq!(recv_msg(&mut rc).as_deref(), Some("alice: hi"));
        assert!(ra.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_is_isolated_per_room() {
        let b = RoomBroadcaster::default();
        let (a, mut ra) = connect(&b).await;
        let (c, mut rc) = connect(&b).await;
        b.join("a", &a, "alice").await.expect("join a");
        b.join("b", &c, "bob").await.expect("join b");

        b.broadcast("a", &ChatMessage::new(a.clone(), "alice", "a", "only a"))
            .await;
        assert_eq!(recv_msg(&mut ra).as_deref(), Some("alice: only a"));
        assert!(rc.try_recv().is_err());
    }

    #[tokio::test]
    async fn messages_arrive_in_broadcast_order() {
        let b = RoomBroadcaster::default();
        let (a, mut ra) = connect(&b).await;
        let (c, mut rc) = connect(&b).await;
        b.join("default", &a, "alice").await.expect("join a");
        b.join("default", &c, "bob").await.expect("join c");

        b.broadcast("default", &ChatMessage::new(a.clone(), "alice", "default", "m1"))
            .await;
        b.broadcast("default", &ChatMessage::new(c.clone(), "bob", "default", "m2"))
            .await;

        for rx in [&mut ra, &mut rc] {
            assert_eq!(recv_msg(rx).as_deref(), Some("alice: m1"));
            assert_eq!(recv_msg(rx).as_deref(), Some("bob: m2"));
        }
    }

    #[tokio::test]
    async fn concurrent_senders_produce_one_order_for_all_members() {
        let b = Arc::new(RoomBroadcaster::default());
        let (tx_a, mut ra) = mpsc::channel(256);
        let (tx_c, mut rc) = mpsc::channel(256);
        let a = b.register(tx_a).await;
        let c = b.register(tx_c).await;
        b.join("default", &a, "alice").await.expect("join a");
        b.join("default", &c, "bob").await.expect("join c");

        let mut tasks = Vec::new();
        for (id, name) in [(a.clone(), "alice"), (c.clone(), "bob")] {
            let b = b.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..50 {
                    let m = ChatMessage::new(id.clone(), name, "default", format!("{}", i));
                    b.broadcast("default", &m).await;
                }
            }));
        }
        for t in tasks {
            t.await.expect("sender task");
        }

        let mut seen_a = Vec::new();
        while let Some(m) = recv_msg(&mut ra) {
            seen_a.push(m);
        }
        let mut seen_c = Vec::new();
        while let Some(m) = recv_msg(&mut rc) {
            seen_c.push(m);
        }
        assert_eq!(seen_a.len(), 100);
        assert_eq!(seen_a, seen_c);
    }

    #[tokio::test]
    async fn unregister_cleans_room_and_is_idempotent() {
        let b = RoomBroadcaster::default();
        let (a, _ra) = connect(&b).await;
        let (c, mut rc) = connect(&b).await;
        b.join("default", &a, "alice").await.expect("join a");
        b.join("default", &c, "bob").await.expect("join c");

        b.unregister(&a).await;
        b.unregister(&a).await;

        assert_eq!(b.members("default").await, HashSet::from([c.clone()]));
        assert!(!b.is_registered(&a).await);

        let delivered = b
            .broadcast("default", &ChatMessage::new(c.clone(), "bob", "default", "still here?"))
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(recv_msg(&mut rc).as_deref(), Some("bob: still here?"));
    }

    #[tokio::test]
    async fn leave_twice_matches_leave_once() {
        let b = RoomBroadcaster::default();
        let (a, _ra) = connect(&b).await;
        b.join("default", &a, "alice").await.expect("join");
        b.leave(&a).await;
        b.leave(&a).await;
        assert_eq!(b.room_of(&a).await, None);
        assert!(b.members("default").await.is_empty());
        assert!(b.is_registered(&a).await);
    }

    #[tokio::test]
    async fn closed_member_is_dropped_without_affecting_others() {
        let b = RoomBroadcaster::default();
        let (a, ra) = connect(&b).await;
        let (c, mut rc) = connect(&b).await;
        b.join("default", &a, "alice").await.expect("join a");
        b.join("default", &c, "bob").await.expect("join c");
        drop(ra);

        let delivered = b
            .broadcast("default", &ChatMessage::new(c.clone(), "bob", "default", "hello"))
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(recv_msg(&mut rc).as_deref(), Some("bob: hello"));
        assert_eq!(b.members("default").await, HashSet::from([c.clone()]));
        assert!(!b.is_registered(&a).await);
    }

    #[tokio::test]
    async fn full_outbox_disconnects_slow_member() {
        let b = RoomBroadcaster::default();
        let (tx_slow, _slow_rx) = mpsc::channel(1);
        let slow = b.register(tx_slow).await;
        let (fast, mut rf) = connect(&b).await;
        b.join("default", &slow, "slow").await.expect("join slow");
        b.join("default", &fast, "fast").await.expect("join fast");

        b.broadcast("default", &ChatMessage::new(fast.clone(), "fast", "default", "one"))
            .await;
        b.broadcast("default", &ChatMessage::new(fast.clone(), "fast", "default", "two"))
            .await;

        assert!(!b.is_registered(&slow).await);
        assert_eq!(b.members("default").await, HashSet::from([fast.clone()]));
        assert_eq!(recv_msg(&mut rf).as_deref(), Some("fast: one"));
        assert_eq!(recv_msg(&mut rf).as_deref(), Some("fast: two"));
    }

    #[tokio::test]
    async fn broadcast_to_missing_room_is_a_noop() {
        let b = RoomBroadcaster::default();
        let delivered = b
            .broadcast("nowhere", &ChatMessage::new("conn-x", "x", "nowhere", "hi"))
            .await;
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn shutdown_notifies_and_clears_everything() {
        let b = RoomBroadcaster::default();
        let (a, mut ra) = connect(&b).await;
        b.join("default", &a, "alice").await.expect("join");

        b.shutdown().await;

        assert_eq!(ra.recv().await, Some(ServerFrame::Shutdown));
        assert_eq!(ra.recv().await, None);
        assert_eq!(b.connection_count().await, 0);
        assert!(b.room_names().await.is_empty());
    }

    #[tokio::test]
    async fn no_room_lists_an_unregistered_connection() {
        let b = RoomBroadcaster::default();
        let (a, _ra) = connect(&b).await;
        let (c, _rc) = connect(&b).await;
        b.join("one", &a, "alice").await.expect("join one");
        b.join("two", &a, "alice").await.expect("move to two");
        b.join("two", &c, "bob").await.expect("join c");

        b.unregister(&a).await;

        assert!(!b.is_registered(&a).await);
        for room in b.room_names().await {
            assert!(
                !b.members(&room).await.contains(&a),
                "room {} still lists {}",
                room,
                a
            );
        }
        assert_eq!(b.room_sizes().await, BTreeMap::from([("two".to_string(), 1)]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unregister_during_broadcast_drops_delivery_quietly() {
        let b = Arc::new(RoomBroadcaster::default());
        let (tx_a, _ra) = mpsc::channel(256);
        let (tx_c, mut rc) = mpsc::channel(256);
        let a = b.register(tx_a).await;
        let c = b.register(tx_c).await;
        b.join("default", &a, "alice").await.expect("join a");
        b.join("default", &c, "bob").await.expect("join c");

        let sender = {
            let b = b.clone();
            let c = c.clone();
            tokio::spawn(async move {
                for i in 0..100 {
                    let m = ChatMessage::new(c.clone(), "bob", "default", format!("{}", i));
                    b.broadcast("default", &m).await;
                    tokio::task::yield_now().await;
                }
            })
        };
        let leaver = {
            let b = b.clone();
            let a = a.clone();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                b.unregister(&a).await;
            })
        };
        sender.await.expect("sender task");
        leaver.await.expect("unregister task");

        assert!(!b.is_registered(&a).await);
        assert_eq!(b.members("default").await, HashSet::from([c.clone()]));
        let mut seen = 0;
        while recv_msg(&mut rc).is_some() {
            seen += 1;
        }
        assert_eq!(seen, 100);
    }

    #[tokio::test]
    async fn evicted_sender_relays_nothing() {
        let b = RoomBroadcaster::default();
        let (a, _ra) = connect(&b).await;
        let (c, mut rc) = connect(&b).await;
        b.join("default", &a, "alice").await.expect("join a");
        b.join("default", &c, "bob").await.expect("join c");
        b.unregister(&a).await;

        let delivered = b
            .broadcast("default", &ChatMessage::new(a.clone(), "alice", "default", "late"))
            .await;
        assert_eq!(delivered, 0);
        assert!(rc.try_recv().is_err());
    }
}
