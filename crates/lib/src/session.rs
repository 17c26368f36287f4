//! Per-connection session state machine for the gateway.
//!
//! Idle (registered, no room) -> Active (joined, username bound) -> Closed. Protocol events
//! are turned into registry/broadcaster calls; anything malformed is ignored.

use crate::gateway::{ClientFrame, JoinParams, MessageParams};
use crate::registry::ConnectionId;
use crate::room::{ChatMessage, RoomBroadcaster};

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active { username: String, room: String },
    Closed,
}

/// What a client event asks the gateway to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    Join { room: String, username: String },
    Broadcast(ChatMessage),
    Leave,
    Ignore(String),
}

/// One connection's session: its id, the room used when a join names none, and its state.
pub struct Session {
    id: ConnectionId,
    default_room: String,
    state: SessionState,
}

impl Session {
    pub fn new(id: ConnectionId, default_room: impl Into<String>) -> Self {
        Self {
            id,
            default_room: default_room.into(),
            state: SessionState::Idle,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Decide what an event means in the current state. Does not mutate anything.
    pub fn plan(&self, frame: ClientFrame) -> SessionAction {
        if self.state == SessionState::Closed {
            return SessionAction::Ignore("session closed".to_string());
        }
        match frame {
            ClientFrame::Join(JoinParams { username, room }) => {
                let room = room
                    .map(|r| r.trim().to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| self.default_room.clone());
                let username = username.trim().to_string();
                if username.is_empty() {
                    return SessionAction::Ignore("join without username".to_string());
                }
                SessionAction::Join { room, username }
            }
            ClientFrame::Message(MessageParams { room: target, msg, .. }) => {
                let SessionState::Active { username, room } = &self.state else {
                    return SessionAction::Ignore("message before join".to_string());
                };
                if let Some(target) = target.as_deref().map(str::trim) {
                    if !target.is_empty() && target != room {
                        return SessionAction::Ignore(format!(
                            "message for room {} while joined to {}",
                            target, room
                        ));
                    }
                }
                let body = msg.trim();
                if body.is_empty() {
                    return SessionAction::Ignore("empty message".to_string());
                }
                SessionAction::Broadcast(ChatMessage::new(
                    self.id.clone(),
                    username.clone(),
                    room.clone(),
                    body,
                ))
            }
            ClientFrame::Leave => match self.state {
                SessionState::Active { .. } => SessionAction::Leave,
                _ => SessionAction::Ignore("leave without room".to_string()),
            },
        }
    }

    /// Apply one client event against the broadcaster.
    pub async fn handle(&mut self, broadcaster: &RoomBroadcaster, frame: ClientFrame) {
        match self.plan(frame) {
            SessionAction::Join { room, username } => {
                match broadcaster.join(&room, &self.id, &username).await {
                    Ok(bound) => {
                        self.state = SessionState::Active {
                            username: bound,
                            room,
                        };
                    }
                    Err(e) => log::debug!("{}: join ignored: {}", self.id, e),
                }
            }
            SessionAction::Broadcast(message) => {
                let delivered = broadcaster.broadcast(&message.room, &message).await;
                log::debug!(
                    "{}: relayed message to {} member(s) of {}",
                    self.id,
                    delivered,
                    message.room
                );
            }
            SessionAction::Leave => {
                broadcaster.leave(&self.id).await;
                self.state = SessionState::Idle;
            }
            SessionAction::Ignore(reason) => {
                log::debug!("{}: event ignored: {}", self.id, reason);
            }
        }
    }

    /// Terminal transition: unregister, which also removes the connection from its room.
    pub async fn close(&mut self, broadcaster: &RoomBroadcaster) {
        if self.state == SessionState::Closed {
            return;
        }
        broadcaster.unregister(&self.id).await;
        self.state = SessionState::Closed;
    }
}
