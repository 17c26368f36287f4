//! Client-side chat log: what a chat client keeps, how it styles entries, and what it sends.

use chrono::Local;

use crate::gateway::{ClientFrame, MessageParams, MessagePayload, ServerFrame};
use crate::registry::ConnectionId;

/// Styling class of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStyle {
    /// Sent by this client: right aligned, highlighted.
    Own,
    /// Sent by someone else: left aligned, plain.
    Peer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Local time of receipt, `HH:MM:SS`.
    pub display_time: String,
    pub text: String,
    pub style: EntryStyle,
}

impl LogEntry {
    /// `[HH:MM:SS] alice: hi`
    pub fn line(&self) -> String {
        format!("[{}] {}", self.display_time, self.text)
    }
}

/// Local message log for one joined user.
#[derive(Debug, Clone)]
pub struct ChatLog {
    username: String,
    room: String,
    connection_id: Option<ConnectionId>,
    entries: Vec<LogEntry>,
    scroll: usize,
}

impl ChatLog {
    pub fn new(username: impl Into<String>, room: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            room: room.into(),
            connection_id: None,
            entries: Vec::new(),
            scroll: 0,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn set_connection_id(&mut self, id: impl Into<ConnectionId>) {
        self.connection_id = Some(id.into());
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Index of the entry the view is scrolled to (always the newest after a receive).
    pub fn scroll_position(&self) -> usize {
        self.scroll
    }

    /// The `join` frame this client sends on connect.
    pub fn join_frame(&self) -> ClientFrame {
        ClientFrame::Join(crate::gateway::JoinParams {
            username: self.username.clone(),
            room: Some(self.room.clone()),
        })
    }

    /// Own when the sender id matches ours; without ids, fall back to the `"<username>:"` prefix.
    pub fn classify(&self, payload: &MessagePayload) -> EntryStyle {
        let own = match (&self.connection_id, &payload.sender_id) {
            (Some(mine), Some(sender)) => mine == sender,
            _ => payload.msg.starts_with(&format!("{}:", self.username)),
        };
        if own {
            EntryStyle::Own
        } else {
            EntryStyle::Peer
        }
    }

    /// Handle a server frame. `hello` records the connection id; `message` is appended,
    /// styled, and scrolled to. Returns the new entry, if any.
    pub fn receive(&mut self, frame: &ServerFrame) -> Option<&LogEntry> {
        match frame {
            ServerFrame::Hello(hello) => {
                self.connection_id = Some(hello.connection_id.clone());
                None
            }
            ServerFrame::Message(payload) => {
                let entry = LogEntry {
                    display_time: Local::now().format("%H:%M:%S").to_string(),
                    text: payload.msg.clone(),
                    style: self.classify(payload),
                };
                self.entries.push(entry);
                self.scroll = self.entries.len() - 1;
                self.entries.last()
            }
            ServerFrame::Shutdown => None,
        }
    }

    /// Submit the input box. Blank input sends nothing and is left as is; otherwise the
    /// input is cleared and a `message` frame is returned.
    pub fn submit(&self, input: &mut String) -> Option<ClientFrame> {
        let msg = input.trim();
        if msg.is_empty() {
            return None;
        }
        let frame = ClientFrame::Message(MessageParams {
            username: Some(self.username.clone()),
            room: Some(self.room.clone()),
            msg: msg.to_string(),
        });
        input.clear();
        Some(frame)
    }
}
