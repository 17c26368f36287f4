//! Gateway WebSocket protocol types (join, message, leave, hello, shutdown).

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;

use crate::registry::ConnectionId;
use crate::room::ChatMessage;

pub const PROTOCOL_VERSION: u32 = 1;

const FRAME_TYPE_EVENT: &str = "event";

/// Wire frame: `{ "type": "event", "event", "payload" }`. Used in both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    #[serde(rename = "type")]
    pub typ: String,
    pub event: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            typ: FRAME_TYPE_EVENT.to_string(),
            event: event.into(),
            payload,
        }
    }

    /// Parse a text frame; rejects anything that is not `type: "event"`.
    pub fn parse(text: &str) -> Result<Self, String> {
        let frame: EventFrame =
            serde_json::from_str(text).map_err(|e| format!("invalid frame: {}", e))?;
        if frame.typ != FRAME_TYPE_EVENT {
            return Err(format!("unsupported frame type: {}", frame.typ));
        }
        Ok(frame)
    }

    fn payload_as<T: DeserializeOwned>(&self) -> Result<T, String> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| format!("invalid {} payload: {}", self.event, e))
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"type":"event","event":"{}","payload":{{}}}}"#, self.event)
        })
    }
}

/// Payload of client `join`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinParams {
    pub username: String,
    /// Omitted room means the configured default room.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
}

/// Payload of client `message`. Username and room are informational; the session's bound values win.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    pub msg: String,
}

/// Client to server events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Join(JoinParams),
    Message(MessageParams),
    Leave,
}

impl ClientFrame {
    /// Parse a text frame into a client event. Errors describe the protocol violation.
    pub fn parse(text: &str) -> Result<Self, String> {
        let frame = EventFrame::parse(text)?;
        match frame.event.as_str() {
            "join" => Ok(ClientFrame::Join(frame.payload_as()?)),
            "message" => Ok(ClientFrame::Message(frame.payload_as()?)),
            "leave" => Ok(ClientFrame::Leave),
            other => Err(format!("unknown event: {}", other)),
        }
    }

    pub fn to_frame(&self) -> EventFrame {
        match self {
            ClientFrame::Join(p) => {
                EventFrame::new("join", serde_json::to_value(p).unwrap_or(json!({})))
            }
            ClientFrame::Message(p) => {
                EventFrame::new("message", serde_json::to_value(p).unwrap_or(json!({})))
            }
            ClientFrame::Leave => EventFrame::new("leave", json!({})),
        }
    }

    pub fn to_text(&self) -> String {
        self.to_frame().to_text()
    }
}

/// Server hello payload, sent once right after the upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    pub connection_id: ConnectionId,
    pub protocol: u32,
}

/// Server `message` payload. `msg` is the prefixed display form `"<username>: <body>"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub msg: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default)]
    pub sender_id: Option<ConnectionId>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl From<&ChatMessage> for MessagePayload {
    fn from(m: &ChatMessage) -> Self {
        Self {
            msg: m.display_text(),
            username: Some(m.username.clone()),
            room: Some(m.room.clone()),
            sender_id: Some(m.sender_id.clone()),
            timestamp: Some(m.timestamp),
        }
    }
}

/// Server to client events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    Hello(HelloPayload),
    Message(MessagePayload),
    Shutdown,
}

impl ServerFrame {
    pub fn parse(text: &str) -> Result<Self, String> {
        let frame = EventFrame::parse(text)?;
        match frame.event.as_str() {
            "hello" => Ok(ServerFrame::Hello(frame.payload_as()?)),
            "message" => Ok(ServerFrame::Message(frame.payload_as()?)),
            "shutdown" => Ok(ServerFrame::Shutdown),
            other => Err(format!("unknown event: {}", other)),
        }
    }

    pub fn to_frame(&self) -> EventFrame {
        match self {
            ServerFrame::Hello(p) => {
                EventFrame::new("hello", serde_json::to_value(p).unwrap_or(json!({})))
            }
            ServerFrame::Message(p) => {
                EventFrame::new("message", serde_json::to_value(p).unwrap_or(json!({})))
            }
            ServerFrame::Shutdown => EventFrame::new("shutdown", json!({})),
        }
    }

    pub fn to_text(&self) -> String {
        self.to_frame().to_text()
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, ServerFrame::Shutdown)
    }
}
