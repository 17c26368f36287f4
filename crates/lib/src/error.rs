//! Errors raised by the relay core.
//!
//! None of these cross a connection boundary: the gateway logs them and keeps the
//! connection open.

use crate::registry::ConnectionId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("connection not registered: {0}")]
    NotRegistered(ConnectionId),
    #[error("room name must not be empty")]
    EmptyRoomName,
    #[error("username must not be empty")]
    EmptyUsername,
}
