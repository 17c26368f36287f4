//! Gateway: HTTP + WebSocket front of the relay.
//!
//! Single port serves HTTP and WebSocket. The server sends `hello` first; clients then
//! send `join`, `message` and `leave` events and receive `message` and `shutdown` events.

mod protocol;
mod server;

pub use protocol::{
    ClientFrame, EventFrame, HelloPayload, JoinParams, MessageParams, MessagePayload, ServerFrame,
    PROTOCOL_VERSION,
};
pub use server::{router, run_gateway, GatewayState};
