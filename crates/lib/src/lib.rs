//! Relay core library: connection registry, room broadcaster, session gateway, and the
//! client-side chat log used by the CLI.

pub mod config;
pub mod error;
pub mod gateway;
pub mod init;
pub mod registry;
pub mod renderer;
pub mod room;
pub mod session;
