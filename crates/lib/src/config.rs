//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.relay/config.json`). A missing file means defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Room and delivery settings.
    #[serde(default)]
    pub relay: RelayConfig,
}

/// Gateway bind and port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP and WebSocket (default 15152).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
}

fn default_gateway_port() -> u16 {
    15152
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
        }
    }
}

/// Relay behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    /// Room used when a join names none.
    #[serde(default = "default_room")]
    pub default_room: String,

    /// Per-connection outbox capacity. A member whose outbox is full during a broadcast is disconnected.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,

    /// Close connections that send nothing for this many seconds. Unset = never.
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
}

fn default_room() -> String {
    "default".to_string()
}

fn default_outbound_buffer() -> usize {
    64
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            default_room: default_room(),
            outbound_buffer: default_outbound_buffer(),
            idle_timeout_secs: None,
        }
    }
}

impl Config {
    /// Reject settings the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.relay.default_room.trim().is_empty() {
            anyhow::bail!("relay.defaultRoom must not be empty");
        }
        if self.relay.outbound_buffer == 0 {
            anyhow::bail!("relay.outboundBuffer must be at least 1");
        }
        Ok(())
    }
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("RELAY_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".relay").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path, or the default path (or RELAY_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    config
        .validate()
        .with_context(|| format!("invalid config in {}", path.display()))?;
    Ok((config, path))
}
