//! Server and client sections of the configuration.

use frpc_protocol::JSON_CODEC;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Server component configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP address the server listens on
    pub listen_addr: String,
    /// How long a new connection has to send its handshake
    pub handshake_timeout_ms: u64,
    /// Per-request handler deadline; 0 disables it
    pub handle_timeout_ms: u64,
}

/// Client component configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_addr: String,
    /// Codec tag sent in the handshake
    pub codec: String,
    /// 0 disables the dial deadline
    pub connect_timeout_ms: u64,
}

fn optional_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl ServerConfig {
    pub fn handshake_timeout(&self) -> Option<Duration> {
        optional_millis(self.handshake_timeout_ms)
    }

    pub fn handle_timeout(&self) -> Option<Duration> {
        optional_millis(self.handle_timeout_ms)
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        optional_millis(self.connect_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9999".to_string(),
            handshake_timeout_ms: 5_000,
            handle_timeout_ms: 0,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:9999".to_string(),
            codec: JSON_CODEC.to_string(),
            connect_timeout_ms: 10_000,
        }
    }
}
