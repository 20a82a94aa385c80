//! Loading, environment overrides and validation.

use crate::components::{ClientConfig, ServerConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Overrides `server.listen_addr`
pub const ENV_LISTEN_ADDR: &str = "FRPC_LISTEN_ADDR";
/// Overrides `client.server_addr`
pub const ENV_SERVER_ADDR: &str = "FRPC_SERVER_ADDR";
/// Overrides `client.codec`
pub const ENV_CODEC: &str = "FRPC_CODEC";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: String, value: String },
}

/// Top-level configuration
///
/// ```toml
/// [server]
/// listen_addr = "0.0.0.0:9999"
/// handle_timeout_ms = 2000
///
/// [client]
/// server_addr = "10.0.0.5:9999"
/// codec = "application/x-length-json"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrpcConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl FrpcConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml_str(&contents)?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Apply `FRPC_*` environment variables on top of the current values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var(ENV_LISTEN_ADDR) {
            debug!("{} overrides server.listen_addr", ENV_LISTEN_ADDR);
            self.server.listen_addr = addr;
        }
        if let Ok(addr) = std::env::var(ENV_SERVER_ADDR) {
            debug!("{} overrides client.server_addr", ENV_SERVER_ADDR);
            self.client.server_addr = addr;
        }
        if let Ok(codec) = std::env::var(ENV_CODEC) {
            debug!("{} overrides client.codec", ENV_CODEC);
            self.client.codec = codec;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("server.listen_addr", &self.server.listen_addr),
            ("client.server_addr", &self.client.server_addr),
            ("client.codec", &self.client.codec),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: "must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }
}
