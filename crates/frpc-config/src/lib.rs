//! # frpc Configuration
//!
//! Explicit configuration structs for frpc servers and clients. Nothing here
//! is global: callers build a [`FrpcConfig`] (defaults, a TOML file, env
//! overrides) and pass the relevant section to a constructor.
//!
//! ```rust,no_run
//! use frpc_config::FrpcConfig;
//!
//! let mut config = FrpcConfig::load("frpc.toml")?;
//! config.apply_env_overrides();
//! config.validate()?;
//! # Ok::<(), frpc_config::ConfigError>(())
//! ```

#![warn(clippy::all)]

mod components;
mod loader;

pub use components::{ClientConfig, ServerConfig};
pub use loader::{ConfigError, FrpcConfig, ENV_CODEC, ENV_LISTEN_ADDR, ENV_SERVER_ADDR};
