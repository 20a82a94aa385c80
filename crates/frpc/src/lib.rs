//! frpc: a small multiplexing RPC runtime.
//!
//! - [`Server`] accepts connections, reads the [`Handshake`], then dispatches
//!   each request to a handler registered through [`Service::builder`].
//! - [`Client`] multiplexes concurrent calls over one connection and matches
//!   responses to callers by sequence number.
//!
//! Wire types and codecs live in `frpc-protocol` and are re-exported here.

pub mod client;
pub mod error;
pub mod server;
pub mod service;

pub use client::{Call, Client};
pub use error::{ClientError, LookupError, RegistryError, ServerError};
pub use server::Server;
pub use service::{is_exported, MethodType, Service, ServiceBuilder, ServiceRegistry};

pub use frpc_config::{ClientConfig, ServerConfig};
pub use frpc_protocol::{
    CodecRegistry, ErrorCode, Handshake, Header, Payload, RemoteError, Status, JSON_CODEC,
    LENGTH_JSON_CODEC, MAGIC_NUMBER,
};
