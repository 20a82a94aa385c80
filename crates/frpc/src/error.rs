//! Error types for the client and server engines.

use frpc_protocol::{CodecError, HandshakeError, RemoteError};
use std::time::Duration;

pub use crate::service::{LookupError, RegistryError};

/// Why a call failed, as seen by the caller.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("frpc: client is shut down")]
    Shutdown,

    #[error("completion channel must be buffered")]
    UnbufferedChannel,

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("failed to encode arguments: {0}")]
    EncodeArgs(serde_json::Error),

    #[error("failed to decode reply: {0}")]
    DecodeReply(serde_json::Error),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("call timeout: expect within {0:?}")]
    CallTimeout(Duration),

    #[error("connect timeout: expect within {0:?}")]
    ConnectTimeout(Duration),

    #[error("failed to connect: {0}")]
    Connect(std::io::Error),
}

impl ClientError {
    pub fn is_shutdown(&self) -> bool {
        matches!(self, ClientError::Shutdown)
    }

    /// The server-side error, if the call reached a handler or the registry.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            ClientError::Remote(err) => Some(err),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("handshake not received within {0:?}")]
    HandshakeTimeout(Duration),
}
