//! Connection handshake: one JSON line sent by the dialing side before any
//! codec frame.

use crate::codec::JSON_CODEC;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Identifies the frpc protocol ("FRPC" in ASCII).
pub const MAGIC_NUMBER: u32 = 0x4652_5043;

/// Upper bound on the handshake line, newline included.
pub const MAX_HANDSHAKE_LEN: usize = 4096;

/// Negotiation payload exchanged once per connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub magic_number: u32,
    /// Tag resolved through a [`CodecRegistry`](crate::CodecRegistry)
    pub codec_type: String,
}

impl Handshake {
    pub fn new(codec_type: impl Into<String>) -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec_type: codec_type.into(),
        }
    }

    /// Check the magic number. Codec resolution is left to the receiver's registry.
    pub fn validate(&self) -> Result<(), HandshakeError> {
        if self.magic_number != MAGIC_NUMBER {
            return Err(HandshakeError::BadMagic(self.magic_number));
        }
        Ok(())
    }
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new(JSON_CODEC)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("invalid magic number {0:#x}")]
    BadMagic(u32),

    #[error("unsupported codec type {0:?}")]
    UnsupportedCodec(String),

    #[error("connection closed before handshake completed")]
    Closed,

    #[error("handshake exceeds {MAX_HANDSHAKE_LEN} bytes")]
    TooLarge,

    #[error("malformed handshake: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("handshake io error: {0}")]
    Io(#[from] std::io::Error),
}

pub async fn write_handshake<W>(writer: &mut W, handshake: &Handshake) -> Result<(), HandshakeError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut line = serde_json::to_vec(handshake)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one handshake line.
///
/// Never consumes past the terminating newline, so the same reader can be
/// handed to the negotiated codec afterwards.
pub async fn read_handshake<R>(reader: &mut R) -> Result<Handshake, HandshakeError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut line = Vec::new();
    let n = (&mut *reader)
        .take(MAX_HANDSHAKE_LEN as u64)
        .read_until(b'\n', &mut line)
        .await?;

    if n == 0 {
        return Err(HandshakeError::Closed);
    }
    if line.last() != Some(&b'\n') {
        return Err(if n >= MAX_HANDSHAKE_LEN {
            HandshakeError::TooLarge
        } else {
            HandshakeError::Closed
        });
    }

    Ok(serde_json::from_slice(&line)?)
}
