//! Pluggable header/body encodings.
//!
//! A codec is built from the two halves of a connection and split into a
//! [`CodecReader`] and a [`CodecWriter`], so one task can keep reading while
//! others write. Codecs are selected at handshake time by a string tag looked
//! up in a [`CodecRegistry`].
//!
//! Every codec must:
//! - decode exactly one header, then exactly one body, per message;
//! - consume a whole body frame in [`CodecReader::read_body`] whatever type the
//!   caller eventually wants, so framing stays aligned after a bad body;
//! - flush header and body together in [`CodecWriter::write`], and shut the
//!   stream down if that write fails.

mod json;
mod length;

pub use json::{json_codec, JsonReader, JsonWriter};
pub use length::{length_json_codec, LengthJsonReader, LengthJsonWriter};

use crate::protocol::{Header, Payload};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncWrite};

/// Reference codec: newline-delimited, self-describing JSON values.
pub const JSON_CODEC: &str = "application/json";

/// JSON values behind a 4-byte big-endian length prefix.
pub const LENGTH_JSON_CODEC: &str = "application/x-length-json";

/// Largest single header or body frame accepted by the bundled codecs: 16 MiB
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

pub type BoxedRead = Box<dyn AsyncBufRead + Send + Unpin>;
pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

#[async_trait]
pub trait CodecReader: Send {
    async fn read_header(&mut self) -> Result<Header, CodecError>;

    async fn read_body(&mut self) -> Result<Payload, CodecError>;
}

#[async_trait]
pub trait CodecWriter: Send {
    /// Write `header` followed by `body` as one unit and flush.
    async fn write(&mut self, header: &Header, body: &Payload) -> Result<(), CodecError>;

    /// Shut down the write half of the stream. Later writes fail.
    async fn close(&mut self) -> Result<(), CodecError>;
}

/// Both halves of a negotiated codec.
pub struct Codec {
    pub reader: Box<dyn CodecReader>,
    pub writer: Box<dyn CodecWriter>,
}

pub type CodecFactory = Arc<dyn Fn(BoxedRead, BoxedWrite) -> Codec + Send + Sync>;

/// Maps codec tags to constructors.
///
/// `CodecRegistry::default()` knows [`JSON_CODEC`] and [`LENGTH_JSON_CODEC`].
/// Extra tags can be registered before the registry is handed to a server or
/// client.
#[derive(Clone)]
pub struct CodecRegistry {
    factories: HashMap<String, CodecFactory>,
}

impl CodecRegistry {
    /// A registry with no codecs at all.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register `factory` under `tag`, replacing any previous entry.
    pub fn register<F>(&mut self, tag: impl Into<String>, factory: F)
    where
        F: Fn(BoxedRead, BoxedWrite) -> Codec + Send + Sync + 'static,
    {
        self.factories.insert(tag.into(), Arc::new(factory));
    }

    pub fn get(&self, tag: &str) -> Option<CodecFactory> {
        self.factories.get(tag).cloned()
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.factories.contains_key(tag)
    }

    /// Registered tags, sorted.
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    /// Build the codec registered under `tag`, if any.
    pub fn build(&self, tag: &str, read: BoxedRead, write: BoxedWrite) -> Option<Codec> {
        self.factories.get(tag).map(|factory| factory(read, write))
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(JSON_CODEC, json_codec);
        registry.register(LENGTH_JSON_CODEC, length_json_codec);
        registry
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("tags", &self.tags())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("connection closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(serde_json::Error),

    #[error("decode error: {0}")]
    Decode(serde_json::Error),

    #[error("frame of {0} bytes exceeds limit of {MAX_FRAME_LEN} bytes")]
    FrameTooLarge(u64),

    #[error("writer already closed")]
    WriterClosed,
}

impl CodecError {
    /// Map a read-side io error, treating a truncated stream as closed.
    pub(crate) fn from_read(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            CodecError::Closed
        } else {
            CodecError::Io(err)
        }
    }

    /// True when the offending frame was consumed whole and the stream can
    /// still be read.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CodecError::Decode(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, CodecError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_tags() {
        let registry = CodecRegistry::default();
        assert_eq!(registry.tags(), vec![JSON_CODEC, LENGTH_JSON_CODEC]);
        assert!(registry.contains(JSON_CODEC));
        assert!(registry.get("application/gob").is_none());
    }

    #[test]
    fn test_register_custom_tag() {
        let mut registry = CodecRegistry::empty();
        assert!(registry.tags().is_empty());

        registry.register("application/x-custom", json_codec);
        assert!(registry.contains("application/x-custom"));
        assert!(!registry.contains(JSON_CODEC));
    }

    #[test]
    fn test_recoverable_errors() {
        let decode = serde_json::from_str::<Header>("{").unwrap_err();
        assert!(CodecError::Decode(decode).is_recoverable());
        assert!(!CodecError::Closed.is_recoverable());
        assert!(!CodecError::FrameTooLarge(u64::MAX).is_recoverable());

        let eof = std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
        assert!(CodecError::from_read(eof).is_closed());
    }
}
