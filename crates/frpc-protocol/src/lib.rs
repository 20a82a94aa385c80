//! Shared wire types for frpc connections.
//!
//! A connection starts with a [`Handshake`] line naming the protocol magic and
//! a codec tag. After that, both directions carry `Header` + body pairs
//! encoded by the negotiated [`codec`].

pub mod codec;
mod handshake;
mod protocol;

pub use codec::{
    BoxedRead, BoxedWrite, Codec, CodecError, CodecFactory, CodecReader, CodecRegistry,
    CodecWriter, JSON_CODEC, LENGTH_JSON_CODEC, MAX_FRAME_LEN,
};
pub use handshake::{
    read_handshake, write_handshake, Handshake, HandshakeError, MAGIC_NUMBER, MAX_HANDSHAKE_LEN,
};
pub use protocol::{ErrorCode, Header, Payload, RemoteError, Status};
