//! Length-prefixed JSON frames.
//!
//! ```text
//! [4 bytes] frame length (big-endian u32, at most MAX_FRAME_LEN)
//! [N bytes] JSON value
//! ```
//!
//! A message is a header frame followed by a body frame.

use super::{BoxedRead, BoxedWrite, Codec, CodecError, CodecReader, CodecWriter, MAX_FRAME_LEN};
use crate::protocol::{Header, Payload};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::warn;

/// Constructor registered under [`LENGTH_JSON_CODEC`](super::LENGTH_JSON_CODEC).
pub fn length_json_codec(read: BoxedRead, write: BoxedWrite) -> Codec {
    Codec {
        reader: Box::new(LengthJsonReader::new(read)),
        writer: Box::new(LengthJsonWriter::new(write)),
    }
}

pub struct LengthJsonReader {
    reader: BoxedRead,
    buf: Vec<u8>,
}

impl LengthJsonReader {
    pub fn new(reader: BoxedRead) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }

    async fn next_frame(&mut self) -> Result<&[u8], CodecError> {
        let len = self
            .reader
            .read_u32()
            .await
            .map_err(CodecError::from_read)?;
        if len > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge(u64::from(len)));
        }

        self.buf.resize(len as usize, 0);
        self.reader
            .read_exact(&mut self.buf)
            .await
            .map_err(CodecError::from_read)?;
        Ok(&self.buf)
    }
}

#[async_trait]
impl CodecReader for LengthJsonReader {
    async fn read_header(&mut self) -> Result<Header, CodecError> {
        let frame = self.next_frame().await?;
        serde_json::from_slice(frame).map_err(CodecError::Decode)
    }

    async fn read_body(&mut self) -> Result<Payload, CodecError> {
        let frame = self.next_frame().await?;
        serde_json::from_slice(frame).map_err(CodecError::Decode)
    }
}

pub struct LengthJsonWriter {
    writer: BufWriter<BoxedWrite>,
    closed: bool,
}

impl LengthJsonWriter {
    pub fn new(writer: BoxedWrite) -> Self {
        Self {
            writer: BufWriter::new(writer),
            closed: false,
        }
    }

    fn push_frame(buf: &mut Vec<u8>, frame: &[u8]) -> Result<(), CodecError> {
        let len = u32::try_from(frame.len())
            .ok()
            .filter(|len| *len <= MAX_FRAME_LEN)
            .ok_or(CodecError::FrameTooLarge(frame.len() as u64))?;
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(frame);
        Ok(())
    }

    async fn write_frame(&mut self, header: &Header, body: &Payload) -> Result<(), CodecError> {
        let header = serde_json::to_vec(header).map_err(CodecError::Encode)?;
        let body = serde_json::to_vec(body).map_err(CodecError::Encode)?;

        let mut buf = Vec::with_capacity(8 + header.len() + body.len());
        Self::push_frame(&mut buf, &header)?;
        Self::push_frame(&mut buf, &body)?;

        self.writer.write_all(&buf).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl CodecWriter for LengthJsonWriter {
    async fn write(&mut self, header: &Header, body: &Payload) -> Result<(), CodecError> {
        if self.closed {
            return Err(CodecError::WriterClosed);
        }
        let result = self.write_frame(header, body).await;
        if let Err(e) = &result {
            warn!(seq = header.seq, "length codec write failed, closing stream: {}", e);
            self.closed = true;
            let _ = self.writer.shutdown().await;
        }
        result
    }

    async fn close(&mut self) -> Result<(), CodecError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (a, b) = tokio::io::duplex(4096);
        let mut writer = LengthJsonWriter::new(Box::new(a));
        let mut reader = LengthJsonReader::new(Box::new(BufReader::new(b)));

        writer
            .write(&Header::request("Arith.Sum", 9), &json!({"a": 1, "b": 2}))
            .await
            .unwrap();
        writer.close().await.unwrap();

        let header = reader.read_header().await.unwrap();
        assert_eq!(header.service_method, "Arith.Sum");
        assert_eq!(header.seq, 9);
        assert_eq!(reader.read_body().await.unwrap(), json!({"a": 1, "b": 2}));
        assert!(reader.read_header().await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let input = (MAX_FRAME_LEN + 1).to_be_bytes();
        let mut reader = LengthJsonReader::new(Box::new(BufReader::new(std::io::Cursor::new(input))));
        let err = reader.read_header().await.unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge(_)));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_bad_frame_is_recoverable() {
        let mut input = Vec::new();
        LengthJsonWriter::push_frame(&mut input, b"{not json").unwrap();
        LengthJsonWriter::push_frame(&mut input, b"42").unwrap();
        let mut reader = LengthJsonReader::new(Box::new(BufReader::new(std::io::Cursor::new(input))));

        assert!(reader.read_body().await.unwrap_err().is_recoverable());
        assert_eq!(reader.read_body().await.unwrap(), json!(42));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_closed() {
        let mut input = 10u32.to_be_bytes().to_vec();
        input.extend_from_slice(b"{}");
        let mut reader = LengthJsonReader::new(Box::new(BufReader::new(std::io::Cursor::new(input))));
        assert!(reader.read_body().await.unwrap_err().is_closed());
    }
}
