use super::{BoxedRead, BoxedWrite, Codec, CodecError, CodecReader, CodecWriter, MAX_FRAME_LEN};
use crate::protocol::{Header, Payload};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::warn;

/// Constructor registered under [`JSON_CODEC`](super::JSON_CODEC).
pub fn json_codec(read: BoxedRead, write: BoxedWrite) -> Codec {
    Codec {
        reader: Box::new(JsonReader::new(read)),
        writer: Box::new(JsonWriter::new(write)),
    }
}

/// Reads one JSON value per line.
pub struct JsonReader {
    reader: BoxedRead,
    buf: Vec<u8>,
}

impl JsonReader {
    pub fn new(reader: BoxedRead) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }

    async fn next_line(&mut self) -> Result<&[u8], CodecError> {
        self.buf.clear();
        let limit = u64::from(MAX_FRAME_LEN) + 1;
        let n = (&mut self.reader)
            .take(limit)
            .read_until(b'\n', &mut self.buf)
            .await
            .map_err(CodecError::from_read)?;

        if n == 0 {
            return Err(CodecError::Closed);
        }
        if self.buf.last() != Some(&b'\n') {
            if n as u64 >= limit {
                return Err(CodecError::FrameTooLarge(n as u64));
            }
            // EOF in the middle of a line
            return Err(CodecError::Closed);
        }
        Ok(&self.buf)
    }
}

#[async_trait]
impl CodecReader for JsonReader {
    async fn read_header(&mut self) -> Result<Header, CodecError> {
        let line = self.next_line().await?;
        serde_json::from_slice(line).map_err(CodecError::Decode)
    }

    async fn read_body(&mut self) -> Result<Payload, CodecError> {
        let line = self.next_line().await?;
        serde_json::from_slice(line).map_err(CodecError::Decode)
    }
}

/// Writes header and body as two JSON lines, flushed together.
pub struct JsonWriter {
    writer: BufWriter<BoxedWrite>,
    closed: bool,
}

impl JsonWriter {
    pub fn new(writer: BoxedWrite) -> Self {
        Self {
            writer: BufWriter::new(writer),
            closed: false,
        }
    }

    async fn write_frame(&mut self, header: &Header, body: &Payload) -> Result<(), CodecError> {
        let mut buf = serde_json::to_vec(header).map_err(CodecError::Encode)?;
        buf.push(b'\n');
        serde_json::to_writer(&mut buf, body).map_err(CodecError::Encode)?;
        buf.push(b'\n');

        self.writer.write_all(&buf).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl CodecWriter for JsonWriter {
    async fn write(&mut self, header: &Header, body: &Payload) -> Result<(), CodecError> {
        if self.closed {
            return Err(CodecError::WriterClosed);
        }
        let result = self.write_frame(header, body).await;
        if let Err(e) = &result {
            warn!(seq = header.seq, "json codec write failed, closing stream: {}", e);
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
