use tokio::io::{split, AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tracing::trace;

use crate::errors::{ProtoError, Result};
use crate::frame::{FrameReader, FrameWriter, MAX_FRAME_BYTES};
use crate::message::Message;

/// Message-level view of a byte stream
pub struct FramedConnection<S> {
    reader: FrameReader<ReadHalf<S>>,
    writer: FrameWriter<WriteHalf<S>>,
}

impl<S> FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Send,
{
    pub fn new(stream: S) -> Self {
        Self::with_limit(stream, MAX_FRAME_BYTES)
    }

    pub fn with_limit(stream: S, max_frame_bytes: usize) -> Self {
        let (r, w) = split(stream);
        Self {
            reader: FrameReader::new(r, max_frame_bytes),
            writer: FrameWriter::new(w, max_frame_bytes),
        }
    }

    pub async fn send(&mut self, message: &Message) -> Result<()> {
        trace!("-> {}", message.kind());
        let payload = message.encode()?;
        self.writer.write_frame(&payload).await?;
        Ok(())
    }

    /// Next message, or `None` once the peer closed the stream
    pub async fn recv_optional(&mut self) -> Result<Option<Message>> {
        match self.reader.read_next().await? {
            Some(payload) => {
                let message = Message::decode(&payload)?;
                trace!("<- {}", message.kind());
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    /// Next message; a closed stream is an error. A peer `Error` message is surfaced as `Remote`.
    pub async fn recv(&mut self) -> Result<Message> {
        match self.recv_optional().await? {
            Some(Message::Error { message }) => Err(ProtoError::Remote(message)),
            Some(message) => Ok(message),
            None => Err(ProtoError::ConnectionClosed),
        }
    }

    pub async fn request(&mut self, message: &Message) -> Result<Message> {
        self.send(message).await?;
        self.recv().await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.send(&Message::Goodbye).await?;
        self.writer.shutdown().await
    }
}
