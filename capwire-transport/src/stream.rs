// NDJSON transport over any ordered byte stream (TCP, Unix sockets, pipes).
// The framed stream is split so reads and writes can proceed from separate
// kernel tasks; each half is serialized behind its own async lock.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::Framed;

use async_trait::async_trait;
use capwire_core::protocol::Message;
use capwire_core::transport::{RpcTransport, TransportError};

use crate::ndjson::{CodecError, NdjsonCodec};

type FramedStream<T> = Framed<T, NdjsonCodec>;

/// A byte-stream transport speaking NDJSON frames.
pub struct StreamTransport<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> {
    writer: Mutex<SplitSink<FramedStream<T>, Message>>,
    reader: Mutex<SplitStream<FramedStream<T>>>,
}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> StreamTransport<T> {
    pub fn new(io: T) -> Self {
        Self::with_codec(io, NdjsonCodec::new())
    }

    pub fn with_codec(io: T, codec: NdjsonCodec) -> Self {
        let (writer, reader) = Framed::new(io, codec).split();
        Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        }
    }
}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> std::fmt::Debug for StreamTransport<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport").finish()
    }
}

fn map_codec_error(error: CodecError) -> TransportError {
    match error {
        CodecError::Io(e) => TransportError::Io(e),
        other => TransportError::Codec(other.to_string()),
    }
}

#[async_trait]
impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> RpcTransport for StreamTransport<T> {
    async fn send(&self, message: Message) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        writer.send(message).await.map_err(map_codec_error)
    }

    async fn send_batch(&self, messages: Vec<Message>) -> Result<(), TransportError> {
        // Feed every frame, flush once: the whole batch leaves in one write
        // when the OS allows it.
        let mut writer = self.writer.lock().await;
        for message in messages {
            writer.feed(message).await.map_err(map_codec_error)?;
        }
        writer.flush().await.map_err(map_codec_error)
    }

    fn supports_batching(&self) -> bool {
        true
    }

    async fn recv(&self) -> Result<Option<Message>, TransportError> {
        let mut reader = self.reader.lock().await;
        match reader.next().await {
            None => Ok(None),
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(error)) => Err(map_codec_error(error)),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        writer.close().await.map_err(map_codec_error)
    }
}
