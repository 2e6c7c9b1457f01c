// The session kernel's only view of the outside world: an ordered,
// reliable, bidirectional stream of protocol messages. Concrete adapters
// (byte streams, HTTP batches, in-process pairs) live outside the core.

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::message::Message;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// One attached transport. Both directions must be FIFO and reliable within
/// a session; loss or reordering is grounds for an abort. The contract is
/// symmetric, so a bidirectional adapter carries peer-initiated calls in
/// either direction for free.
///
/// Methods take `&self`: the kernel drives reads and writes from separate
/// tasks, and implementations serialize each direction internally.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn send(&self, message: Message) -> Result<(), TransportError>;

    /// Write a group of messages as one unit. Adapters that can frame a
    /// whole batch in a single write override this together with
    /// `supports_batching`.
    async fn send_batch(&self, messages: Vec<Message>) -> Result<(), TransportError> {
        for message in messages {
            self.send(message).await?;
        }
        Ok(())
    }

    fn supports_batching(&self) -> bool {
        false
    }

    /// Receive the next frame. `Ok(None)` means the peer closed cleanly.
    async fn recv(&self) -> Result<Option<Message>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}
