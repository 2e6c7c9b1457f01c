// In-process transport pair, used by tests and examples to wire two
// sessions (or a session and a hand-driven peer) back to back. Batches are
// delivered atomically, so flush-as-one-write behavior is observable.

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use capwire_core::protocol::Message;
use capwire_core::transport::{RpcTransport, TransportError};

/// One end of an in-process duplex channel.
pub struct MemoryTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<Message>>>>,
    rx: Mutex<Receiver>,
}

struct Receiver {
    channel: mpsc::UnboundedReceiver<Vec<Message>>,
    buffered: VecDeque<Message>,
}

/// Two transports wired back to back: what one sends, the other receives.
pub fn pair() -> (MemoryTransport, MemoryTransport) {
    let (tx_a, rx_a) = mpsc::unbounded_channel();
    let (tx_b, rx_b) = mpsc::unbounded_channel();
    (
        MemoryTransport::new(tx_a, rx_b),
        MemoryTransport::new(tx_b, rx_a),
    )
}

impl MemoryTransport {
    fn new(
        tx: mpsc::UnboundedSender<Vec<Message>>,
        rx: mpsc::UnboundedReceiver<Vec<Message>>,
    ) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Receiver {
                channel: rx,
                buffered: VecDeque::new(),
            }),
        }
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport").finish()
    }
}

#[async_trait]
impl RpcTransport for MemoryTransport {
    async fn send(&self, message: Message) -> Result<(), TransportError> {
        self.send_batch(vec![message]).await
    }

    async fn send_batch(&self, messages: Vec<Message>) -> Result<(), TransportError> {
        eprintln!("DEBUG memory send_batch n={}", messages.len());
        let guard = self.tx.lock().await;
        let tx = guard.as_ref().ok_or(TransportError::ConnectionClosed)?;
        let r = tx.send(messages)
            .map_err(|_| TransportError::ConnectionClosed);
        eprintln!("DEBUG memory send_batch done ok={}", r.is_ok());
        r
    }

    fn supports_batching(&self) -> bool {
        true
    }

    async fn recv(&self) -> Result<Option<Message>, TransportError> {
        eprintln!("DEBUG memory recv called");
        let mut rx = self.rx.lock().await;
        loop {
            if let Some(message) = rx.buffered.pop_front() {
                eprintln!("DEBUG memory recv returning buffered msg");
                return Ok(Some(message));
            }
            match rx.channel.recv().await {
                None => { eprintln!("DEBUG memory recv channel closed"); return Ok(None) },
                Some(batch) => { eprintln!("DEBUG memory recv got batch n={}", batch.len()); rx.buffered.extend(batch) },
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.tx.lock().await.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capwire_core::protocol::ImportId;

    #[tokio::test]
    async fn pair_delivers_in_order() {
        let (a, b) = pair();
        a.send(Message::Pull(ImportId(1))).await.unwrap();
        a.send_batch(vec![Message::Pull(ImportId(2)), Message::Pull(ImportId(3))])
            .await
            .unwrap();

        for expected in 1..=3 {
            assert_eq!(
                b.recv().await.unwrap(),
                Some(Message::Pull(ImportId(expected)))
            );
        }
    }

    #[tokio::test]
    async fn close_signals_end_of_stream() {
        let (a, b) = pair();
        a.close().await.unwrap();
        assert_eq!(b.recv().await.unwrap(), None);
        assert!(matches!(
            a.send(Message::Pull(ImportId(1))).await,
            Err(TransportError::ConnectionClosed)
        ));
    }
}
