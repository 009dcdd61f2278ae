//! Ordered, unbounded message channel between orchestrator and engine worker.

use tokio::sync::mpsc;

use crate::error::{Result, SliceError};
use crate::protocol::Envelope;

/// Sending half. Cheap to clone; messages from one sender arrive in send order.
#[derive(Debug, Clone)]
pub struct TransportSender {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl TransportSender {
    /// Fire-and-forget send. Fails only when the peer has gone away.
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        self.tx
            .send(envelope)
            .map_err(|_| SliceError::EngineSessionClosed)
    }

    /// Whether the receiving side has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half.
#[derive(Debug)]
pub struct TransportReceiver {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl TransportReceiver {
    /// Next envelope, or `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Blocking receive for use on the engine worker thread.
    pub fn blocking_recv(&mut self) -> Option<Envelope> {
        self.rx.blocking_recv()
    }
}

/// One side of a bidirectional channel.
#[derive(Debug)]
pub struct Endpoint {
    sender: TransportSender,
    receiver: TransportReceiver,
}

impl Endpoint {
    /// Split into independent halves.
    pub fn split(self) -> (TransportSender, TransportReceiver) {
        (self.sender, self.receiver)
    }
}

/// Create a connected pair of endpoints.
pub fn channel() -> (Endpoint, Endpoint) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        Endpoint {
            sender: TransportSender { tx: a_tx },
            receiver: TransportReceiver { rx: a_rx },
        },
        Endpoint {
            sender: TransportSender { tx: b_tx },
            receiver: TransportReceiver { rx: b_rx },
        },
    )
}
