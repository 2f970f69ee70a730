//! Point-to-point message ports

use tokio::sync::mpsc;
use tracing::debug;

use super::message::RpcMessage;
use super::origin::TransportKind;

/// Sending half of a FIFO link between two contexts
#[derive(Debug, Clone)]
pub struct Port {
    tx: mpsc::UnboundedSender<RpcMessage>,
    kind: TransportKind,
}

/// Receiving half of a [`Port`]; knows which transport it listens on
#[derive(Debug)]
pub struct PortReceiver {
    rx: mpsc::UnboundedReceiver<RpcMessage>,
    kind: TransportKind,
}

impl Port {
    /// Create a connected sender/receiver pair over `kind`
    pub fn pair(kind: TransportKind) -> (Port, PortReceiver) {
        debug!(%kind, "Port::pair: called");
        let (tx, rx) = mpsc::unbounded_channel();
        (Port { tx, kind }, PortReceiver { rx, kind })
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Fire-and-forget send; returns false when the other end is gone
    pub fn send(&self, message: RpcMessage) -> bool {
        self.tx.send(message).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl PortReceiver {
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Next message, or `None` once every sender is dropped
    pub async fn recv(&mut self) -> Option<RpcMessage> {
        self.rx.recv().await
    }
}
