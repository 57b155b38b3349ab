//! Transport seam between the dispatcher and the wire.

use crate::types::PeerId;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no link to {0}")]
    NotConnected(PeerId),
    #[error("send queue to {0} is full")]
    QueueFull(PeerId),
    #[error("link to {0} closed")]
    Closed(PeerId),
    #[error("io error: {0}")]
    Io(String),
}

/// Resolves once the frame is on the wire or the send has failed.
/// This is a transport-level acknowledgment, not a protocol response.
pub type SendAck = oneshot::Receiver<Result<(), TransportError>>;

/// Best-effort framed delivery to a directly connected peer.
///
/// `send_frame` must not block: implementations enqueue and report the
/// outcome through the returned [`SendAck`].
pub trait Transport: Send + Sync {
    fn send_frame(&self, to: &PeerId, frame: Vec<u8>) -> SendAck;
}

/// A raw frame read from a connection.
#[derive(Debug)]
pub struct InboundFrame {
    /// The neighbor the frame arrived from
    pub via: PeerId,
    pub frame: Vec<u8>,
}

/// An already-resolved acknowledgment.
pub fn ready_ack(result: Result<(), TransportError>) -> SendAck {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(result);
    rx
}
