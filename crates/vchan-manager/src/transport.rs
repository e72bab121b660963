use bytes::Bytes;
use tokio::sync::mpsc;
use vchan_proto::svc::ChunkFlags;

use crate::handle::{RemoteChannelId, WriteToken};

/// One static channel chunk handed to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub channel_id: RemoteChannelId,
    pub data: Bytes,
    pub flags: ChunkFlags,
    /// Set on the last chunk of a write; report it back with `ChannelManager::on_write_complete`.
    pub completion: Option<WriteToken>,
}

#[derive(Debug, thiserror::Error)]
#[error("{reason}")]
pub struct TransportError {
    reason: String,
}

impl TransportError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

/// Outgoing side of the connection carrying the virtual channels.
///
/// `send` is called with the manager guard held and must not block.
pub trait ChannelTransport: Send + Sync {
    fn send(&self, request: SendRequest) -> Result<(), TransportError>;
}

/// Transport handing requests over to a network task through an unbounded channel
#[derive(Debug, Clone)]
pub struct QueuedTransport {
    request_tx: mpsc::UnboundedSender<SendRequest>,
}

impl QueuedTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SendRequest>) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        (Self { request_tx }, request_rx)
    }
}

impl ChannelTransport for QueuedTransport {
    fn send(&self, request: SendRequest) -> Result<(), TransportError> {
        self.request_tx
            .send(request)
            .map_err(|_| TransportError::new("network task is gone"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queued_transport_fails_once_receiver_is_dropped() {
        let (transport, mut request_rx) = QueuedTransport::new();

        let request = SendRequest {
            channel_id: RemoteChannelId::new(1004),
            data: Bytes::from_static(b"hello"),
            flags: ChunkFlags::ONLY,
            completion: Some(WriteToken::new(1)),
        };

        transport.send(request.clone()).unwrap();
        assert_eq!(Some(request.clone()), request_rx.try_recv().ok());

        drop(request_rx);
        assert!(transport.send(request).is_err());
    }
}
