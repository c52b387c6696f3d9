//! Transport-independent connection handles.
//!
//! A [`Connection`] is one client's full-duplex message channel. It is shared
//! between the tunnel registry (which sends packets through it) and the
//! session task reading from it, so every method takes `&self`.

pub mod channel;

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::proto::framing::FrameError;
use crate::proto::{DataPacket, Message};
use crate::tunnel::SessionId;

pub use channel::ChannelConnection;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Connection closed")]
    Closed,
    #[error("Outbound queue full")]
    Backpressure,
    #[error("Operation timed out: {0}")]
    Timeout(String),
    #[error("Codec error: {0}")]
    Codec(#[from] FrameError),
    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the connection is unusable after this error.
    ///
    /// Backpressure only costs the packet that hit it.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransportError::Backpressure)
    }
}

/// Tunables shared by every connection implementation.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    /// Messages buffered for the peer before `send` reports backpressure
    pub outbound_capacity: usize,
    /// Upper bound on a single network write
    pub write_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            outbound_capacity: 256,
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Represents an active client connection over some transport.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Queue a message for the peer without waiting on the network.
    ///
    /// Fails with [`TransportError::Backpressure`] when the outbound queue is
    /// full and with [`TransportError::Closed`] once the connection is gone.
    async fn send(&self, message: Message) -> Result<(), TransportError>;

    /// Queue a data-plane packet for the peer.
    async fn send_packet(&self, packet: DataPacket) -> Result<(), TransportError> {
        self.send(Message::Data(packet)).await
    }

    /// Receive the next message.
    /// Returns `Ok(None)` at end of stream, including after [`Connection::close`].
    async fn recv(&self) -> Result<Option<Message>, TransportError>;

    /// Release transport resources. Idempotent.
    async fn close(&self) -> Result<(), TransportError>;

    /// Token fired once the connection is closed or has failed.
    fn closed(&self) -> CancellationToken;

    fn is_closed(&self) -> bool {
        self.closed().is_cancelled()
    }

    /// Stable identifier of the transport session behind this connection.
    fn session_id(&self) -> &SessionId;

    /// Returns the peer's socket address.
    fn peer_addr(&self) -> Result<SocketAddr, TransportError>;
}

/// Trait for a transport listener, capable of accepting incoming connections.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Accepts a new incoming connection.
    async fn accept(&mut self) -> Result<std::sync::Arc<dyn Connection>, TransportError>;

    /// Returns the local socket address this listener is bound to.
    fn local_addr(&self) -> Result<SocketAddr, TransportError>;
}

/// Non-blocking producer side of a connection's outbound queue.
pub(crate) fn try_enqueue(
    tx: &mpsc::Sender<Message>,
    closed: &CancellationToken,
    message: Message,
) -> Result<(), TransportError> {
    if closed.is_cancelled() {
        return Err(TransportError::Closed);
    }
    match tx.try_send(message) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(_)) => Err(TransportError::Backpressure),
        Err(TrySendError::Closed(_)) => Err(TransportError::Closed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backpressure_is_not_fatal() {
        assert!(!TransportError::Backpressure.is_fatal());
        assert!(TransportError::Closed.is_fatal());
        assert!(TransportError::Timeout("write".into()).is_fatal());
    }

    #[test]
    fn test_try_enqueue_reports_full_and_closed() {
        let (tx, rx) = mpsc::channel(1);
        let closed = CancellationToken::new();

        try_enqueue(&tx, &closed, Message::Keepalive).unwrap();
        assert!(matches!(
            try_enqueue(&tx, &closed, Message::Keepalive),
            Err(TransportError::Backpressure)
        ));

        drop(rx);
        assert!(matches!(
            try_enqueue(&tx, &closed, Message::Keepalive),
            Err(TransportError::Closed)
        ));

        let (tx, _rx) = mpsc::channel(1);
        closed.cancel();
        assert!(matches!(
            try_enqueue(&tx, &closed, Message::Keepalive),
            Err(TransportError::Closed)
        ));
    }
}
