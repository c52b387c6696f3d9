//! In-memory connection pair over tokio channels.
//!
//! Used by in-process clients and by tests standing in for the network.

use std::net::SocketAddr;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{try_enqueue, Connection, TransportError};
use crate::proto::Message;
use crate::tunnel::SessionId;

pub struct ChannelConnection {
    session_id: SessionId,
    peer: SocketAddr,
    outbound: StdMutex<Option<mpsc::Sender<Message>>>,
    inbox: Mutex<mpsc::Receiver<Message>>,
    closed: CancellationToken,
}

impl ChannelConnection {
    /// Create two connected ends, each able to buffer `capacity` messages
    /// from the other.
    pub fn pair(capacity: usize) -> (ChannelConnection, ChannelConnection) {
        let (tx_a, rx_a) = mpsc::channel(capacity);
        let (tx_b, rx_b) = mpsc::channel(capacity);
        let peer: SocketAddr = SocketAddr::from(([127, 0, 0, 1], 0));

        let a = ChannelConnection {
            session_id: SessionId::generate(),
            peer,
            outbound: StdMutex::new(Some(tx_a)),
            inbox: Mutex::new(rx_b),
            closed: CancellationToken::new(),
        };
        let b = ChannelConnection {
            session_id: SessionId::generate(),
            peer,
            outbound: StdMutex::new(Some(tx_b)),
            inbox: Mutex::new(rx_a),
            closed: CancellationToken::new(),
        };
        (a, b)
    }

    fn sender(&self) -> Option<mpsc::Sender<Message>> {
        self.outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl Connection for ChannelConnection {
    async fn send(&self, message: Message) -> Result<(), TransportError> {
        let tx = self.sender().ok_or(TransportError::Closed)?;
        let result = try_enqueue(&tx, &self.closed, message);
        if matches!(result, Err(TransportError::Closed)) {
            // Peer went away; surface it through the failure token too.
            self.closed.cancel();
        }
        result
    }

    async fn recv(&self) -> Result<Option<Message>, TransportError> {
        let mut inbox = self.inbox.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Ok(None),
            message = inbox.recv() => Ok(message),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        let sender = self
            .outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if sender.is_some() {
            debug!(session_id = %self.session_id, "Closing channel connection");
        }
        self.closed.cancel();
        Ok(())
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    fn peer_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.peer)
    }
}
