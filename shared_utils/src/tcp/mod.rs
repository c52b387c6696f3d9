//! TCP transport: framed connections and a listener minting session ids.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::proto::framing::FrameCodec;
use crate::proto::Message;
use crate::transport::{
    try_enqueue, Connection, ConnectionOptions, Listener as TraitListener, TransportError,
};
use crate::tunnel::SessionId;

/// A framed TCP connection.
///
/// Outbound messages go through a bounded queue drained by a writer task, so
/// `send` never waits on the socket. A failed or timed-out write closes the
/// connection.
pub struct TcpConnection {
    session_id: SessionId,
    peer_addr: SocketAddr,
    reader: Mutex<FramedRead<OwnedReadHalf, FrameCodec>>,
    outbound: mpsc::Sender<Message>,
    closed: CancellationToken,
}

impl TcpConnection {
    /// Wrap an established stream. Must be called inside a tokio runtime.
    pub fn from_stream(
        stream: TcpStream,
        options: ConnectionOptions,
    ) -> Result<Self, TransportError> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let session_id = SessionId::generate();
        let closed = CancellationToken::new();
        let (outbound, rx) = mpsc::channel(options.outbound_capacity.max(1));

        tokio::spawn(write_loop(
            session_id.clone(),
            FramedWrite::new(write_half, FrameCodec::new()),
            rx,
            closed.clone(),
            options.write_timeout,
        ));

        debug!(session_id = %session_id, peer = %peer_addr, "TCP connection established");

        Ok(TcpConnection {
            session_id,
            peer_addr,
            reader: Mutex::new(FramedRead::new(read_half, FrameCodec::new())),
            outbound,
            closed,
        })
    }

    /// Dial a server.
    pub async fn connect(
        server_address: &str,
        options: ConnectionOptions,
    ) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(server_address)
            .await
            .map_err(|e| TransportError::Connection(format!("connect {server_address}: {e}")))?;
        Self::from_stream(stream, options)
    }
}

async fn write_loop(
    session_id: SessionId,
    mut sink: FramedWrite<OwnedWriteHalf, FrameCodec>,
    mut rx: mpsc::Receiver<Message>,
    closed: CancellationToken,
    write_timeout: Duration,
) {
    loop {
        let message = tokio::select! {
            _ = closed.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        if !write_one(&session_id, &mut sink, message, write_timeout).await {
            closed.cancel();
            return;
        }
    }

    // Flush what was queued before close, e.g. the reply to the last request.
    rx.close();
    while let Ok(message) = rx.try_recv() {
        if !write_one(&session_id, &mut sink, message, write_timeout).await {
            break;
        }
    }
    closed.cancel();
    if let Ok(Err(e)) = timeout(write_timeout, sink.close()).await {
        debug!(session_id = %session_id, error = %e, "Error shutting down TCP write half");
    }
}

async fn write_one(
    session_id: &SessionId,
    sink: &mut FramedWrite<OwnedWriteHalf, FrameCodec>,
    message: Message,
    write_timeout: Duration,
) -> bool {
    let frame = match message.to_frame() {
        Ok(frame) => frame,
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "Dropping unencodable message");
            return true;
        }
    };
    match timeout(write_timeout, sink.send(frame)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(session_id = %session_id, error = %e, "TCP write failed");
            false
        }
        Err(_) => {
            warn!(session_id = %session_id, timeout = ?write_timeout, "TCP write timed out");
            false
        }
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send(&self, message: Message) -> Result<(), TransportError> {
        try_enqueue(&self.outbound, &self.closed, message)
    }

    async fn recv(&self) -> Result<Option<Message>, TransportError> {
        let mut reader = self.reader.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Ok(None),
            frame = reader.next() => match frame {
                None => Ok(None),
                Some(Ok(frame)) => Ok(Some(Message::from_frame(frame)?)),
                Some(Err(e)) => Err(e.into()),
            },
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.closed.is_cancelled() {
            debug!(session_id = %self.session_id, "Closing TCP connection");
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
        Ok(self.peer_addr)
    }
}

/// TCP listener producing [`TcpConnection`]s.
pub struct TcpTransportListener {
    listener: TcpListener,
    options: ConnectionOptions,
}

impl TcpTransportListener {
    pub async fn bind(
        local_address: &str,
        options: ConnectionOptions,
    ) -> Result<Self, TransportError> {
        let addr: SocketAddr = local_address.parse()?;
        let listener = TcpListener::bind(addr).await?;
        info!(local_addr = %listener.local_addr()?, "TCP transport listening");
        Ok(TcpTransportListener { listener, options })
    }
}

#[async_trait]
impl TraitListener for TcpTransportListener {
    async fn accept(&mut self) -> Result<Arc<dyn Connection>, TransportError> {
        let (stream, peer) = self.listener.accept().await?;
        debug!(peer = %peer, "Accepted TCP connection");
        Ok(Arc::new(TcpConnection::from_stream(stream, self.options)?))
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }
}
