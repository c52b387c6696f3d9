//! Data-plane dispatch.
//!
//! Packets from the interface and from every tunnel are funnelled through one
//! bounded ingress queue. A single dispatcher task drains it, so packets from
//! any one source leave in the order they arrived. Each packet goes to the
//! tunnel owning its destination address, or to the interface otherwise.
//!
//! Nothing on this path blocks on a slow peer: a full ingress queue or a full
//! per-connection outbound queue drops the packet and bumps a counter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use shared_utils::proto::DataPacket;
use shared_utils::transport::TransportError;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::control::{ControlPlane, TeardownReason};
use crate::interface::{InterfaceError, VirtualInterface};
use crate::packet;

/// Pause after a failed interface read before polling again.
const INTERFACE_READ_BACKOFF: Duration = Duration::from_millis(50);

/// Data-plane counters. Replace per-packet logging on the hot path.
#[derive(Debug, Default)]
pub struct DispatchStats {
    /// Packets accepted into the ingress queue.
    pub ingress_accepted: AtomicU64,
    /// Packets dropped because the ingress queue was full.
    pub dropped_queue_full: AtomicU64,
    /// Packets handed to a tunnel's connection.
    pub forwarded_to_tunnel: AtomicU64,
    /// Packets written to the interface.
    pub written_to_interface: AtomicU64,
    /// Payloads without a readable IPv4/IPv6 destination.
    pub dropped_unparsable: AtomicU64,
    /// Packets dropped because a tunnel's outbound queue was full.
    pub dropped_backpressure: AtomicU64,
    /// Packets lost to a failed tunnel send (the tunnel is torn down).
    pub dropped_send_failed: AtomicU64,
    /// Interface writes that failed or timed out.
    pub interface_write_errors: AtomicU64,
    /// Interface reads that failed; the reader backs off and keeps going.
    pub interface_read_errors: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub ingress_accepted: u64,
    pub dropped_queue_full: u64,
    pub forwarded_to_tunnel: u64,
    pub written_to_interface: u64,
    pub dropped_unparsable: u64,
    pub dropped_backpressure: u64,
    pub dropped_send_failed: u64,
    pub interface_write_errors: u64,
    pub interface_read_errors: u64,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            ingress_accepted: self.ingress_accepted.load(Ordering::Relaxed),
            dropped_queue_full: self.dropped_queue_full.load(Ordering::Relaxed),
            forwarded_to_tunnel: self.forwarded_to_tunnel.load(Ordering::Relaxed),
            written_to_interface: self.written_to_interface.load(Ordering::Relaxed),
            dropped_unparsable: self.dropped_unparsable.load(Ordering::Relaxed),
            dropped_backpressure: self.dropped_backpressure.load(Ordering::Relaxed),
            dropped_send_failed: self.dropped_send_failed.load(Ordering::Relaxed),
            interface_write_errors: self.interface_write_errors.load(Ordering::Relaxed),
            interface_read_errors: self.interface_read_errors.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Producer side of the ingress queue. Cheap to clone.
#[derive(Clone)]
pub struct Ingress {
    tx: mpsc::Sender<DataPacket>,
    stats: Arc<DispatchStats>,
}

impl Ingress {
    pub fn channel(
        capacity: usize,
        stats: Arc<DispatchStats>,
    ) -> (Ingress, mpsc::Receiver<DataPacket>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Ingress { tx, stats }, rx)
    }

    /// Enqueue without waiting. Returns `false` if the packet was dropped.
    pub fn offer(&self, packet: DataPacket) -> bool {
        match self.tx.try_send(packet) {
            Ok(()) => {
                bump(&self.stats.ingress_accepted);
                true
            }
            Err(TrySendError::Full(_)) => {
                bump(&self.stats.dropped_queue_full);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Routes packets drained from the ingress queue.
pub struct Dispatcher {
    control: Arc<ControlPlane>,
    interface: Arc<dyn VirtualInterface>,
    stats: Arc<DispatchStats>,
    interface_write_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        control: Arc<ControlPlane>,
        interface: Arc<dyn VirtualInterface>,
        stats: Arc<DispatchStats>,
        interface_write_timeout: Duration,
    ) -> Self {
        Dispatcher {
            control,
            interface,
            stats,
            interface_write_timeout,
        }
    }

    /// Drain `rx` until it closes or `shutdown` fires.
    pub async fn run(self, mut rx: mpsc::Receiver<DataPacket>, shutdown: CancellationToken) {
        info!(interface = %self.interface.name(), "dispatcher started");
        loop {
            let packet = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                packet = rx.recv() => packet,
            };
            match packet {
                Some(packet) => self.dispatch(packet).await,
                None => break,
            }
        }
        info!("dispatcher stopped");
    }

    /// Route one packet.
    pub async fn dispatch(&self, packet: DataPacket) {
        let Some(destination) = packet::destination(&packet.data) else {
            trace!(source = %packet.tunnel_id, len = packet.data.len(), "dropping non-IP payload");
            bump(&self.stats.dropped_unparsable);
            return;
        };

        if let Some((tunnel_id, conn)) = self.control.registry().lookup(destination) {
            let outbound = DataPacket::new(tunnel_id.clone(), packet.data);
            match conn.send_packet(outbound).await {
                Ok(()) => bump(&self.stats.forwarded_to_tunnel),
                Err(TransportError::Backpressure) => bump(&self.stats.dropped_backpressure),
                Err(e) => {
                    bump(&self.stats.dropped_send_failed);
                    warn!(tunnel_id = %tunnel_id, error = %e, "send to tunnel failed");
                    self.control
                        .teardown(&tunnel_id, TeardownReason::SendFailure)
                        .await;
                }
            }
            return;
        }

        match timeout(
            self.interface_write_timeout,
            self.interface.write_packet(&packet.data),
        )
        .await
        {
            Ok(Ok(())) => bump(&self.stats.written_to_interface),
            Ok(Err(e)) => {
                bump(&self.stats.interface_write_errors);
                debug!(destination = %destination, error = %e, "interface write failed");
            }
            Err(_) => {
                bump(&self.stats.interface_write_errors);
                warn!(destination = %destination, "interface write timed out");
            }
        }
    }
}

/// Feed packets read from the interface into the ingress queue.
///
/// Read errors are counted and retried after a short pause; only
/// [`InterfaceError::Closed`] or `shutdown` ends the reader.
pub async fn run_interface_reader(
    interface: Arc<dyn VirtualInterface>,
    ingress: Ingress,
    shutdown: CancellationToken,
) {
    info!(interface = %interface.name(), "interface reader started");
    loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = interface.read_packet() => read,
        };
        match read {
            Ok(data) if data.is_empty() => continue,
            Ok(data) => {
                ingress.offer(DataPacket::from_interface(data));
            }
            Err(InterfaceError::Closed) => {
                info!(interface = %interface.name(), "interface closed");
                break;
            }
            Err(e) => {
                bump(&ingress.stats.interface_read_errors);
                warn!(interface = %interface.name(), error = %e, "interface read error");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(INTERFACE_READ_BACKOFF) => {}
                }
            }
        }
    }
    debug!("interface reader stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticAuthenticator;
    use crate::interface::MemoryInterface;
    use crate::packet::ipv4_packet;
    use crate::registry::TunnelRegistry;
    use shared_utils::proto::Message;
    use shared_utils::transport::{ChannelConnection, Connection};
    use shared_utils::tunnel::TunnelId;
    use std::io;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicBool;

    struct Fixture {
        control: Arc<ControlPlane>,
        dispatcher: Dispatcher,
        stats: Arc<DispatchStats>,
        interface: Arc<MemoryInterface>,
        handle: crate::interface::MemoryInterfaceHandle,
    }

    fn fixture() -> Fixture {
        let control = Arc::new(ControlPlane::new(
            Arc::new(TunnelRegistry::new()),
            Arc::new(StaticAuthenticator::anonymous()),
            "10.8.0.1/24".parse().unwrap(),
        ));
        let (interface, handle) = MemoryInterface::new(8);
        let interface = Arc::new(interface);
        let stats = Arc::new(DispatchStats::new());
        let dispatcher = Dispatcher::new(
            Arc::clone(&control),
            interface.clone() as Arc<dyn VirtualInterface>,
            Arc::clone(&stats),
            Duration::from_millis(100),
        );
        Fixture {
            control,
            dispatcher,
            stats,
            interface,
            handle,
        }
    }

    async fn tunnel_with_route(
        control: &ControlPlane,
        ip: &str,
        capacity: usize,
    ) -> (TunnelId, Arc<dyn Connection>, ChannelConnection) {
        let (server, client) = ChannelConnection::pair(capacity);
        let session_id = server.session_id().clone();
        let conn: Arc<dyn Connection> = Arc::new(server);
        let tunnel_id = control
            .connect(
                &session_id,
                Arc::clone(&conn),
                shared_utils::proto::AuthType::None,
                "",
            )
            .await
            .tunnel_id;
        control.register_route(&tunnel_id, &[ip.to_string()]);
        (tunnel_id, conn, client)
    }

    fn to(ip: [u8; 4], payload: &[u8]) -> Vec<u8> {
        ipv4_packet(Ipv4Addr::new(10, 8, 0, 1), Ipv4Addr::from(ip), payload).unwrap()
    }

    #[tokio::test]
    async fn test_forwards_to_owning_tunnel() {
        let f = fixture();
        let (t1, _conn, client) = tunnel_with_route(&f.control, "10.8.0.2", 8).await;

        let data = to([10, 8, 0, 2], b"hello");
        f.dispatcher
            .dispatch(DataPacket::from_interface(data.clone()))
            .await;

        match client.recv().await.unwrap() {
            Some(Message::Data(packet)) => {
                assert_eq!(packet.tunnel_id, t1);
                assert_eq!(packet.data, data);
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert_eq!(f.stats.snapshot().forwarded_to_tunnel, 1);
    }

    #[tokio::test]
    async fn test_unowned_destination_goes_to_interface() {
        let mut f = fixture();
        let data = to([8, 8, 8, 8], b"outbound");
        f.dispatcher
            .dispatch(DataPacket::new(TunnelId::from("t1"), data.clone()))
            .await;

        assert_eq!(f.handle.next_written().await, Some(data));
        assert_eq!(f.stats.snapshot().written_to_interface, 1);
    }

    #[tokio::test]
    async fn test_non_ip_payload_is_dropped() {
        let mut f = fixture();
        f.dispatcher
            .dispatch(DataPacket::from_interface(b"garbage".to_vec()))
            .await;

        assert_eq!(f.stats.snapshot().dropped_unparsable, 1);
        assert_eq!(f.handle.try_next_written(), None);
    }

    #[tokio::test]
    async fn test_full_tunnel_queue_drops_without_teardown() {
        let f = fixture();
        let (t1, conn, _client) = tunnel_with_route(&f.control, "10.8.0.2", 1).await;

        for _ in 0..3 {
            f.dispatcher
                .dispatch(DataPacket::from_interface(to([10, 8, 0, 2], b"x")))
                .await;
        }

        let stats = f.stats.snapshot();
        assert_eq!(stats.forwarded_to_tunnel, 1);
        assert_eq!(stats.dropped_backpressure, 2);
        assert!(f.control.registry().contains(&t1));
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_send_failure_tears_down_tunnel() {
        let f = fixture();
        let (t1, conn, client) = tunnel_with_route(&f.control, "10.8.0.2", 8).await;
        drop(client);

        f.dispatcher
            .dispatch(DataPacket::from_interface(to([10, 8, 0, 2], b"x")))
            .await;

        assert_eq!(f.stats.snapshot().dropped_send_failed, 1);
        assert!(!f.control.registry().contains(&t1));
        assert!(!f
            .control
            .registry()
            .has_ip_in_any_tunnel("10.8.0.2".parse().unwrap()));
        assert!(conn.is_closed());
        assert_eq!(f.control.teardown_count(), 1);
    }

    #[tokio::test]
    async fn test_interface_write_failure_is_counted() {
        let f = fixture();
        f.interface.set_write_failure(true);
        f.dispatcher
            .dispatch(DataPacket::from_interface(to([192, 168, 1, 1], b"x")))
            .await;
        assert_eq!(f.stats.snapshot().interface_write_errors, 1);
    }

    #[tokio::test]
    async fn test_ingress_drops_when_full() {
        let stats = Arc::new(DispatchStats::new());
        let (ingress, mut rx) = Ingress::channel(2, Arc::clone(&stats));

        assert!(ingress.offer(DataPacket::from_interface(vec![1])));
        assert!(ingress.offer(DataPacket::from_interface(vec![2])));
        assert!(!ingress.offer(DataPacket::from_interface(vec![3])));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.ingress_accepted, 2);
        assert_eq!(snapshot.dropped_queue_full, 1);
        assert_eq!(rx.recv().await.unwrap().data, vec![1]);
    }

    #[tokio::test]
    async fn test_run_preserves_source_order() {
        let f = fixture();
        let (_t1, _conn, client) = tunnel_with_route(&f.control, "10.8.0.2", 64).await;
        let (ingress, rx) = Ingress::channel(64, Arc::clone(&f.stats));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(f.dispatcher.run(rx, shutdown.clone()));

        for i in 0..20u8 {
            assert!(ingress.offer(DataPacket::from_interface(to([10, 8, 0, 2], &[i]))));
        }
        for i in 0..20u8 {
            match client.recv().await.unwrap() {
                Some(Message::Data(packet)) => assert_eq!(packet.data.last(), Some(&i)),
                other => panic!("unexpected message: {other:?}"),
            }
        }

        shutdown.cancel();
        task.await.unwrap();
    }

    /// Fails its first read, then serves the wrapped interface.
    struct FlakyInterface {
        inner: MemoryInterface,
        failed: AtomicBool,
    }

    #[async_trait::async_trait]
    impl VirtualInterface for FlakyInterface {
        async fn read_packet(&self) -> Result<Vec<u8>, InterfaceError> {
            if !self.failed.swap(true, Ordering::Relaxed) {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "read interrupted").into());
            }
            self.inner.read_packet().await
        }

        async fn write_packet(&self, packet: &[u8]) -> Result<(), InterfaceError> {
            self.inner.write_packet(packet).await
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_reader_survives_read_error() {
        let (inner, handle) = MemoryInterface::new(8);
        let interface: Arc<dyn VirtualInterface> = Arc::new(FlakyInterface {
            inner,
            failed: AtomicBool::new(false),
        });
        let stats = Arc::new(DispatchStats::new());
        let (ingress, mut rx) = Ingress::channel(8, Arc::clone(&stats));
        let shutdown = CancellationToken::new();
        let reader = tokio::spawn(run_interface_reader(interface, ingress, shutdown.clone()));

        for i in 0..3u8 {
            handle.inject(to([10, 8, 0, 2], &[i])).await.unwrap();
        }
        for i in 0..3u8 {
            let packet = timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("reader stopped after a read error")
                .unwrap();
            assert!(packet.tunnel_id.is_interface());
            assert_eq!(packet.data.last(), Some(&i));
        }

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.interface_read_errors, 1);
        assert_eq!(snapshot.ingress_accepted, 3);
        assert!(!reader.is_finished());

        shutdown.cancel();
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn test_reader_stops_when_interface_closes() {
        let (interface, handle) = MemoryInterface::new(8);
        let stats = Arc::new(DispatchStats::new());
        let (ingress, _rx) = Ingress::channel(8, Arc::clone(&stats));
        drop(handle);

        timeout(
            Duration::from_secs(5),
            run_interface_reader(Arc::new(interface), ingress, CancellationToken::new()),
        )
        .await
        .expect("reader kept running on a closed interface");
        assert_eq!(stats.snapshot().interface_read_errors, 0);
    }
}
