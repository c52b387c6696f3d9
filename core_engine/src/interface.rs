//! The virtual network interface the server routes to and from.
//!
//! [`TunInterface`] drives a real TUN device; [`MemoryInterface`] stands in
//! for it in tests and in-process setups.

use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use ipnet::IpNet;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tracing::info;

#[derive(Debug, Error)]
pub enum InterfaceError {
    #[error("Interface I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Interface closed")]
    Closed,
    #[error("Interface configuration error: {0}")]
    Config(String),
}

/// Raw L3 packet device.
#[async_trait]
pub trait VirtualInterface: Send + Sync {
    /// Read the next packet. [`InterfaceError::Closed`] ends the reader.
    async fn read_packet(&self) -> Result<Vec<u8>, InterfaceError>;

    async fn write_packet(&self, packet: &[u8]) -> Result<(), InterfaceError>;

    fn name(&self) -> &str;
}

/// TUN device settings.
#[derive(Debug, Clone)]
pub struct TunSettings {
    pub name: String,
    /// Interface address and prefix, e.g. `10.8.0.1/24`
    pub subnet: IpNet,
    pub mtu: u16,
}

/// A layer-3 TUN device.
pub struct TunInterface {
    name: String,
    mtu: usize,
    reader: Mutex<ReadHalf<tun::AsyncDevice>>,
    writer: Mutex<WriteHalf<tun::AsyncDevice>>,
}

impl TunInterface {
    /// Create and bring up the device. Usually needs elevated privileges.
    pub fn create(settings: &TunSettings) -> Result<Self, InterfaceError> {
        let IpAddr::V4(address) = settings.subnet.addr() else {
            return Err(InterfaceError::Config(format!(
                "TUN address must be IPv4, got {}",
                settings.subnet
            )));
        };
        let IpAddr::V4(netmask) = settings.subnet.netmask() else {
            return Err(InterfaceError::Config("TUN netmask must be IPv4".to_string()));
        };

        let mut config = tun::Configuration::default();
        config
            .name(&settings.name)
            .address(address)
            .netmask(netmask)
            .mtu(i32::from(settings.mtu))
            .layer(tun::Layer::L3)
            .up();

        #[cfg(target_os = "linux")]
        config.platform(|config| {
            config.packet_information(false);
        });

        let device = tun::create_as_async(&config)
            .map_err(|e| InterfaceError::Config(format!("create {}: {e}", settings.name)))?;
        let (reader, writer) = tokio::io::split(device);

        info!(
            interface = %settings.name,
            address = %address,
            netmask = %netmask,
            mtu = settings.mtu,
            "TUN interface up"
        );

        Ok(TunInterface {
            name: settings.name.clone(),
            mtu: usize::from(settings.mtu),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        })
    }
}

#[async_trait]
impl VirtualInterface for TunInterface {
    async fn read_packet(&self) -> Result<Vec<u8>, InterfaceError> {
        let mut buf = vec![0u8; self.mtu + 4];
        let n = self.reader.lock().await.read(&mut buf).await?;
        if n == 0 {
            return Err(InterfaceError::Closed);
        }
        buf.truncate(n);
        Ok(buf)
    }

    async fn write_packet(&self, packet: &[u8]) -> Result<(), InterfaceError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(packet).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// In-memory interface: packets injected through its [`MemoryInterfaceHandle`]
/// are read by the server, packets the server writes are captured there.
pub struct MemoryInterface {
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    captured: mpsc::UnboundedSender<Vec<u8>>,
    fail_writes: AtomicBool,
}

/// Test side of a [`MemoryInterface`].
pub struct MemoryInterfaceHandle {
    inject: mpsc::Sender<Vec<u8>>,
    written: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MemoryInterface {
    pub fn new(capacity: usize) -> (MemoryInterface, MemoryInterfaceHandle) {
        let (inject, inbound) = mpsc::channel(capacity.max(1));
        let (captured, written) = mpsc::unbounded_channel();
        (
            MemoryInterface {
                inbound: Mutex::new(inbound),
                captured,
                fail_writes: AtomicBool::new(false),
            },
            MemoryInterfaceHandle { inject, written },
        )
    }

    /// Make subsequent writes fail with an I/O error.
    pub fn set_write_failure(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }
}

#[async_trait]
impl VirtualInterface for MemoryInterface {
    async fn read_packet(&self) -> Result<Vec<u8>, InterfaceError> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or(InterfaceError::Closed)
    }

    async fn write_packet(&self, packet: &[u8]) -> Result<(), InterfaceError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(io::Error::new(io::ErrorKind::Other, "write failure injected").into());
        }
        self.captured
            .send(packet.to_vec())
            .map_err(|_| InterfaceError::Closed)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

impl MemoryInterfaceHandle {
    /// Queue a packet as if the kernel routed it into the interface.
    pub async fn inject(&self, packet: Vec<u8>) -> Result<(), InterfaceError> {
        self.inject
            .send(packet)
            .await
            .map_err(|_| InterfaceError::Closed)
    }

    /// Next packet the server wrote to the interface.
    pub async fn next_written(&mut self) -> Option<Vec<u8>> {
        self.written.recv().await
    }

    /// A packet already written, without waiting.
    pub fn try_next_written(&mut self) -> Option<Vec<u8>> {
        self.written.try_recv().ok()
    }
}
