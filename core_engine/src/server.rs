//! Server orchestration.
//!
//! A [`Server`] owns the registry, the ingress queue and the interface
//! handle, runs the dispatcher and interface reader, and spawns one session
//! task per accepted connection.

use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;
use shared_utils::config::Config;
use shared_utils::proto::DataPacket;
use shared_utils::transport::{Connection, ConnectionOptions, Listener};
use shared_utils::tunnel::TunnelError;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::Authenticator;
use crate::control::ControlPlane;
use crate::dispatcher::{run_interface_reader, DispatchStats, Dispatcher, Ingress};
use crate::error::{EngineError, EngineResult};
use crate::interface::VirtualInterface;
use crate::registry::TunnelRegistry;
use crate::rpc::run_session;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Runtime settings derived from [`Config`].
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Serviced subnet; its netmask is handed to clients on connect
    pub subnet: IpNet,
    pub ingress_capacity: usize,
    pub interface_write_timeout: Duration,
    pub max_sessions: usize,
    /// Applied to connections the server's listener creates
    pub connection: ConnectionOptions,
}

impl ServerSettings {
    pub fn from_config(config: &Config) -> EngineResult<Self> {
        config.validate()?;
        Ok(ServerSettings {
            subnet: config.server.subnet()?,
            ingress_capacity: config.server.ingress_capacity,
            interface_write_timeout: config.server.interface_write_timeout(),
            max_sessions: config.network.max_connections,
            connection: ConnectionOptions {
                outbound_capacity: config.server.outbound_capacity,
                write_timeout: config.server.write_timeout(),
            },
        })
    }
}

pub struct Server {
    settings: ServerSettings,
    control: Arc<ControlPlane>,
    stats: Arc<DispatchStats>,
    ingress: Ingress,
    ingress_rx: Mutex<Option<mpsc::Receiver<DataPacket>>>,
    interface: Arc<dyn VirtualInterface>,
    session_slots: Arc<Semaphore>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    pub fn new(
        settings: ServerSettings,
        interface: Arc<dyn VirtualInterface>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        let registry = Arc::new(TunnelRegistry::new());
        let control = Arc::new(ControlPlane::new(registry, authenticator, settings.subnet));
        let stats = Arc::new(DispatchStats::new());
        let (ingress, ingress_rx) = Ingress::channel(settings.ingress_capacity, Arc::clone(&stats));

        Server {
            session_slots: Arc::new(Semaphore::new(settings.max_sessions.max(1))),
            settings,
            control,
            stats,
            ingress,
            ingress_rx: Mutex::new(Some(ingress_rx)),
            interface,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    pub fn control(&self) -> &Arc<ControlPlane> {
        &self.control
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        self.control.registry()
    }

    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }

    pub fn ingress(&self) -> Ingress {
        self.ingress.clone()
    }

    /// Spawn the dispatcher and the interface reader.
    pub async fn start(&self) -> EngineResult<()> {
        let rx = self
            .ingress_rx
            .lock()
            .await
            .take()
            .ok_or(EngineError::AlreadyStarted)?;

        let dispatcher = Dispatcher::new(
            Arc::clone(&self.control),
            Arc::clone(&self.interface),
            Arc::clone(&self.stats),
            self.settings.interface_write_timeout,
        );
        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(dispatcher.run(rx, self.shutdown.clone())));
        tasks.push(tokio::spawn(run_interface_reader(
            Arc::clone(&self.interface),
            self.ingress.clone(),
            self.shutdown.clone(),
        )));

        info!(
            subnet = %self.settings.subnet,
            interface = %self.interface.name(),
            "server started"
        );
        Ok(())
    }

    /// Accept connections until [`Server::shutdown`] is called.
    pub async fn serve<L: Listener>(&self, mut listener: L) -> EngineResult<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(local_addr = %addr, "accepting connections");
        }
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok(conn) => {
                    if let Err(e) = self.attach(conn).await {
                        warn!(error = %e, "connection refused");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
        Ok(())
    }

    /// Run a session for an already established connection.
    pub async fn attach(&self, conn: Arc<dyn Connection>) -> EngineResult<()> {
        if self.shutdown.is_cancelled() {
            let _ = conn.close().await;
            return Err(TunnelError::Shutdown.into());
        }
        let Ok(permit) = Arc::clone(&self.session_slots).try_acquire_owned() else {
            let _ = conn.close().await;
            return Err(EngineError::SessionLimit(self.settings.max_sessions));
        };

        let session = run_session(
            conn,
            Arc::clone(&self.control),
            self.ingress.clone(),
            self.shutdown.clone(),
        );
        let handle = tokio::spawn(async move {
            session.await;
            drop(permit);
        });

        let mut tasks = self.tasks.lock().await;
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
        Ok(())
    }

    /// Stop every task and tear down all tunnels.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!("shutting down server");
        self.shutdown.cancel();
        self.control.shutdown().await;

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "server task ended abnormally");
            }
        }

        debug!(stats = ?self.stats.snapshot(), "final data-plane counters");
        info!("server stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
