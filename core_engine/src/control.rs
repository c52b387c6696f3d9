//! Control-plane state machine.
//!
//! Handles Connect, Disconnect, RegisterRoute and UnregisterRoute, and is the
//! only writer of registry state. Every way a tunnel can end (explicit
//! disconnect, failed send, closed stream, server shutdown) goes through
//! [`ControlPlane::teardown`], which acts exactly once per tunnel.

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use ipnet::IpNet;
use shared_utils::proto::{AuthType, ConnectResponse, StatusCode};
use shared_utils::transport::Connection;
use shared_utils::tunnel::{SessionId, TunnelError, TunnelId, TunnelState};
use tracing::{debug, info, warn};

use crate::auth::Authenticator;
use crate::registry::{IpClaim, TunnelRegistry};

/// Why a tunnel is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    /// Client asked for it; the session stays open.
    Disconnect,
    /// A send to the tunnel's connection failed.
    SendFailure,
    /// The tunnel's stream ended or errored.
    StreamClosed,
    Shutdown,
}

impl fmt::Display for TeardownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            TeardownReason::Disconnect => "disconnect",
            TeardownReason::SendFailure => "send failure",
            TeardownReason::StreamClosed => "stream closed",
            TeardownReason::Shutdown => "shutdown",
        };
        f.write_str(reason)
    }
}

/// Per-session state machine. Each tunnel a session opens gets a fresh slot;
/// a `Disconnected` slot is never moved out of its terminal state.
#[derive(Debug)]
struct SessionSlot {
    state: TunnelState,
    tunnel_id: Option<TunnelId>,
}

impl SessionSlot {
    fn new() -> Self {
        SessionSlot {
            state: TunnelState::Unconnected,
            tunnel_id: None,
        }
    }

    fn transition(&mut self, next: TunnelState) -> Result<(), TunnelError> {
        if !self.state.can_transition_to(next) {
            return Err(TunnelError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

pub struct ControlPlane {
    registry: Arc<TunnelRegistry>,
    authenticator: Arc<dyn Authenticator>,
    sessions: DashMap<SessionId, SessionSlot>,
    tunnel_sessions: DashMap<TunnelId, SessionId>,
    netmask: String,
    teardowns: AtomicU64,
}

impl ControlPlane {
    pub fn new(
        registry: Arc<TunnelRegistry>,
        authenticator: Arc<dyn Authenticator>,
        subnet: IpNet,
    ) -> Self {
        ControlPlane {
            registry,
            authenticator,
            sessions: DashMap::new(),
            tunnel_sessions: DashMap::new(),
            netmask: subnet.netmask().to_string(),
            teardowns: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.registry
    }

    /// Netmask of the serviced subnet, in dotted (or IPv6) form.
    pub fn netmask(&self) -> &str {
        &self.netmask
    }

    /// Authenticate and create a tunnel bound to `conn`.
    pub async fn connect(
        &self,
        session_id: &SessionId,
        conn: Arc<dyn Connection>,
        auth_type: AuthType,
        data: &str,
    ) -> ConnectResponse {
        {
            let mut slot = self
                .sessions
                .entry(session_id.clone())
                .and_modify(|slot| {
                    if slot.state.is_terminal() {
                        *slot = SessionSlot::new();
                    }
                })
                .or_insert_with(SessionSlot::new);

            if let Err(e) = slot.transition(TunnelState::Connecting) {
                warn!(session_id = %session_id, error = %e, "connect rejected");
                return ConnectResponse::rejected(StatusCode::UnknownError);
            }
        }

        let accepted = self.authenticator.verify(auth_type, data).await;

        let Some(mut slot) = self.sessions.get_mut(session_id) else {
            debug!(session_id = %session_id, "session closed during connect");
            return ConnectResponse::rejected(StatusCode::UnknownError);
        };
        if slot.state != TunnelState::Connecting {
            return ConnectResponse::rejected(StatusCode::UnknownError);
        }

        if !accepted {
            slot.state = TunnelState::Unconnected;
            warn!(session_id = %session_id, auth_type = ?auth_type, "authorization failed");
            return ConnectResponse::rejected(StatusCode::InvalidAuthorization);
        }

        let tunnel_id = TunnelId::generate();
        self.tunnel_sessions
            .insert(tunnel_id.clone(), session_id.clone());
        self.registry.add_tunnel(tunnel_id.clone(), conn);
        slot.tunnel_id = Some(tunnel_id.clone());
        slot.state = TunnelState::Connected;

        info!(session_id = %session_id, tunnel_id = %tunnel_id, "tunnel connected");

        ConnectResponse {
            tunnel_id,
            data: self.netmask.clone(),
            code: StatusCode::Ok,
        }
    }

    /// Tear down the tunnel owned by `session_id`. The payload cannot name a
    /// tunnel, so it is not consulted.
    pub async fn disconnect(&self, session_id: &SessionId, data: &str) -> StatusCode {
        if !data.is_empty() {
            debug!(session_id = %session_id, "ignoring disconnect payload");
        }
        if let Some(tunnel_id) = self.session_tunnel(session_id) {
            if self.teardown(&tunnel_id, TeardownReason::Disconnect).await {
                return StatusCode::Ok;
            }
        }
        debug!(session_id = %session_id, "disconnect without a live tunnel");
        StatusCode::UnknownError
    }

    /// Claim each route for the tunnel.
    ///
    /// Conflicting or unparsable entries are skipped; the rest are granted.
    /// The aggregate code is OK only when every entry ended up owned by the
    /// tunnel.
    pub fn register_route(&self, tunnel_id: &TunnelId, routes: &[String]) -> StatusCode {
        if !self.registry.contains(tunnel_id) {
            return StatusCode::UnknownError;
        }

        let mut code = StatusCode::Ok;
        for route in routes {
            let Some(ip) = parse_route(route) else {
                warn!(tunnel_id = %tunnel_id, route = %route, "rejecting unparsable route");
                code = StatusCode::UnknownError;
                continue;
            };
            match self.registry.add_ip(tunnel_id, ip) {
                IpClaim::Granted => debug!(tunnel_id = %tunnel_id, ip = %ip, "route registered"),
                IpClaim::AlreadyOwned => {}
                IpClaim::Conflict(owner) => {
                    warn!(tunnel_id = %tunnel_id, ip = %ip, owner = %owner, "route already owned");
                    code = StatusCode::UnknownError;
                }
                IpClaim::NoTunnel => return StatusCode::UnknownError,
            }
        }
        code
    }

    /// Release each route. Addresses the tunnel does not own are ignored.
    pub fn unregister_route(&self, tunnel_id: &TunnelId, routes: &[String]) -> StatusCode {
        if !self.registry.contains(tunnel_id) {
            return StatusCode::UnknownError;
        }
        for ip in routes.iter().filter_map(|route| parse_route(route)) {
            if self.registry.del_ip(tunnel_id, ip) {
                debug!(tunnel_id = %tunnel_id, ip = %ip, "route unregistered");
            }
        }
        StatusCode::Ok
    }

    /// Destroy a tunnel. Returns `true` only for the call that performed the
    /// teardown; every other call is a no-op.
    pub async fn teardown(&self, tunnel_id: &TunnelId, reason: TeardownReason) -> bool {
        let Some(conn) = self.registry.remove_tunnel(tunnel_id) else {
            return false;
        };
        self.teardowns.fetch_add(1, Ordering::Relaxed);

        if let Some((_, session_id)) = self.tunnel_sessions.remove(tunnel_id) {
            if let Some(mut slot) = self.sessions.get_mut(&session_id) {
                if slot.tunnel_id.as_ref() == Some(tunnel_id) {
                    if let Err(e) = slot.transition(TunnelState::Disconnected) {
                        warn!(tunnel_id = %tunnel_id, error = %e, "unexpected session state");
                        slot.state = TunnelState::Disconnected;
                    }
                    slot.tunnel_id = None;
                }
            }
        }

        info!(tunnel_id = %tunnel_id, reason = %reason, "tunnel torn down");

        if reason != TeardownReason::Disconnect {
            if let Err(e) = conn.close().await {
                debug!(tunnel_id = %tunnel_id, error = %e, "error closing connection");
            }
        }
        true
    }

    /// The session's transport has ended.
    pub async fn session_closed(&self, session_id: &SessionId) {
        let Some((_, slot)) = self.sessions.remove(session_id) else {
            return;
        };
        if let Some(tunnel_id) = slot.tunnel_id {
            self.teardown(&tunnel_id, TeardownReason::StreamClosed)
                .await;
        }
        debug!(session_id = %session_id, "session closed");
    }

    /// Tear down every live tunnel.
    pub async fn shutdown(&self) {
        for tunnel_id in self.registry.tunnel_ids() {
            self.teardown(&tunnel_id, TeardownReason::Shutdown).await;
        }
    }

    /// Live tunnel owned by the session, if any.
    pub fn session_tunnel(&self, session_id: &SessionId) -> Option<TunnelId> {
        let tunnel_id = self
            .sessions
            .get(session_id)
            .filter(|slot| slot.state == TunnelState::Connected)
            .and_then(|slot| slot.tunnel_id.clone())?;
        self.registry.contains(&tunnel_id).then_some(tunnel_id)
    }

    pub fn session_state(&self, session_id: &SessionId) -> Option<TunnelState> {
        self.sessions.get(session_id).map(|slot| slot.state)
    }

    /// Number of tunnels torn down so far.
    pub fn teardown_count(&self) -> u64 {
        self.teardowns.load(Ordering::Relaxed)
    }
}

/// A route is a single host address, optionally written as a host prefix
/// (`/32` or `/128`).
fn parse_route(route: &str) -> Option<IpAddr> {
    let route = route.trim();
    if let Ok(ip) = route.parse::<IpAddr>() {
        return Some(ip);
    }
    let net = route.parse::<IpNet>().ok()?;
    (net.prefix_len() == net.max_prefix_len()).then(|| net.addr())
}
