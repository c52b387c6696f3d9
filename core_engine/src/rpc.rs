//! Per-connection session loop.
//!
//! Reads messages from one client connection, answers control requests
//! through the [`ControlPlane`] and feeds data packets into the ingress queue
//! stamped with the session's own tunnel id.

use std::sync::Arc;

use shared_utils::proto::{
    Call, DataPacket, DisconnectResponse, Message, Reply, Request, Response, RouteResponse,
    StatusCode,
};
use shared_utils::transport::Connection;
use shared_utils::tunnel::{SessionId, TunnelId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::control::ControlPlane;
use crate::dispatcher::Ingress;

/// Serve one connection until it ends or `shutdown` fires, then tear down
/// whatever tunnel it owned.
pub async fn run_session(
    conn: Arc<dyn Connection>,
    control: Arc<ControlPlane>,
    ingress: Ingress,
    shutdown: CancellationToken,
) {
    let session_id = conn.session_id().clone();
    match conn.peer_addr() {
        Ok(peer) => info!(session_id = %session_id, peer = %peer, "session started"),
        Err(_) => info!(session_id = %session_id, "session started"),
    }

    let closed = conn.closed();
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = closed.cancelled() => break,
            next = conn.recv() => next,
        };

        match next {
            Ok(Some(Message::Request(request))) => {
                let response = handle_request(&control, &session_id, &conn, request).await;
                if let Err(e) = conn.send(Message::Response(response)).await {
                    warn!(session_id = %session_id, error = %e, "failed to send response");
                    if e.is_fatal() {
                        break;
                    }
                }
            }
            Ok(Some(Message::Data(packet))) => match control.session_tunnel(&session_id) {
                Some(tunnel_id) => {
                    ingress.offer(DataPacket::new(tunnel_id, packet.data));
                }
                None => trace!(session_id = %session_id, "dropping data without a tunnel"),
            },
            Ok(Some(Message::Keepalive)) => {}
            Ok(Some(Message::Response(_))) => {
                debug!(session_id = %session_id, "ignoring unsolicited response");
            }
            Ok(None) => {
                debug!(session_id = %session_id, "peer closed the stream");
                break;
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "session read error");
                break;
            }
        }
    }

    control.session_closed(&session_id).await;
    if let Err(e) = conn.close().await {
        debug!(session_id = %session_id, error = %e, "error closing session");
    }
    info!(session_id = %session_id, "session ended");
}

async fn handle_request(
    control: &ControlPlane,
    session_id: &SessionId,
    conn: &Arc<dyn Connection>,
    request: Request,
) -> Response {
    let reply = match request.call {
        Call::Connect(req) => Reply::Connect(
            control
                .connect(session_id, Arc::clone(conn), req.auth_type, &req.data)
                .await,
        ),
        Call::Disconnect(req) => Reply::Disconnect(DisconnectResponse {
            code: control.disconnect(session_id, &req.data).await,
        }),
        Call::RegisterRoute(req) => Reply::RegisterRoute(RouteResponse {
            code: if owns(control, session_id, &req.tunnel_id) {
                control.register_route(&req.tunnel_id, &req.route)
            } else {
                StatusCode::UnknownError
            },
        }),
        Call::UnregisterRoute(req) => Reply::UnregisterRoute(RouteResponse {
            code: if owns(control, session_id, &req.tunnel_id) {
                control.unregister_route(&req.tunnel_id, &req.route)
            } else {
                StatusCode::UnknownError
            },
        }),
    };

    debug!(session_id = %session_id, id = request.id, code = ?reply.code(), "request handled");
    Response {
        id: request.id,
        reply,
    }
}

/// Route calls may only touch the caller's own tunnel.
fn owns(control: &ControlPlane, session_id: &SessionId, tunnel_id: &TunnelId) -> bool {
    let owned = control.session_tunnel(session_id).as_ref() == Some(tunnel_id);
    if !owned {
        debug!(session_id = %session_id, tunnel_id = %tunnel_id, "route call for a tunnel the session does not own");
    }
    owned
}
