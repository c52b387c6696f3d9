//! RPC and data-plane message definitions.
//!
//! Control requests and responses travel in `Control` frames, tunnel traffic
//! in `Data` frames; both payloads are `bincode`-encoded.

use serde::{Deserialize, Serialize};

use crate::proto::framing::{Frame, FrameError, FrameType};
use crate::tunnel::TunnelId;

/// Credential scheme selected by the client on `Connect`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    None,
    Xor,
}

/// Outcome code carried by every control-plane response.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    UnknownError,
    InvalidAuthorization,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub auth_type: AuthType,
    pub data: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    /// Empty unless `code` is `Ok`
    pub tunnel_id: TunnelId,
    /// Server netmask in dotted form on success
    pub data: String,
    pub code: StatusCode,
}

impl ConnectResponse {
    pub fn rejected(code: StatusCode) -> Self {
        ConnectResponse {
            tunnel_id: TunnelId::interface(),
            data: String::new(),
            code,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DisconnectRequest {
    pub data: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DisconnectResponse {
    pub code: StatusCode,
}

/// Body of both `RegisterRoute` and `UnregisterRoute`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RouteRequest {
    pub tunnel_id: TunnelId,
    pub route: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RouteResponse {
    pub code: StatusCode,
}

/// Unit of data-plane transport.
///
/// `tunnel_id` is the interface sentinel (empty) for packets read from the
/// virtual interface.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub tunnel_id: TunnelId,
    pub data: Vec<u8>,
}

impl DataPacket {
    pub fn new(tunnel_id: TunnelId, data: Vec<u8>) -> Self {
        DataPacket { tunnel_id, data }
    }

    /// Packet read from the local virtual interface.
    pub fn from_interface(data: Vec<u8>) -> Self {
        DataPacket {
            tunnel_id: TunnelId::interface(),
            data,
        }
    }
}

impl std::fmt::Debug for DataPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataPacket")
            .field("tunnel_id", &self.tunnel_id)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// A control-plane call.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect(ConnectRequest),
    Disconnect(DisconnectRequest),
    RegisterRoute(RouteRequest),
    UnregisterRoute(RouteRequest),
}

/// Reply to a [`Call`], variant for variant.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Connect(ConnectResponse),
    Disconnect(DisconnectResponse),
    RegisterRoute(RouteResponse),
    UnregisterRoute(RouteResponse),
}

impl Reply {
    pub fn code(&self) -> StatusCode {
        match self {
            Reply::Connect(r) => r.code,
            Reply::Disconnect(r) => r.code,
            Reply::RegisterRoute(r) | Reply::UnregisterRoute(r) => r.code,
        }
    }
}

/// Request with a client-chosen correlation id.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: u32,
    pub call: Call,
}

/// Response echoing the id of the request it answers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub id: u32,
    pub reply: Reply,
}

#[derive(Serialize, Deserialize)]
enum Control {
    Request(Request),
    Response(Response),
}

/// Everything a connection can carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Data(DataPacket),
    Keepalive,
}

impl Message {
    /// Wrap this message into a wire frame.
    pub fn to_frame(&self) -> Result<Frame, FrameError> {
        match self {
            Message::Data(packet) => Frame::new_data(bincode::serialize(packet)?),
            Message::Request(req) => {
                Frame::new_control(bincode::serialize(&Control::Request(req.clone()))?)
            }
            Message::Response(resp) => {
                Frame::new_control(bincode::serialize(&Control::Response(resp.clone()))?)
            }
            Message::Keepalive => Ok(Frame::new_keepalive()),
        }
    }

    /// Recover a message from a decoded frame.
    pub fn from_frame(frame: Frame) -> Result<Self, FrameError> {
        match frame.frame_type {
            FrameType::Data => Ok(Message::Data(bincode::deserialize(&frame.payload)?)),
            FrameType::Control => match bincode::deserialize(&frame.payload)? {
                Control::Request(req) => Ok(Message::Request(req)),
                Control::Response(resp) => Ok(Message::Response(resp)),
            },
            FrameType::Keepalive if frame.payload.is_empty() => Ok(Message::Keepalive),
            FrameType::Keepalive => Err(FrameError::Unexpected(format!(
                "keepalive frame with {} payload bytes",
                frame.payload.len()
            ))),
        }
    }
}
