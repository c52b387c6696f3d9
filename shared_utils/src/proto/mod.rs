//! Protocol definitions for the overlay server.
//!
//! This module contains the frame codec used on stream transports and the
//! RPC/data-plane messages carried inside those frames.

pub mod framing;
pub mod messages;

pub use messages::{
    AuthType, Call, ConnectRequest, ConnectResponse, DataPacket, DisconnectRequest,
    DisconnectResponse, Message, Reply, Request, Response, RouteRequest, RouteResponse,
    StatusCode,
};
