//! Core of the overlay server.
//!
//! The [`registry`] tracks live tunnels and the addresses they own, the
//! [`control`] plane is its only writer, and the [`dispatcher`] routes packets
//! between the virtual [`interface`] and the tunnels. [`server`] wires them
//! together around a transport listener.

pub mod auth;
pub mod control;
pub mod dispatcher;
mod error;
pub mod interface;
pub mod packet;
pub mod registry;
pub mod rpc;
pub mod server;

pub use auth::{Authenticator, StaticAuthenticator};
pub use control::{ControlPlane, TeardownReason};
pub use dispatcher::{DispatchStats, Ingress, StatsSnapshot};
pub use error::{EngineError, EngineResult};
pub use interface::{InterfaceError, MemoryInterface, TunInterface, VirtualInterface};
pub use registry::{IpClaim, TunnelRegistry};
pub use server::{Server, ServerSettings};
