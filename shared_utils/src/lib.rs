//! Shared utilities for the overlay server.
//!
//! This crate provides the pieces the server core is built from: wire
//! protocol definitions, the connection abstraction with its TCP and
//! in-memory implementations, tunnel identity types, configuration and
//! logging.

pub mod config;
pub mod logging;
pub mod proto;
pub mod tcp;
pub mod transport;
pub mod tunnel;

// Re-export commonly used modules for convenience
pub use config::{Config, ConfigError, ConfigManager};
pub use proto::framing;
pub use transport::{Connection, ConnectionOptions, Listener, TransportError};
pub use tunnel::{SessionId, TunnelError, TunnelId, TunnelResult, TunnelState};
