//! Tunnel identifiers, lifecycle states and errors.

mod error;
pub mod types;

pub use error::{TunnelError, TunnelResult};
pub use types::{SessionId, TunnelId, TunnelState};
