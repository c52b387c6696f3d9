//! Error types for the tunnel module.

use std::io;
use thiserror::Error;

use crate::transport::TransportError;
use crate::tunnel::types::TunnelState;

/// Result type for tunnel operations.
pub type TunnelResult<T> = Result<T, TunnelError>;

/// Error types that can occur in tunnel operations.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport layer error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Virtual interface error
    #[error("Interface error: {0}")]
    Interface(String),

    /// Tunnel not found
    #[error("Tunnel not found: {0}")]
    NotFound(String),

    /// Illegal state machine edge
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: TunnelState, to: TunnelState },

    /// Server already shut down
    #[error("Server is shut down")]
    Shutdown,
}
