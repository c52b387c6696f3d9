//! Error type for engine setup and lifecycle operations.
//!
//! Control-plane outcomes are reported as status codes, never through this
//! type.

use shared_utils::config::ConfigError;
use shared_utils::transport::TransportError;
use shared_utils::tunnel::TunnelError;
use thiserror::Error;

use crate::interface::InterfaceError;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid or inconsistent settings
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    ConfigFile(#[from] ConfigError),

    #[error("Interface error: {0}")]
    Interface(#[from] InterfaceError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Session limit reached; the connection was refused
    #[error("Session limit of {0} reached")]
    SessionLimit(usize),

    #[error("Server already started")]
    AlreadyStarted,
}
