//! Type definitions for the tunnel module.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a tunnel.
///
/// The empty identifier is reserved for packets that originate from the
/// virtual interface rather than from a tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TunnelId(pub String);

impl TunnelId {
    /// Mint a fresh identifier.
    pub fn generate() -> Self {
        TunnelId(Uuid::new_v4().to_string())
    }

    /// The interface sentinel.
    pub fn interface() -> Self {
        TunnelId(String::new())
    }

    pub fn is_interface(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_interface() {
            write!(f, "<interface>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<String> for TunnelId {
    fn from(s: String) -> Self {
        TunnelId(s)
    }
}

impl From<&str> for TunnelId {
    fn from(s: &str) -> Self {
        TunnelId(s.to_string())
    }
}

/// Identifier of one transport session, supplied by the transport layer.
///
/// It is what correlates a `Disconnect` request to the tunnel it tears down.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        SessionId(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        SessionId(s.to_string())
    }
}

/// Control-plane state of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// No connect attempt yet, or the last attempt was rejected
    Unconnected,
    /// Credentials are being verified
    Connecting,
    /// Registered and routable
    Connected,
    /// Torn down; terminal
    Disconnected,
}

impl TunnelState {
    /// Whether `self -> next` is a legal edge.
    pub fn can_transition_to(self, next: TunnelState) -> bool {
        use TunnelState::*;
        matches!(
            (self, next),
            (Unconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Unconnected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == TunnelState::Disconnected
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelState::Unconnected => "UNCONNECTED",
            TunnelState::Connecting => "CONNECTING",
            TunnelState::Connected => "CONNECTED",
            TunnelState::Disconnected => "DISCONNECTED",
        };
        f.write_str(name)
    }
}
