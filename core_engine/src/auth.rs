//! Credential checks behind the `Connect` auth-type selector.

use async_trait::async_trait;
use shared_utils::config::SecurityConfig;
use shared_utils::proto::AuthType;
use tracing::{debug, warn};

use crate::EngineError;

/// Decides whether a `Connect` credential is acceptable.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn verify(&self, auth_type: AuthType, data: &str) -> bool;
}

/// Authenticator backed by values from the `[security]` config section.
///
/// `Xor` credentials are hex strings; the decoded bytes, XORed with the
/// repeating key, must equal the configured secret.
#[derive(Debug, Clone)]
pub struct StaticAuthenticator {
    allow_anonymous: bool,
    xor: Option<XorCredential>,
}

#[derive(Clone)]
struct XorCredential {
    key: Vec<u8>,
    secret: Vec<u8>,
}

impl std::fmt::Debug for XorCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XorCredential")
            .field("key_len", &self.key.len())
            .field("secret_len", &self.secret.len())
            .finish()
    }
}

impl StaticAuthenticator {
    /// Accepts `None`, rejects `Xor`.
    pub fn anonymous() -> Self {
        StaticAuthenticator {
            allow_anonymous: true,
            xor: None,
        }
    }

    pub fn new(allow_anonymous: bool) -> Self {
        StaticAuthenticator {
            allow_anonymous,
            xor: None,
        }
    }

    /// Enable `Xor` credentials.
    pub fn with_xor(mut self, key: Vec<u8>, secret: Vec<u8>) -> Result<Self, EngineError> {
        if key.is_empty() {
            return Err(EngineError::Config("XOR key must not be empty".to_string()));
        }
        self.xor = Some(XorCredential { key, secret });
        Ok(self)
    }

    pub fn from_config(security: &SecurityConfig) -> Result<Self, EngineError> {
        let auth = Self::new(security.allow_anonymous);
        match (&security.xor_key, &security.xor_secret) {
            (Some(key), Some(secret)) => {
                let key = hex::decode(key)
                    .map_err(|e| EngineError::Config(format!("security.xor_key: {e}")))?;
                let secret = hex::decode(secret)
                    .map_err(|e| EngineError::Config(format!("security.xor_secret: {e}")))?;
                auth.with_xor(key, secret)
            }
            _ => Ok(auth),
        }
    }

    fn verify_xor(&self, data: &str) -> bool {
        let Some(xor) = &self.xor else {
            warn!("XOR credential presented but no XOR key is configured");
            return false;
        };
        let Ok(credential) = hex::decode(data.trim()) else {
            debug!("XOR credential is not valid hex");
            return false;
        };
        if credential.len() != xor.secret.len() {
            return false;
        }

        // Fold differences instead of short-circuiting on the first mismatch
        credential
            .iter()
            .zip(xor.key.iter().cycle())
            .zip(xor.secret.iter())
            .fold(0u8, |acc, ((c, k), s)| acc | ((c ^ k) ^ s))
            == 0
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn verify(&self, auth_type: AuthType, data: &str) -> bool {
        match auth_type {
            AuthType::None => self.allow_anonymous,
            AuthType::Xor => self.verify_xor(data),
        }
    }
}
