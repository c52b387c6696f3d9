//! Configuration management module for the overlay server.
//!
//! This module provides functionality for loading, parsing, validating and
//! saving configuration, with environment variable overrides applied on top
//! of the TOML file.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] io::Error),

    /// Error parsing TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Error serializing configuration to TOML
    #[error("Failed to serialize config to TOML: {0}")]
    TomlSerError(#[from] toml::ser::Error),

    /// Invalid configuration value
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),
}

/// Network configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    /// Port for the control/data listener (default: 8080)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Interface to bind to (default: "0.0.0.0")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Maximum number of concurrent sessions (default: 100)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_max_connections() -> usize {
    100
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            port: default_port(),
            bind_address: default_bind_address(),
            max_connections: default_max_connections(),
        }
    }
}

impl NetworkConfig {
    /// `bind_address:port`, bracketing IPv6 literals.
    pub fn listen_address(&self) -> String {
        match self.bind_address.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => format!("[{}]:{}", v6, self.port),
            _ => format!("{}:{}", self.bind_address, self.port),
        }
    }
}

/// Security configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecurityConfig {
    /// Accept `Connect` requests with auth type NONE (default: true)
    #[serde(default = "default_true")]
    pub allow_anonymous: bool,

    /// Hex-encoded key the XOR credential is combined with
    pub xor_key: Option<String>,

    /// Hex-encoded secret the combined XOR credential must equal
    pub xor_secret: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for SecurityConfig {
    fn default() -> Self {
        SecurityConfig {
            allow_anonymous: default_true(),
            xor_key: None,
            xor_secret: None,
        }
    }
}

/// Server-specific configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Interface address and serviced subnet in CIDR form (default: "10.8.0.1/24")
    #[serde(default = "default_subnet")]
    pub subnet: String,

    /// Name requested for the virtual interface (default: "overlay0")
    #[serde(default = "default_interface_name")]
    pub interface_name: String,

    /// MTU of the virtual interface (default: 1400)
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// Capacity of the shared ingress queue (default: 4096)
    #[serde(default = "default_ingress_capacity")]
    pub ingress_capacity: usize,

    /// Per-connection outbound queue capacity (default: 256)
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,

    /// Upper bound for one write to a client, in milliseconds (default: 5000)
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Upper bound for one write to the interface, in milliseconds (default: 1000)
    #[serde(default = "default_interface_write_timeout_ms")]
    pub interface_write_timeout_ms: u64,
}

fn default_subnet() -> String {
    "10.8.0.1/24".to_string()
}

fn default_interface_name() -> String {
    "overlay0".to_string()
}

fn default_mtu() -> u16 {
    1400
}

fn default_ingress_capacity() -> usize {
    4096
}

fn default_outbound_capacity() -> usize {
    256
}

fn default_write_timeout_ms() -> u64 {
    5_000
}

fn default_interface_write_timeout_ms() -> u64 {
    1_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            subnet: default_subnet(),
            interface_name: default_interface_name(),
            mtu: default_mtu(),
            ingress_capacity: default_ingress_capacity(),
            outbound_capacity: default_outbound_capacity(),
            write_timeout_ms: default_write_timeout_ms(),
            interface_write_timeout_ms: default_interface_write_timeout_ms(),
        }
    }
}

impl ServerConfig {
    /// Parsed `subnet`.
    pub fn subnet(&self) -> Result<IpNet, ConfigError> {
        self.subnet.parse().map_err(|e| ConfigError::InvalidValue {
            key: "server.subnet".to_string(),
            message: format!("{}: {e}", self.subnet),
        })
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn interface_write_timeout(&self) -> Duration {
        Duration::from_millis(self.interface_write_timeout_ms)
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Security configuration
    #[serde(default)]
    pub security: SecurityConfig,

    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Log level (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for daily rolling log files; stdout only when unset
    #[serde(default)]
    pub log_dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            network: NetworkConfig::default(),
            security: SecurityConfig::default(),
            server: ServerConfig::default(),
            log_level: default_log_level(),
            log_dir: None,
        }
    }
}

impl Config {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;

        // Environment variables take precedence over the file
        Self::apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(key: &str, message: &str) -> ConfigError {
            ConfigError::InvalidValue {
                key: key.to_string(),
                message: message.to_string(),
            }
        }

        self.server.subnet()?;

        if self.server.ingress_capacity == 0 {
            return Err(invalid("server.ingress_capacity", "must be greater than 0"));
        }
        if self.server.outbound_capacity == 0 {
            return Err(invalid("server.outbound_capacity", "must be greater than 0"));
        }
        if self.server.write_timeout_ms == 0 {
            return Err(invalid("server.write_timeout_ms", "must be greater than 0"));
        }
        if self.server.interface_write_timeout_ms == 0 {
            return Err(invalid(
                "server.interface_write_timeout_ms",
                "must be greater than 0",
            ));
        }
        if self.server.mtu < 576 {
            return Err(invalid("server.mtu", "must be at least 576"));
        }
        if self.network.max_connections == 0 {
            return Err(invalid("network.max_connections", "must be greater than 0"));
        }

        match (&self.security.xor_key, &self.security.xor_secret) {
            (None, None) => {}
            (Some(key), Some(secret)) => {
                if key.is_empty() || !is_hex(key) {
                    return Err(invalid("security.xor_key", "must be non-empty hex"));
                }
                if !is_hex(secret) {
                    return Err(invalid("security.xor_secret", "must be hex"));
                }
            }
            _ => {
                return Err(invalid(
                    "security.xor_key",
                    "xor_key and xor_secret must be set together",
                ))
            }
        }

        if !matches!(
            self.log_level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(invalid(
                "log_level",
                "expected one of trace, debug, info, warn, error",
            ));
        }

        Ok(())
    }

    /// Apply environment variable overrides (prefix: OVERLAY_)
    /// Example keys:
    /// - OVERLAY_LOG_LEVEL, OVERLAY_LOG_DIR
    /// - OVERLAY_NETWORK_PORT, OVERLAY_NETWORK_BIND_ADDRESS, OVERLAY_NETWORK_MAX_CONNECTIONS
    /// - OVERLAY_SECURITY_ALLOW_ANONYMOUS, OVERLAY_SECURITY_XOR_KEY, OVERLAY_SECURITY_XOR_SECRET
    /// - OVERLAY_SERVER_SUBNET, OVERLAY_SERVER_INTERFACE_NAME, OVERLAY_SERVER_MTU,
    ///   OVERLAY_SERVER_INGRESS_CAPACITY, OVERLAY_SERVER_OUTBOUND_CAPACITY,
    ///   OVERLAY_SERVER_WRITE_TIMEOUT_MS, OVERLAY_SERVER_INTERFACE_WRITE_TIMEOUT_MS
    fn apply_env_overrides(cfg: &mut Config) {
        Self::apply_overrides_from(cfg, |key| std::env::var(key).ok());
    }

    fn apply_overrides_from(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
        fn parse_bool(s: &str) -> Option<bool> {
            match s.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "y" => Some(true),
                "false" | "0" | "no" | "n" => Some(false),
                _ => None,
            }
        }

        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());

        // Top-level
        if let Some(v) = non_empty("OVERLAY_LOG_LEVEL") {
            cfg.log_level = v.to_ascii_lowercase();
        }
        if let Some(v) = non_empty("OVERLAY_LOG_DIR") {
            cfg.log_dir = Some(v);
        }

        // Network
        if let Some(n) = non_empty("OVERLAY_NETWORK_PORT").and_then(|v| v.parse().ok()) {
            cfg.network.port = n;
        }
        if let Some(v) = non_empty("OVERLAY_NETWORK_BIND_ADDRESS") {
            cfg.network.bind_address = v;
        }
        if let Some(n) = non_empty("OVERLAY_NETWORK_MAX_CONNECTIONS").and_then(|v| v.parse().ok())
        {
            cfg.network.max_connections = n;
        }

        // Security
        if let Some(b) = non_empty("OVERLAY_SECURITY_ALLOW_ANONYMOUS").and_then(|v| parse_bool(&v))
        {
            cfg.security.allow_anonymous = b;
        }
        if let Some(v) = non_empty("OVERLAY_SECURITY_XOR_KEY") {
            cfg.security.xor_key = Some(v);
        }
        if let Some(v) = non_empty("OVERLAY_SECURITY_XOR_SECRET") {
            cfg.security.xor_secret = Some(v);
        }

        // Server
        if let Some(v) = non_empty("OVERLAY_SERVER_SUBNET") {
            cfg.server.subnet = v;
        }
        if let Some(v) = non_empty("OVERLAY_SERVER_INTERFACE_NAME") {
            cfg.server.interface_name = v;
        }
        if let Some(n) = non_empty("OVERLAY_SERVER_MTU").and_then(|v| v.parse().ok()) {
            cfg.server.mtu = n;
        }
        if let Some(n) = non_empty("OVERLAY_SERVER_INGRESS_CAPACITY").and_then(|v| v.parse().ok())
        {
            cfg.server.ingress_capacity = n;
        }
        if let Some(n) = non_empty("OVERLAY_SERVER_OUTBOUND_CAPACITY").and_then(|v| v.parse().ok())
        {
            cfg.server.outbound_capacity = n;
        }
        if let Some(n) = non_empty("OVERLAY_SERVER_WRITE_TIMEOUT_MS").and_then(|v| v.parse().ok())
        {
            cfg.server.write_timeout_ms = n;
        }
        if let Some(n) =
            non_empty("OVERLAY_SERVER_INTERFACE_WRITE_TIMEOUT_MS").and_then(|v| v.parse().ok())
        {
            cfg.server.interface_write_timeout_ms = n;
        }
    }

    /// Reload configuration from the same file it was loaded from
    pub fn reload(&mut self, path: &Path) -> Result<(), ConfigError> {
        *self = Self::load(path)?;
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("overlay").join("config.toml")
        } else {
            PathBuf::from("config.toml")
        }
    }
}

fn is_hex(s: &str) -> bool {
    s.len() % 2 == 0 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Configuration manager for handling configuration loading and reloading.
#[derive(Debug)]
pub struct ConfigManager {
    /// Current configuration
    config: Config,
    /// Path to the configuration file
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new configuration manager with the default configuration
    pub fn new() -> Self {
        ConfigManager {
            config: Config::new(),
            config_path: Config::default_path(),
        }
    }

    /// Load configuration from the specified path
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let config = Config::load(&path)?;

        Ok(ConfigManager {
            config,
            config_path: path,
        })
    }

    /// Load configuration from the default path
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load(Config::default_path())
    }

    /// Get a reference to the current configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get a mutable reference to the current configuration
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Reload configuration from the current path
    pub fn reload(&mut self) -> Result<(), ConfigError> {
        self.config.reload(&self.config_path)
    }

    /// Save the current configuration to the current path
    pub fn save(&self) -> Result<(), ConfigError> {
        self.config.save(&self.config_path)
    }

    /// Get the current configuration file path
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::new();
        assert_eq!(config.network.port, 8080);
        assert_eq!(config.network.bind_address, "0.0.0.0");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.server.subnet, "10.8.0.1/24");
        assert!(config.security.allow_anonymous);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_listen_address_brackets_ipv6() {
        let mut network = NetworkConfig::default();
        assert_eq!(network.listen_address(), "0.0.0.0:8080");
        network.bind_address = "::1".to_string();
        assert_eq!(network.listen_address(), "[::1]:8080");
    }

    #[test]
    fn test_validation() {
        let mut config = Config::new();
        config.server.subnet = "not-a-subnet".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::new();
        config.server.ingress_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = Config::new();
        config.security.xor_key = Some("a1b2".to_string());
        assert!(config.validate().is_err());

        config.security.xor_secret = Some("zz".to_string());
        assert!(config.validate().is_err());

        config.security.xor_secret = Some("0f0f".to_string());
        assert!(config.validate().is_ok());

        let mut config = Config::new();
        config.log_level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("OVERLAY_NETWORK_PORT", "9443"),
            ("OVERLAY_SECURITY_ALLOW_ANONYMOUS", "no"),
            ("OVERLAY_SERVER_SUBNET", "172.16.0.1/16"),
            ("OVERLAY_SERVER_MTU", "not-a-number"),
            ("OVERLAY_LOG_LEVEL", "DEBUG"),
            ("OVERLAY_LOG_DIR", "/var/log/overlay"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::new();
        Config::apply_overrides_from(&mut config, |key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.network.port, 9443);
        assert!(!config.security.allow_anonymous);
        assert_eq!(config.server.subnet, "172.16.0.1/16");
        assert_eq!(config.server.mtu, 1400);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.log_dir.as_deref(), Some("/var/log/overlay"));
    }
}
