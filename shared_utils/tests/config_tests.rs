use shared_utils::config::{Config, ConfigError, ConfigManager};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

#[test]
fn test_load_valid_server_config() {
    let mut file = NamedTempFile::new().unwrap();

    let config_str = r#"
        log_level = "debug"

        [network]
        port = 9090
        bind_address = "127.0.0.1"
        max_connections = 200

        [security]
        allow_anonymous = false
        xor_key = "a1b2c3"
        xor_secret = "0f0f0f"

        [server]
        subnet = "10.0.0.1/24"
        interface_name = "ovl7"
        mtu = 1380
        ingress_capacity = 128
        outbound_capacity = 16
        write_timeout_ms = 250
    "#;

    file.write_all(config_str.as_bytes()).unwrap();

    let config = Config::load(file.path()).unwrap();

    assert_eq!(config.log_level, "debug");
    assert_eq!(config.network.port, 9090);
    assert_eq!(config.network.bind_address, "127.0.0.1");
    assert_eq!(config.network.max_connections, 200);
    assert!(!config.security.allow_anonymous);
    assert_eq!(config.security.xor_key, Some("a1b2c3".to_string()));
    assert_eq!(config.server.subnet, "10.0.0.1/24");
    assert_eq!(config.server.interface_name, "ovl7");
    assert_eq!(config.server.mtu, 1380);
    assert_eq!(config.server.ingress_capacity, 128);
    assert_eq!(config.server.outbound_capacity, 16);
    assert_eq!(config.server.write_timeout(), Duration::from_millis(250));
    // Unspecified keys keep their defaults
    assert_eq!(config.server.interface_write_timeout_ms, 1_000);
}

#[test]
fn test_load_minimal_config() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"log_level = \"warn\"\n").unwrap();

    let config = Config::load(file.path()).unwrap();

    assert_eq!(config.log_level, "warn");
    assert_eq!(config.network.port, 8080);
    assert_eq!(config.server.subnet, "10.8.0.1/24");
    let subnet = config.server.subnet().unwrap();
    assert_eq!(subnet.netmask().to_string(), "255.255.255.0");
}

#[test]
fn test_load_invalid_subnet() {
    let mut file = NamedTempFile::new().unwrap();

    let config_str = r#"
        [server]
        subnet = "10.0.0.300/24"
    "#;

    file.write_all(config_str.as_bytes()).unwrap();

    let result = Config::load(file.path());
    assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
}

#[test]
fn test_load_half_configured_xor() {
    let mut file = NamedTempFile::new().unwrap();

    let config_str = r#"
        [security]
        xor_key = "aabb"
    "#;

    file.write_all(config_str.as_bytes()).unwrap();

    let result = Config::load(file.path());
    assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
}

#[test]
fn test_load_malformed_toml() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"[network\nport = 1").unwrap();

    let result = Config::load(file.path());
    assert!(matches!(result, Err(ConfigError::TomlError(_))));
}

#[test]
fn test_load_missing_file() {
    let result = Config::load("/nonexistent/path/config.toml");
    assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
}

#[test]
fn test_save_and_reload() {
    let file = NamedTempFile::new().unwrap();

    let mut config = Config::new();
    config.network.port = 7000;
    config.server.subnet = "192.168.77.1/24".to_string();
    config.save(file.path()).unwrap();

    let loaded = Config::load(file.path()).unwrap();
    assert_eq!(loaded.network.port, 7000);
    assert_eq!(loaded.server.subnet, "192.168.77.1/24");
}

#[test]
fn test_config_manager() {
    let file = NamedTempFile::new().unwrap();
    Config::new().save(file.path()).unwrap();

    let mut manager = ConfigManager::load(file.path()).unwrap();
    assert_eq!(manager.config_path(), file.path());

    manager.config_mut().network.max_connections = 5;
    manager.save().unwrap();

    manager.config_mut().network.max_connections = 99;
    manager.reload().unwrap();
    assert_eq!(manager.config().network.max_connections, 5);
}
