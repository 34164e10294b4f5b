//! Config loading tests for the echo peer layout.

use serde::Deserialize;
use shmlink_common::config::{
    ConfigError, ConfigLoader, LogLevel, PollStrategy, SharedConfig, TransportConfig,
};
use std::fs;
use tempfile::TempDir;

#[derive(Debug, Deserialize)]
struct PeerConfig {
    shared: SharedConfig,
    #[serde(default)]
    transport: TransportConfig,
}

#[test]
fn full_config_loads() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(
        &path,
        r#"
[shared]
log_level = "debug"
service_name = "shmlink-echo-01"

[transport]
blocking = true
mode = 0o600
liveness_interval = 500
poll = { kind = "yield" }
"#,
    )
    .unwrap();

    let config = PeerConfig::load(&path).unwrap();
    assert_eq!(config.shared.log_level, LogLevel::Debug);
    assert_eq!(config.shared.service_name, "shmlink-echo-01");
    assert_eq!(config.transport.mode, 0o600);
    assert_eq!(config.transport.liveness_interval, 500);
    assert_eq!(config.transport.poll, PollStrategy::Yield);
    assert!(config.transport.validate().is_ok());
}

#[test]
fn missing_transport_table_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, "[shared]\nservice_name = \"echo\"\n").unwrap();

    let config = PeerConfig::load(&path).unwrap();
    assert_eq!(config.transport, TransportConfig::default());
}

#[test]
fn unknown_poll_kind_is_a_parse_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(
        &path,
        "[shared]\nservice_name = \"echo\"\n[transport]\npoll = { kind = \"sleep\" }\n",
    )
    .unwrap();

    assert!(matches!(
        PeerConfig::load(&path),
        Err(ConfigError::ParseError(_))
    ));
}
