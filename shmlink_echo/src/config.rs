//! Echo peer configuration.
//!
//! # TOML Example
//!
//! ```toml
//! socket = "/tmp/shmlink.sock"
//!
//! [shared]
//! service_name = "shmlink-echo-01"
//!
//! [transport]
//! mode = 0o600
//! ```

use serde::Deserialize;
use shmlink::config::{ConfigError, SharedConfig, TransportConfig};
use std::path::PathBuf;

/// Default listening socket.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/shmlink.sock";

/// Top-level layout of `echo.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct EchoConfig {
    /// Common service settings.
    pub shared: SharedConfig,

    /// Transport settings applied to every accepted connection.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Unix socket to listen on.
    #[serde(default = "default_socket")]
    pub socket: PathBuf,
}

fn default_socket() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_PATH)
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            shared: SharedConfig {
                log_level: Default::default(),
                service_name: "shmlink-echo".to_string(),
            },
            transport: TransportConfig::default(),
            socket: default_socket(),
        }
    }
}

impl EchoConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;
        self.transport.validate()?;
        if self.socket.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "socket path cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}
