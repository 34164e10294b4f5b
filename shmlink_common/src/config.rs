//! Configuration loading traits and types.
//!
//! Every shmlink component reads its settings from a TOML file through the
//! [`ConfigLoader`] blanket implementation.
//!
//! # Usage
//!
//! ```rust,no_run
//! use shmlink_common::config::{ConfigError, ConfigLoader, SharedConfig, TransportConfig};
//! use serde::Deserialize;
//! use std::path::Path;
//!
//! #[derive(Debug, Deserialize)]
//! struct MyAppConfig {
//!     shared: SharedConfig,
//!     #[serde(default)]
//!     transport: TransportConfig,
//! }
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = MyAppConfig::load(Path::new("config.toml"))?;
//!     config.transport.validate()?;
//!     println!("Service: {}", config.shared.service_name);
//!     Ok(())
//! }
//! ```

use crate::consts::{DEFAULT_SHM_MODE, LIVENESS_CHECK_INTERVAL};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
///
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, detailed tracing information.
    Trace,
    /// Debug information useful during development.
    Debug,
    /// General information about application operation.
    #[default]
    Info,
    /// Warning messages for potentially problematic situations.
    Warn,
    /// Error messages for serious problems.
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub const fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Common configuration fields shared across all shmlink applications.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "shmlink-echo-01"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Application instance identifier.
    pub service_name: String,
}

impl SharedConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if `service_name` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// How a blocking transport call waits between two empty polling passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum PollStrategy {
    /// Pure busy loop. Lowest latency, one core at 100%.
    #[default]
    Spin,
    /// Yield the time slice on every empty pass.
    Yield,
    /// Spin with `spin_loop` hints for `spins` passes, then yield.
    Backoff {
        /// Number of hinted spins before the first yield.
        spins: u32,
    },
}

/// Shared memory transport settings.
///
/// # TOML Example
///
/// ```toml
/// [transport]
/// blocking = true
/// mode = 0o600
/// liveness_interval = 10000
/// poll = { kind = "backoff", spins = 64 }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Blocking (busy polling) or non-blocking reads and writes.
    pub blocking: bool,
    /// Permission bits of the shared memory object.
    pub mode: u32,
    /// Loop iterations between two liveness checks of the socket.
    pub liveness_interval: u64,
    /// Waiting strategy of blocking calls.
    pub poll: PollStrategy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            blocking: true,
            mode: DEFAULT_SHM_MODE,
            liveness_interval: LIVENESS_CHECK_INTERVAL,
            poll: PollStrategy::Spin,
        }
    }
}

impl TransportConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - `liveness_interval` is zero
    /// - `mode` has bits outside `0o777`
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.liveness_interval == 0 {
            return Err(ConfigError::ValidationError(
                "liveness_interval must be greater than zero".to_string(),
            ));
        }
        if self.mode & !0o777 != 0 {
            return Err(ConfigError::ValidationError(format!(
                "mode {:#o} has bits outside 0o777",
                self.mode
            )));
        }
        Ok(())
    }
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

// Blanket implementation: any serde-deserializable struct can be loaded.
impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}
