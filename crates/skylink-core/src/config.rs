/*!
 * Configuration management for skylink.
 *
 * This module loads and validates the settings a host application hands to
 * device sessions: logging, session timing defaults and the list of devices
 * with their transport addresses. Sessions themselves never read files; they
 * receive already-built [`DeviceConfig`] values.
 */
use std::path::Path;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Top-level skylink configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Defaults applied to every session
    #[serde(default)]
    pub session: SessionDefaults,

    /// Devices to open sessions for
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter (trace, debug, info, warn, error or an EnvFilter directive)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to include the event target in log lines
    #[serde(default = "default_true")]
    pub with_target: bool,
}

/// Timing defaults shared by sessions unless a device overrides them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDefaults {
    /// Period of the status poller
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Timeout for a single command round-trip
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Deadline for long-running operations (slews, focus moves, shutter)
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// How long an aborted operation may keep moving before it is declared failed
    #[serde(default = "default_halt_grace_ms")]
    pub halt_grace_ms: u64,

    /// Whether connect() starts the background poller
    #[serde(default = "default_true")]
    pub autopoll: bool,
}

/// One device a session should be opened for
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Human readable name, unique within a configuration
    pub name: String,

    /// Driver name (`frame-focuser`, `step-focuser`, `dome`, `dew-heater`, `alpaca-telescope`)
    pub driver: String,

    /// Numeric device index (Alpaca device number, bus address)
    #[serde(default)]
    pub device_number: u32,

    /// Where the device lives
    pub transport: TransportConfig,

    /// Poll period override
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,

    /// Command timeout override
    #[serde(default)]
    pub command_timeout_ms: Option<u64>,

    /// Operation deadline override
    #[serde(default)]
    pub operation_timeout_ms: Option<u64>,

    /// Mechanical travel limit for focusers
    #[serde(default)]
    pub max_position: Option<i64>,

    /// Park azimuth for domes, in degrees
    #[serde(default)]
    pub park_azimuth: Option<f64>,

    /// Alpaca client id
    #[serde(default)]
    pub client_id: Option<u32>,
}

/// Transport address of a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Local serial or USB-serial port
    Serial {
        /// Device path, e.g. `/dev/ttyUSB0`
        path: String,
        /// Baud rate
        #[serde(default = "default_baud")]
        baud: u32,
    },
    /// Raw TCP socket (serial-over-network adapters)
    Tcp {
        /// Host name or address
        host: String,
        /// TCP port
        port: u16,
    },
    /// ASCOM Alpaca REST endpoint
    Alpaca {
        /// Host name or address
        host: String,
        /// HTTP port
        #[serde(default = "default_alpaca_port")]
        port: u16,
        /// API version in the URL path
        #[serde(default = "default_api_version")]
        api_version: u32,
    },
    /// In-process simulator
    Simulated {
        /// Simulator model name
        model: String,
    },
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            with_target: true,
        }
    }
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
            halt_grace_ms: default_halt_grace_ms(),
            autopoll: true,
        }
    }
}

impl SessionDefaults {
    /// Poll period as a Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Command timeout as a Duration
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Operation deadline as a Duration
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Halt grace period as a Duration
    pub fn halt_grace(&self) -> Duration {
        Duration::from_millis(self.halt_grace_ms)
    }
}

impl DeviceConfig {
    /// Create a device entry with no overrides
    pub fn new<S1: Into<String>, S2: Into<String>>(
        name: S1,
        driver: S2,
        transport: TransportConfig,
    ) -> Self {
        Self {
            name: name.into(),
            driver: driver.into(),
            device_number: 0,
            transport,
            poll_interval_ms: None,
            command_timeout_ms: None,
            operation_timeout_ms: None,
            max_position: None,
            park_azimuth: None,
            client_id: None,
        }
    }

    /// Session timing for this device: the defaults with this entry's overrides applied
    pub fn effective_session(&self, defaults: &SessionDefaults) -> SessionDefaults {
        SessionDefaults {
            poll_interval_ms: self.poll_interval_ms.unwrap_or(defaults.poll_interval_ms),
            command_timeout_ms: self
                .command_timeout_ms
                .unwrap_or(defaults.command_timeout_ms),
            operation_timeout_ms: self
                .operation_timeout_ms
                .unwrap_or(defaults.operation_timeout_ms),
            ..defaults.clone()
        }
    }
}

impl Config {
    /// Check cross-field constraints the deserializer cannot express
    pub fn validate(&self) -> Result<()> {
        if self.session.poll_interval_ms == 0 {
            return Err(Error::config("session.poll_interval_ms must be positive"));
        }
        if self.session.command_timeout_ms == 0 {
            return Err(Error::config("session.command_timeout_ms must be positive"));
        }

        let mut names = std::collections::HashSet::new();
        for device in &self.devices {
            if device.name.trim().is_empty() {
                return Err(Error::config("device name must not be empty"));
            }
            if !names.insert(device.name.as_str()) {
                return Err(Error::config(format!(
                    "duplicate device name: {}",
                    device.name
                )));
            }
            if device.poll_interval_ms == Some(0) {
                return Err(Error::config(format!(
                    "device {}: poll_interval_ms must be positive",
                    device.name
                )));
            }
        }

        Ok(())
    }

    /// Look up a device entry by name
    pub fn device(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.name == name)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_command_timeout_ms() -> u64 {
    3000
}

fn default_operation_timeout_ms() -> u64 {
    60_000
}

fn default_halt_grace_ms() -> u64 {
    5000
}

fn default_baud() -> u32 {
    9600
}

fn default_alpaca_port() -> u16 {
    11111
}

fn default_api_version() -> u32 {
    1
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
    override_with: Option<Config>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Override with an existing config
    pub fn override_with(mut self, config: Config) -> Self {
        self.override_with = Some(config);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        if let Some(config) = self.override_with {
            config.validate()?;
            return Ok(config);
        }

        let mut config_builder = ConfigLib::builder();

        let default_config = Config::default();
        config_builder = config_builder.add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!(
                    "Configuration file {} does not exist, using defaults",
                    config_file
                );
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!(
                "Loading configuration from environment variables with prefix {}",
                prefix
            );
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        let config: Config = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        config.validate()?;

        info!(
            devices = config.devices.len(),
            "Configuration loaded successfully"
        );
        Ok(config)
    }
}
