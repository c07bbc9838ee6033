//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::transport::ReconnectConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cloud: CloudConfig,

    #[serde(default)]
    pub push: PushConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Dashboard REST backend configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CloudConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_request_timeout() -> u64 {
    10_000
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

/// Push channel configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PushConfig {
    #[serde(default = "default_push_url")]
    pub url: String,

    #[serde(default = "default_reconnect_initial")]
    pub reconnect_initial_ms: u64,

    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_ms: u64,

    /// Give up after this many failed attempts; unset retries forever
    #[serde(default)]
    pub max_retries: Option<u32>,
}

fn default_push_url() -> String {
    "ws://localhost:8000/socket.io/?EIO=3&transport=websocket".to_string()
}

fn default_reconnect_initial() -> u64 {
    1000
}

fn default_reconnect_max() -> u64 {
    30_000
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            url: default_push_url(),
            reconnect_initial_ms: default_reconnect_initial(),
            reconnect_max_ms: default_reconnect_max(),
            max_retries: None,
        }
    }
}

impl PushConfig {
    pub fn reconnect(&self) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(self.reconnect_initial_ms),
            max_delay: Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_initial_ms)),
            max_retries: self.max_retries,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,

    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("xbgw").join("config.toml")),
            Some(PathBuf::from("/etc/xbgw/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                match Self::load_with_env(path) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `XBGW_*` overrides read through `lookup`
    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("XBGW_CLOUD_URL") {
            self.cloud.base_url = url;
        }
        if let Some(timeout) = lookup("XBGW_REQUEST_TIMEOUT_MS") {
            match timeout.parse() {
                Ok(ms) => self.cloud.request_timeout_ms = ms,
                Err(_) => tracing::warn!("Ignoring invalid XBGW_REQUEST_TIMEOUT_MS: {}", timeout),
            }
        }

        if let Some(url) = lookup("XBGW_PUSH_URL") {
            self.push.url = url;
        }

        if let Some(level) = lookup("XBGW_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("XBGW_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# XBee Gateway stream client configuration
#
# Environment variables override these settings:
# - XBGW_CLOUD_URL
# - XBGW_REQUEST_TIMEOUT_MS
# - XBGW_PUSH_URL
# - XBGW_LOG_LEVEL
# - XBGW_LOG_FORMAT

[cloud]
# Dashboard backend base URL
base_url = "http://localhost:8000"

# Request timeout in milliseconds
request_timeout_ms = 10000

[push]
# Socket.IO WebSocket endpoint for live device data
url = "ws://localhost:8000/socket.io/?EIO=3&transport=websocket"

# Delay before the first reconnect (ms), doubled on each failure
reconnect_initial_ms = 1000

# Upper bound on the reconnect delay (ms)
reconnect_max_ms = 30000

# Give up after this many failed attempts (retry forever when unset)
# max_retries = 10

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"

# Optional log file path
# file = "/var/log/xbgw/streams.log"
"#
    .to_string()
}
