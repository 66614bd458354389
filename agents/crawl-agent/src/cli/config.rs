//! Configuration module
//!
//! Handles loading and validating agent configuration from TOML files.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::agent::runtime::AgentSettings;
use crate::connection::websocket::ReconnectPolicy;

/// Main configuration structure for the Crawl Agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Dispatch server connection settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Task and idle behaviour
    #[serde(default)]
    pub agent: AgentConfig,

    /// Environment signals that feed the client fingerprint
    #[serde(default)]
    pub environment: EnvironmentConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Dispatch server connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// WebSocket URL; the auth token is appended as a query parameter
    #[serde(default = "default_server_url")]
    pub url: String,

    /// Bound on the WebSocket open handshake, in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Heartbeat interval in seconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// First reconnect delay in milliseconds
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_ms: u64,

    /// Reconnect delay cap in milliseconds
    #[serde(default = "default_reconnect_max_interval")]
    pub reconnect_max_interval_ms: u64,

    /// Growth factor between reconnect delays
    #[serde(default = "default_reconnect_multiplier")]
    pub reconnect_multiplier: f64,

    /// Maximum reconnect attempts (0 = infinite)
    #[serde(default)]
    pub max_reconnect_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Task categories announced at registration
    #[serde(default = "default_task_types")]
    pub supported_task_types: Vec<String>,

    /// Bound on a single script execution, in seconds
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,

    /// Inactivity before the user counts as idle, in seconds
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold_secs: u64,

    /// Where identity and credentials are stored. Defaults to the
    /// platform's local data directory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Screen description, e.g. `1920x1080x24`
    #[serde(default)]
    pub screen: String,

    /// Graphics renderer description
    #[serde(default)]
    pub gpu: String,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_server_url() -> String {
    "ws://localhost:8080/ws".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_reconnect_interval() -> u64 {
    5000
}

fn default_reconnect_max_interval() -> u64 {
    60_000
}

fn default_reconnect_multiplier() -> f64 {
    2.0
}

fn default_task_types() -> Vec<String> {
    Vec::new()
}

fn default_task_timeout() -> u64 {
    120
}

fn default_idle_threshold() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: default_server_url(),
            connect_timeout_secs: default_connect_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            reconnect_interval_ms: default_reconnect_interval(),
            reconnect_max_interval_ms: default_reconnect_max_interval(),
            reconnect_multiplier: default_reconnect_multiplier(),
            max_reconnect_attempts: 0,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            supported_task_types: default_task_types(),
            task_timeout_secs: default_task_timeout(),
            idle_threshold_secs: default_idle_threshold(),
            data_dir: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ServerConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial: Duration::from_millis(self.reconnect_interval_ms),
            max: Duration::from_millis(self.reconnect_max_interval_ms),
            multiplier: self.reconnect_multiplier,
            max_attempts: self.max_reconnect_attempts,
        }
    }
}

impl AgentConfig {
    pub fn settings(&self) -> AgentSettings {
        AgentSettings {
            supported_task_types: self.supported_task_types.clone(),
            task_timeout: Duration::from_secs(self.task_timeout_secs),
            idle_threshold: Duration::from_secs(self.idle_threshold_secs),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.server.url.starts_with("ws://") && !self.server.url.starts_with("wss://") {
            bail!("server.url must be a ws:// or wss:// URL, got '{}'", self.server.url);
        }
        if self.server.heartbeat_interval_secs == 0 {
            bail!("server.heartbeat_interval_secs must be positive");
        }
        if self.server.reconnect_interval_ms == 0 {
            bail!("server.reconnect_interval_ms must be positive");
        }
        if self.agent.idle_threshold_secs == 0 {
            bail!("agent.idle_threshold_secs must be positive");
        }
        if self.agent.task_timeout_secs == 0 {
            bail!("agent.task_timeout_secs must be positive");
        }
        match self.logging.format.as_str() {
            "pretty" | "compact" | "json" => Ok(()),
            other => bail!("logging.format must be pretty, compact or json, got '{}'", other),
        }
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }
}
