//! Configuration management for Headlock
//!
//! Handles loading the server and session settings from a TOML file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::session::{CoordinatorConfig, DEFAULT_EVENT_CAPACITY};

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Listener settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Session and rendezvous settings
    #[serde(default)]
    pub sessions: SessionsConfig,
    /// General application settings
    #[serde(default)]
    pub general: GeneralConfig,
}

/// Listener configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind
    pub bind: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8765,
        }
    }
}

/// Session policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Default agent wait timeout (seconds); unset waits forever
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_timeout_secs: Option<u64>,
    /// Maximum number of registered sessions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_sessions: Option<usize>,
    /// Buffer size of each event channel
    pub event_capacity: usize,
    /// Terminate sessions stuck in PROCESSING this long (seconds)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_timeout_secs: Option<u64>,
    /// Evict finished sessions after this long (seconds)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention_secs: Option<u64>,
    /// How often the maintenance task runs (seconds)
    pub reap_interval_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            wait_timeout_secs: None,
            max_sessions: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            processing_timeout_secs: None,
            retention_secs: None,
            reap_interval_secs: 60,
        }
    }
}

impl SessionsConfig {
    /// Coordinator constructor parameters
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            default_wait_timeout: self.wait_timeout_secs.map(Duration::from_secs),
            max_sessions: self.max_sessions,
            event_capacity: self.event_capacity,
        }
    }

    pub fn processing_timeout(&self) -> Option<Duration> {
        self.processing_timeout_secs.map(Duration::from_secs)
    }

    pub fn retention(&self) -> Option<Duration> {
        self.retention_secs.map(Duration::from_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }

    /// Whether any maintenance pass is enabled
    pub fn maintenance_enabled(&self) -> bool {
        self.processing_timeout_secs.is_some() || self.retention_secs.is_some()
    }
}

/// General application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Configuration manager for loading config
pub struct ConfigManager {
    config_path: PathBuf,
    config: Config,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Self::with_path(config_path)
    }

    /// Create a config manager with a specific path
    pub fn with_path(config_path: PathBuf) -> Result<Self> {
        let config = if config_path.exists() {
            Self::load_from_path(&config_path)?
        } else {
            Config::default()
        };

        Ok(Self { config_path, config })
    }

    /// Get the default config path
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Could not find config directory".to_string()))?;

        Ok(config_dir.join("headlock").join("config.toml"))
    }

    /// Load configuration from a file
    fn load_from_path(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Get the current configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Consume the manager, keeping the configuration
    pub fn into_config(self) -> Config {
        self.config
    }
}
