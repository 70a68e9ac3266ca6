//! Configuration loading for sync-relay.
//!
//! Configuration is loaded from a TOML file (default: `relay.toml`). Every
//! section and field may be omitted.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration for sync-relay.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener and route configuration.
    pub server: ServerConfig,
    /// Session defaults.
    pub sessions: SessionsConfig,
    /// Health ping configuration.
    pub health: HealthConfig,
    /// Lifecycle sweep configuration.
    pub cleanup: CleanupConfig,
    /// Rate limiting configuration.
    pub limits: LimitsConfig,
}

/// Listener and route configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the HTTP server (default: 0.0.0.0:8080).
    pub bind_address: String,
    /// Session CRUD route (default: /sessions).
    pub session_path: String,
    /// Realtime channel route (default: /ws).
    pub channel_path: String,
}

/// How a `request_control` against a held session is resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictResolution {
    /// The current holder keeps control; the requester is refused.
    #[default]
    FirstComeFirstServed,
    /// The requester takes control; the holder is demoted.
    LatestRequestWins,
}

/// Session defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Session time-to-live in seconds (default: 1800 = 30 minutes).
    pub ttl_secs: u64,
    /// Policy for contested control requests.
    pub conflict_resolution: ConflictResolution,
    /// Maximum live connections per session (default: 16).
    pub max_connections_per_session: usize,
}

/// Health ping configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Ping interval in seconds (default: 30).
    pub ping_interval_secs: u64,
}

/// Lifecycle sweep configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Sweep interval in seconds (default: 60).
    pub interval_secs: u64,
    /// Enable the periodic sweep (default: true).
    pub enabled: bool,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum inbound frames per connection per minute (default: 600).
    pub messages_per_minute: u32,
    /// Maximum channel upgrades per second across the relay (default: 50).
    pub upgrades_per_second: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            session_path: "/sessions".to_string(),
            channel_path: "/ws".to_string(),
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 30 * 60,
            conflict_resolution: ConflictResolution::default(),
            max_connections_per_session: 16,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 30,
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            enabled: true,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            messages_per_minute: 600,
            upgrades_per_second: 50,
        }
    }
}

impl SessionsConfig {
    /// Session TTL as a duration.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl HealthConfig {
    /// Ping interval as a duration.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }
}

impl CleanupConfig {
    /// Sweep interval as a duration.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Load from `path` if it exists, otherwise return defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            tracing::info!("Config file {} not found, using defaults", path.display());
            Ok(Self::default())
        }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}
