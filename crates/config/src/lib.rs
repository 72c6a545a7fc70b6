//! Configuration loading, validation, and management for callwire.
//!
//! Loads configuration from `~/.callwire/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.callwire/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Correlation engine settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Transport settings used by the `callwire` binary
    #[serde(default)]
    pub transport: TransportConfig,
}

/// How inbound calls are run once dequeued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Finish each handler before the next inbound envelope is considered.
    #[default]
    Sequential,
    /// Run each handler on its own task.
    Concurrent,
}

impl std::str::FromStr for DispatchMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "concurrent" => Ok(Self::Concurrent),
            other => Err(ConfigError::ValidationError(format!(
                "unknown dispatch mode '{other}' (expected sequential or concurrent)"
            ))),
        }
    }
}

impl std::fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sequential => write!(f, "sequential"),
            Self::Concurrent => write!(f, "concurrent"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// First id this side allocates
    #[serde(default)]
    pub initial_id: u64,

    #[serde(default)]
    pub dispatch: DispatchMode,

    /// Buffer size of the state event bus
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_event_capacity() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_id: 0,
            dispatch: DispatchMode::default(),
            event_capacity: default_event_capacity(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    Stdio,
    Tcp,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdio => write!(f, "stdio"),
            Self::Tcp => write!(f, "tcp"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub kind: TransportKind,

    /// Listen/connect address for the TCP transport
    #[serde(default = "default_address")]
    pub address: String,

    /// Longest accepted inbound line, in bytes
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

fn default_address() -> String {
    "127.0.0.1:7421".into()
}
fn default_max_frame_bytes() -> usize {
    1024 * 1024
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            address: default_address(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default location.
    ///
    /// Falls back to defaults if no config file exists.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `CALLWIRE_*` overrides from an arbitrary lookup.
    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(raw) = lookup("CALLWIRE_INITIAL_ID") {
            self.engine.initial_id = raw.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "CALLWIRE_INITIAL_ID must be a non-negative integer, got '{raw}'"
                ))
            })?;
        }

        if let Some(raw) = lookup("CALLWIRE_DISPATCH") {
            self.engine.dispatch = raw.parse()?;
        }

        if let Some(address) = lookup("CALLWIRE_ADDRESS") {
            self.transport.address = address;
        }

        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".callwire")
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.event_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "engine.event_capacity must be > 0".into(),
            ));
        }

        if self.transport.max_frame_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "transport.max_frame_bytes must be > 0".into(),
            ));
        }

        if self.transport.kind == TransportKind::Tcp && self.transport.address.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "transport.address is required for the tcp transport".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
