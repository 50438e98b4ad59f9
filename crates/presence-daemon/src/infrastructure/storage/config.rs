//! TOML-based configuration for the presence daemon.
//!
//! Reads and writes [`AppConfig`] at the platform-appropriate location:
//! - Linux:    `~/.config/presenced/config.toml`
//! - macOS:    `~/Library/Application Support/Presenced/config.toml`
//! - Windows:  `%APPDATA%\Presenced\config.toml`
//!
//! Every field carries a `#[serde(default = ...)]` function so the daemon
//! works on first run (no file yet) and when upgrading from an older file
//! missing newer fields.  Durations are written in whole seconds and
//! converted once at startup; all internal liveness arithmetic is in
//! milliseconds.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level daemon configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub handshake: HandshakeConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub radio: RadioConfig,
}

/// General daemon behaviour settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonConfig {
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Device liveness thresholds (§4.1 sweep semantics).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LivenessConfig {
    /// Age at which an unseen device is marked stale and queued for recheck.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// Age at which an unseen device is evicted entirely.
    #[serde(default = "default_evict_after_secs")]
    pub evict_after_secs: u64,
    /// Cadence of the registry sweep.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Handshake per-state deadlines.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandshakeConfig {
    /// Deadline for states waiting on the wearable.
    #[serde(default = "default_device_timeout_secs")]
    pub device_timeout_secs: u64,
    /// Deadline for states waiting on the Oracle (network calls are slower).
    #[serde(default = "default_oracle_timeout_secs")]
    pub oracle_timeout_secs: u64,
}

/// Trust authority endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OracleConfig {
    #[serde(default = "default_oracle_base_url")]
    pub base_url: String,
}

/// Front-end relay socket settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayConfig {
    #[serde(default = "default_relay_port")]
    pub port: u16,
    #[serde(default = "default_relay_bind_address")]
    pub bind_address: String,
    /// Cadence of registry snapshot pushes to the front-end.
    #[serde(default = "default_relay_update_interval_secs")]
    pub update_interval_secs: u64,
}

/// GATT identifiers of the wearable's user service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RadioConfig {
    #[serde(default = "default_service_uuid")]
    pub service_uuid: String,
    #[serde(default = "default_read_characteristic")]
    pub read_characteristic: String,
    #[serde(default = "default_write_characteristic")]
    pub write_characteristic: String,
    #[serde(default = "default_disconnect_characteristic")]
    pub disconnect_characteristic: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_stale_after_secs() -> u64 {
    15
}
fn default_evict_after_secs() -> u64 {
    60
}
fn default_sweep_interval_secs() -> u64 {
    5
}
fn default_device_timeout_secs() -> u64 {
    5
}
fn default_oracle_timeout_secs() -> u64 {
    7
}
fn default_oracle_base_url() -> String {
    "http://contexte.herokuapp.com".to_string()
}
fn default_relay_port() -> u16 {
    5001
}
fn default_relay_bind_address() -> String {
    "127.0.0.1".to_string()
}
fn default_relay_update_interval_secs() -> u64 {
    5
}
fn default_service_uuid() -> String {
    crate::infrastructure::radio::USER_SERVICE_UUID.to_string()
}
fn default_read_characteristic() -> String {
    crate::infrastructure::radio::READ_CHARACTERISTIC_UUID.to_string()
}
fn default_write_characteristic() -> String {
    crate::infrastructure::radio::WRITE_CHARACTERISTIC_UUID.to_string()
}
fn default_disconnect_characteristic() -> String {
    crate::infrastructure::radio::DISCONNECT_CHARACTERISTIC_UUID.to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
            evict_after_secs: default_evict_after_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            device_timeout_secs: default_device_timeout_secs(),
            oracle_timeout_secs: default_oracle_timeout_secs(),
        }
    }
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            base_url: default_oracle_base_url(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: default_relay_port(),
            bind_address: default_relay_bind_address(),
            update_interval_secs: default_relay_update_interval_secs(),
        }
    }
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            service_uuid: default_service_uuid(),
            read_characteristic: default_read_characteristic(),
            write_characteristic: default_write_characteristic(),
            disconnect_characteristic: default_disconnect_characteristic(),
        }
    }
}

// ── Duration accessors ────────────────────────────────────────────────────────

impl LivenessConfig {
    pub fn stale_after_ms(&self) -> u64 {
        self.stale_after_secs * 1_000
    }
    pub fn evict_after_ms(&self) -> u64 {
        self.evict_after_secs * 1_000
    }
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl HandshakeConfig {
    pub fn device_timeout(&self) -> Duration {
        Duration::from_secs(self.device_timeout_secs)
    }
    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_secs(self.oracle_timeout_secs)
    }
}

impl RelayConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot
/// be determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Loads [`AppConfig`] from `path` if given, else from the platform default
/// location, returning `AppConfig::default()` if no file exists yet.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: Option<PathBuf>) -> Result<AppConfig, ConfigError> {
    let path = match path {
        Some(path) => path,
        None => config_file_path()?,
    };

    match std::fs::read_to_string(&path) {
        Ok(content) => {
            let cfg: AppConfig = toml::from_str(&content)?;
            Ok(cfg)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(e) => Err(ConfigError::Io { path, source: e }),
    }
}

/// Persists `config` to the platform default location, creating the config
/// directory if needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(config: &AppConfig) -> Result<(), ConfigError> {
    let path = config_file_path()?;

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(&path, content).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(())
}

/// Resolves the platform config base directory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("Presenced"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("presenced"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("Presenced")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
