//! Persistence: the daemon keeps no runtime state on disk, only its TOML
//! configuration.

pub mod config;

pub use config::{load_config, save_config, AppConfig, ConfigError};
