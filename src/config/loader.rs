//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Load configuration from a JSON file
///
/// # Arguments
///
/// * `path` - Path to the configuration file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}"))
    })?;

    config.validate()?;

    info!(
        "Configuration loaded: tun={} mtu={} tcp_capacity={} udp_capacity={} filter={}",
        config.tunnel.name,
        config.tunnel.mtu,
        config.sessions.tcp_capacity,
        config.sessions.udp_capacity,
        config.filter.enabled
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `TUN_RELAY_TUN_NAME`: Override the TUN interface name
/// - `TUN_RELAY_LOG_LEVEL`: Override log level
/// - `TUN_RELAY_ROUTING_MARK`: Set `SO_MARK` on relay sockets
/// - `TUN_RELAY_FILTER_ENABLED`: Enable or disable the filter (`true`/`false`)
///
/// # Errors
///
/// Returns `ConfigError` if loading or parsing fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    Ok(config)
}

fn apply_env_overrides(
    config: &mut Config,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(name) = lookup("TUN_RELAY_TUN_NAME") {
        config.tunnel.name = name;
        debug!("TUN name overridden to {}", config.tunnel.name);
    }

    if let Some(level) = lookup("TUN_RELAY_LOG_LEVEL") {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Some(mark) = lookup("TUN_RELAY_ROUTING_MARK") {
        let mark = mark.parse().map_err(|_| ConfigError::EnvError {
            name: "TUN_RELAY_ROUTING_MARK".into(),
            reason: format!("Invalid number: {mark}"),
        })?;
        config.protect.routing_mark = Some(mark);
        debug!("Routing mark overridden to {}", mark);
    }

    if let Some(enabled) = lookup("TUN_RELAY_FILTER_ENABLED") {
        config.filter.enabled = enabled.parse().map_err(|_| ConfigError::EnvError {
            name: "TUN_RELAY_FILTER_ENABLED".into(),
            reason: format!("Invalid boolean: {enabled}"),
        })?;
        debug!("Filter enabled overridden to {}", config.filter.enabled);
    }

    // Re-validate after overrides
    config.validate()
}

/// Create a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = Config::default_config();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}
