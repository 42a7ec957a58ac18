//! Configuration module for tun-relay
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use tun_relay::config::load_config;
//!
//! let config = load_config("/etc/tun-relay/config.json").unwrap();
//! println!("TUN device: {}", config.tunnel.name);
//! ```

mod loader;
mod types;

pub use loader::{create_default_config, load_config, load_config_str, load_config_with_env};
pub use types::{
    Config, FilterConfig, LogConfig, PoolConfig, ProtectConfig, SessionConfig, TunnelConfig,
    WorkerConfig,
};
