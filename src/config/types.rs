//! Configuration types for tun-relay
//!
//! This module defines all configuration structures used by the relay.
//! Every section has defaults, so an empty JSON object is a valid config.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Bytes of IPv4 + TCP header on every synthesized segment
const SEGMENT_HEADER_LEN: u16 = 40;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Virtual interface settings
    #[serde(default)]
    pub tunnel: TunnelConfig,

    /// Session table sizing and socket timeouts
    #[serde(default)]
    pub sessions: SessionConfig,

    /// Buffer pool configuration
    #[serde(default)]
    pub pool: PoolConfig,

    /// Worker loop timing
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Destination filter
    #[serde(default)]
    pub filter: FilterConfig,

    /// Socket protection applied to every relay socket
    #[serde(default)]
    pub protect: ProtectConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tunnel.validate()?;
        self.sessions.validate()?;
        self.pool.validate()?;
        self.workers.validate()?;
        self.filter.validate()?;
        self.protect.validate()?;
        self.log.validate()?;

        // A full-size segment must fit in one pooled buffer
        if usize::from(self.tunnel.mtu) > self.pool.buffer_size {
            return Err(ConfigError::ValidationError(format!(
                "tunnel.mtu {} exceeds pool.buffer_size {}",
                self.tunnel.mtu, self.pool.buffer_size
            )));
        }

        Ok(())
    }

    /// Create the default configuration
    #[must_use]
    pub fn default_config() -> Self {
        Self::default()
    }
}

/// Virtual interface configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TunnelConfig {
    /// Interface name opened by the binary
    #[serde(default = "default_tun_name")]
    pub name: String,

    /// Address assigned to the interface
    #[serde(default = "default_tun_address")]
    pub address: Ipv4Addr,

    /// Interface prefix length
    #[serde(default = "default_prefix_len")]
    pub prefix_len: u8,

    /// Route captured by the interface, in CIDR notation
    #[serde(default = "default_route")]
    pub route: String,

    /// Interface MTU
    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            name: default_tun_name(),
            address: default_tun_address(),
            prefix_len: default_prefix_len(),
            route: default_route(),
            mtu: default_mtu(),
        }
    }
}

impl TunnelConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() || self.name.len() >= 16 {
            return Err(ConfigError::ValidationError(format!(
                "tunnel.name must be 1-15 bytes, got {:?}",
                self.name
            )));
        }
        if self.prefix_len > 32 {
            return Err(ConfigError::ValidationError(format!(
                "tunnel.prefix_len must be <= 32, got {}",
                self.prefix_len
            )));
        }
        self.route_parts()?;
        if self.mtu <= SEGMENT_HEADER_LEN {
            return Err(ConfigError::ValidationError(format!(
                "tunnel.mtu must exceed {SEGMENT_HEADER_LEN}, got {}",
                self.mtu
            )));
        }
        Ok(())
    }

    /// Split `route` into network address and prefix length
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the route is not IPv4 CIDR.
    pub fn route_parts(&self) -> Result<(Ipv4Addr, u8), ConfigError> {
        let invalid = || ConfigError::ValidationError(format!("Invalid tunnel.route: {}", self.route));

        let (addr, prefix) = self.route.split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        if prefix > 32 {
            return Err(invalid());
        }
        Ok((addr, prefix))
    }

    /// Largest payload carried by one network-to-device TCP segment
    #[must_use]
    pub fn max_segment_payload(&self) -> usize {
        usize::from(self.mtu.saturating_sub(SEGMENT_HEADER_LEN))
    }
}

/// Session table configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Maximum number of live TCP control blocks
    #[serde(default = "default_capacity")]
    pub tcp_capacity: usize,

    /// Maximum number of live UDP sessions
    #[serde(default = "default_capacity")]
    pub udp_capacity: usize,

    /// Device payload held per flow while its relay socket is not writable.
    ///
    /// Segments beyond this are left unacknowledged so the device
    /// retransmits them later.
    #[serde(default = "default_write_backlog")]
    pub write_backlog: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tcp_capacity: default_capacity(),
            udp_capacity: default_capacity(),
            write_backlog: default_write_backlog(),
        }
    }
}

impl SessionConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.tcp_capacity == 0 || self.udp_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "sessions.tcp_capacity and sessions.udp_capacity must be > 0".into(),
            ));
        }
        if self.write_backlog == 0 {
            return Err(ConfigError::ValidationError(
                "sessions.write_backlog must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Buffer pool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Fixed size of every pooled buffer
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Number of buffers allocated at start
    #[serde(default)]
    pub prewarm: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            prewarm: 0,
        }
    }
}

impl PoolConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        // An IPv4 datagram never exceeds 64 KiB
        if !(1500..=65_535).contains(&self.buffer_size) {
            return Err(ConfigError::ValidationError(format!(
                "pool.buffer_size must be within 1500-65535, got {}",
                self.buffer_size
            )));
        }
        Ok(())
    }
}

/// Worker timing configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Idle back-off of the pump and output workers (ms)
    #[serde(default = "default_idle_sleep_ms")]
    pub idle_sleep_ms: u64,

    /// Upper bound on one readiness wait (ms)
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_sleep_ms: default_idle_sleep_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

impl WorkerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_sleep_ms == 0 || self.poll_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "workers.idle_sleep_ms and workers.poll_timeout_ms must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Get the idle sleep as a Duration
    #[must_use]
    pub const fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    /// Get the poll timeout as a Duration
    #[must_use]
    pub const fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Destination filter configuration
///
/// Packets are matched by a lookup key derived from their destination
/// address. With `resolve_hostnames` off (the default) the key is the dotted
/// IPv4 literal, so only address entries in the lists can match; hostname
/// entries need `resolve_hostnames`, which performs a cached reverse lookup
/// per destination.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilterConfig {
    /// Consult the filter for every packet
    #[serde(default)]
    pub enabled: bool,

    /// Base deny list (hosts-file format accepted)
    #[serde(default)]
    pub hosts_file: Option<PathBuf>,

    /// Entries forced to allow
    #[serde(default)]
    pub whitelist_file: Option<PathBuf>,

    /// Entries forced to deny, applied last
    #[serde(default)]
    pub blacklist_file: Option<PathBuf>,

    /// Look up the destination's hostname instead of its address literal.
    ///
    /// Required for hostname list entries to match.
    #[serde(default)]
    pub resolve_hostnames: bool,

    /// TTL of cached reverse lookups (seconds)
    #[serde(default = "default_resolve_cache_ttl_secs")]
    pub resolve_cache_ttl_secs: u64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            hosts_file: None,
            whitelist_file: None,
            blacklist_file: None,
            resolve_hostnames: false,
            resolve_cache_ttl_secs: default_resolve_cache_ttl_secs(),
        }
    }
}

impl FilterConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.resolve_hostnames && self.resolve_cache_ttl_secs == 0 {
            return Err(ConfigError::ValidationError(
                "filter.resolve_cache_ttl_secs must be > 0 when resolve_hostnames is set".into(),
            ));
        }
        Ok(())
    }

    /// Get the resolver cache TTL as a Duration
    #[must_use]
    pub const fn resolve_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.resolve_cache_ttl_secs)
    }
}

/// Socket protection configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProtectConfig {
    /// `SO_MARK` applied to every relay socket
    #[serde(default)]
    pub routing_mark: Option<u32>,

    /// `SO_BINDTODEVICE` applied to every relay socket
    #[serde(default)]
    pub bind_interface: Option<String>,
}

impl ProtectConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(iface) = &self.bind_interface {
            if iface.is_empty() || iface.len() >= 16 {
                return Err(ConfigError::ValidationError(format!(
                    "protect.bind_interface must be 1-15 bytes, got {iface:?}"
                )));
            }
        }
        Ok(())
    }

    /// Whether any protection is configured
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.routing_mark.is_some() || self.bind_interface.is_some()
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit one tracing event per relayed packet
    #[serde(default)]
    pub packets: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            packets: false,
        }
    }
}

impl LogConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        match self.level.to_ascii_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" | "off" => Ok(()),
            other => Err(ConfigError::ValidationError(format!(
                "Invalid log level: {other}"
            ))),
        }
    }
}

// Default value functions for serde

fn default_tun_name() -> String {
    "tun-relay0".into()
}

const fn default_tun_address() -> Ipv4Addr {
    Ipv4Addr::new(10, 1, 10, 1)
}

const fn default_prefix_len() -> u8 {
    32
}

fn default_route() -> String {
    "0.0.0.0/0".into()
}

const fn default_mtu() -> u16 {
    1500
}

const fn default_capacity() -> usize {
    50
}

const fn default_write_backlog() -> usize {
    256 * 1024
}

const fn default_buffer_size() -> usize {
    16 * 1024
}

const fn default_idle_sleep_ms() -> u64 {
    10
}

const fn default_poll_timeout_ms() -> u64 {
    100
}

const fn default_resolve_cache_ttl_secs() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".into()
}
