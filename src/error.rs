//! Error types for tun-relay
//!
//! This module defines the error hierarchy for the relay engine.
//! Errors are grouped by subsystem and carry a recoverability hint: per-flow
//! failures are recoverable (only the affected session dies), while failures
//! of the virtual interface or a readiness multiplexer stop the engine.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type for tun-relay
#[derive(Debug, Error)]
pub enum RelayError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Malformed datagram read from the virtual interface
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    /// Virtual interface, multiplexer and worker errors
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Per-flow socket errors
    #[error("Flow error: {0}")]
    Flow(#[from] FlowError),

    /// Filter list errors
    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Check if this error is recoverable (the engine keeps running)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(e) => e.is_recoverable(),
            Self::Packet(e) => e.is_recoverable(),
            Self::Tunnel(e) => e.is_recoverable(),
            Self::Flow(e) => e.is_recoverable(),
            Self::Filter(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Errors raised while decoding or encoding a datagram
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    /// Fewer bytes than the header being parsed requires
    #[error("Truncated packet: need {needed} bytes, have {actual}")]
    Truncated { needed: usize, actual: usize },

    /// IP version other than 4
    #[error("Unsupported IP version {0}")]
    UnsupportedVersion(u8),

    /// IHL below the 20-byte minimum
    #[error("Invalid IPv4 header length {0}")]
    InvalidHeaderLength(usize),

    /// TCP data offset below the 20-byte minimum
    #[error("Invalid TCP data offset {0}")]
    InvalidDataOffset(usize),

    /// Output buffer cannot hold the segment being written
    #[error("Buffer too small: need {needed} bytes, capacity {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },

    /// Template carries no header for the requested transport
    #[error("Template is not a {0} packet")]
    WrongTransport(&'static str),
}

impl PacketError {
    /// A malformed packet is dropped on its own; the engine continues
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        true
    }

    /// Create a truncation error
    pub const fn truncated(needed: usize, actual: usize) -> Self {
        Self::Truncated { needed, actual }
    }
}

/// Virtual interface and worker errors
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Failed to open or configure the TUN device
    #[error("Failed to open TUN device {name}: {reason}")]
    Open { name: String, reason: String },

    /// Read or write on the TUN device failed
    #[error("TUN I/O error: {0}")]
    Io(#[from] io::Error),

    /// The readiness wait itself failed
    #[error("{worker} multiplexer failed: {source}")]
    Multiplexer {
        worker: &'static str,
        #[source]
        source: io::Error,
    },

    /// A worker thread could not be started
    #[error("Failed to spawn worker {worker}: {reason}")]
    Spawn { worker: &'static str, reason: String },
}

impl TunnelError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Open { .. } => false,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
            Self::Multiplexer { .. } => false,
            Self::Spawn { .. } => false,
        }
    }

    /// Create a multiplexer failure for the named worker
    pub fn multiplexer(worker: &'static str, source: io::Error) -> Self {
        Self::Multiplexer { worker, source }
    }

    /// Create an open error
    pub fn open(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Open {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Errors confined to a single relayed flow
#[derive(Debug, Error)]
pub enum FlowError {
    /// Socket creation or connect failed
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The protect hook or a socket option failed
    #[error("Failed to set socket option {option}: {reason}")]
    SocketOption { option: String, reason: String },

    /// Writing to the real socket failed
    #[error("Write to {addr} failed: {source}")]
    Write {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Updating readiness interest for the real socket failed
    #[error("Failed to register {addr} for readiness: {source}")]
    Register {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

impl FlowError {
    /// Per-flow errors only terminate the affected session
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        true
    }

    /// Create a socket option error
    pub fn socket_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SocketOption {
            option: option.into(),
            reason: reason.into(),
        }
    }
}

/// Filter list errors
#[derive(Debug, Error)]
pub enum FilterError {
    /// A list file could not be read
    #[error("Failed to read filter list {path}: {source}")]
    ListRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FilterError {
    /// A missing list leaves the previous map in place
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        true
    }
}

/// Type alias for Result with `RelayError`
pub type Result<T> = std::result::Result<T, RelayError>;
