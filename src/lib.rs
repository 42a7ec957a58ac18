//! tun-relay: socket-based NAT relay for a TUN interface
//!
//! This crate intercepts the IPv4 traffic a device sends into a virtual
//! network interface and relays it over ordinary outbound sockets. Every
//! TCP connection and UDP flow is terminated locally and re-originated as a
//! normal client socket; replies are re-wrapped with rewritten headers so
//! the device believes it is talking directly to each remote host.
//!
//! # Features
//!
//! - **Packet Codec**: IPv4/TCP/UDP header parsing and serialization with
//!   Internet and pseudo-header checksums
//! - **TCP Translator**: reduced TCP state machine per flow (handshake, data,
//!   half-close, reset)
//! - **UDP Translator**: connectionless NAT with one connected socket per flow
//! - **Bounded Sessions**: LRU session tables that close evicted sockets
//! - **Filtering**: optional allow/deny host lists consulted per packet
//! - **Socket Protection**: `SO_MARK`/`SO_BINDTODEVICE` or a platform hook so
//!   relay traffic never re-enters the tunnel
//!
//! # Architecture
//!
//! ```text
//! Device → TUN → TunnelPump ─┬─► TcpOutput ─► relay socket ─► Remote
//!                 ▲          └─► UdpOutput ─► relay socket ─► Remote
//!                 │
//!                 └──── TcpInput / UdpInput ◄── relay sockets
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tun_relay::config::load_config;
//! use tun_relay::engine::EngineBuilder;
//! use tun_relay::tunnel::FdTun;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/tun-relay/config.json")?;
//! let tun = FdTun::open(&config.tunnel.name)?;
//! let engine = EngineBuilder::new(config).start(Arc::new(tun))?;
//!
//! // ... until asked to stop
//! engine.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`engine`]: Engine lifecycle, workers and statistics
//! - [`error`]: Error types
//! - [`filter`]: Host filter and address resolution
//! - [`io`]: Packet buffer pool
//! - [`observer`]: Per-packet observer hook
//! - [`packet`]: IPv4/TCP/UDP codec
//! - [`poller`]: Readiness multiplexer
//! - [`protect`]: Socket protection
//! - [`session`]: Flow keys and bounded session tables
//! - [`tcp`]: TCP translator
//! - [`tunnel`]: Virtual interface and tunnel pump
//! - [`udp`]: UDP translator

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]

pub mod config;
pub mod engine;
pub mod error;
pub mod filter;
pub mod io;
pub mod observer;
pub mod packet;
pub mod poller;
pub mod protect;
pub mod session;
pub mod tcp;
pub mod tunnel;
pub mod udp;

// Re-export commonly used types at the crate root
pub use config::Config;
pub use engine::{Engine, EngineBuilder, EngineStatus, RelayStatsSnapshot};
pub use error::{ConfigError, FilterError, FlowError, PacketError, RelayError, TunnelError};
pub use filter::{FilterMap, HostFilter, PacketFilter, Verdict};
pub use io::{BufferPool, PooledBuffer};
pub use observer::{PacketObserver, TracingObserver};
pub use packet::{Packet, PacketHeaders};
pub use protect::{NoopProtector, SocketProtector};
pub use session::FlowKey;
pub use tunnel::{ChannelTun, FdTun, TunDevice, TunPeer};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
