//! Virtual interface and tunnel pump
//!
//! The engine talks to the virtual interface through [`TunDevice`], a duplex
//! raw-IPv4 datagram stream. Two implementations ship with the crate:
//!
//! - [`FdTun`]: a non-blocking TUN file descriptor, either handed over by the
//!   platform or opened with [`FdTun::open`] on Linux
//! - [`ChannelTun`]: an in-memory device whose other end ([`TunPeer`]) injects
//!   and collects datagrams, for embedding and tests
//!
//! [`TunnelPump`] is the single loop that moves datagrams between the device
//! and the translators.
//!
//! # Architecture
//!
//! ```text
//!                 ┌────────────┐  Packet   ┌────────────┐
//!   TunDevice ──► │ TunnelPump │ ────────► │ TcpOutput  │ ──► relay sockets
//!       ▲         │            │ ────────► │ UdpOutput  │
//!       │         └────────────┘           └────────────┘
//!       │               ▲
//!       │               │ PooledBuffer     ┌────────────┐
//!       └───────────────┴───────────────── │ TcpInput   │ ◄── relay sockets
//!                                          │ UdpInput   │
//!                                          └────────────┘
//! ```

mod fd;
mod memory;
mod pump;

use std::io;

pub use fd::FdTun;
#[cfg(target_os = "linux")]
pub use fd::configure_interface;
pub use memory::{ChannelTun, TunPeer};
pub use pump::TunnelPump;

/// Duplex stream of raw IPv4 datagrams
pub trait TunDevice: Send + Sync {
    /// Read one datagram into `buf`, returning its length.
    ///
    /// # Errors
    ///
    /// Returns `WouldBlock` when no datagram is pending; any other error is
    /// fatal to the engine.
    fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one complete datagram
    ///
    /// # Errors
    ///
    /// Returns the device error; the engine treats it as fatal.
    fn write_packet(&self, packet: &[u8]) -> io::Result<()>;

    /// Release the device. Called once, last, during engine teardown.
    fn close(&self) {}
}
