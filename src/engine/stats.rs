//! Relay statistics
//!
//! Lock-free counters updated by the workers, read as a serializable
//! snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters shared by all workers
#[derive(Debug, Default)]
pub struct RelayStats {
    pub(crate) packets_from_device: AtomicU64,
    pub(crate) bytes_from_device: AtomicU64,
    pub(crate) packets_to_device: AtomicU64,
    pub(crate) bytes_to_device: AtomicU64,
    pub(crate) filtered: AtomicU64,
    pub(crate) unknown_protocol: AtomicU64,
    pub(crate) malformed: AtomicU64,
    pub(crate) tcp_sessions_opened: AtomicU64,
    pub(crate) udp_sessions_opened: AtomicU64,
    pub(crate) connect_failures: AtomicU64,
    pub(crate) resets_sent: AtomicU64,
    pub(crate) evictions: AtomicU64,
    pub(crate) datagrams_dropped: AtomicU64,
}

impl RelayStats {
    /// Create zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Get a snapshot of all counters
    #[must_use]
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        RelayStatsSnapshot {
            packets_from_device: load(&self.packets_from_device),
            bytes_from_device: load(&self.bytes_from_device),
            packets_to_device: load(&self.packets_to_device),
            bytes_to_device: load(&self.bytes_to_device),
            filtered: load(&self.filtered),
            unknown_protocol: load(&self.unknown_protocol),
            malformed: load(&self.malformed),
            tcp_sessions_opened: load(&self.tcp_sessions_opened),
            udp_sessions_opened: load(&self.udp_sessions_opened),
            connect_failures: load(&self.connect_failures),
            resets_sent: load(&self.resets_sent),
            evictions: load(&self.evictions),
            datagrams_dropped: load(&self.datagrams_dropped),
        }
    }
}

/// Point-in-time copy of [`RelayStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStatsSnapshot {
    /// Datagrams read from the virtual interface
    pub packets_from_device: u64,
    /// Bytes read from the virtual interface
    pub bytes_from_device: u64,
    /// Datagrams written to the virtual interface
    pub packets_to_device: u64,
    /// Bytes written to the virtual interface
    pub bytes_to_device: u64,
    /// Datagrams dropped by the filter
    pub filtered: u64,
    /// Datagrams of a protocol other than TCP/UDP
    pub unknown_protocol: u64,
    /// Datagrams that failed to parse
    pub malformed: u64,
    /// TCP control blocks created
    pub tcp_sessions_opened: u64,
    /// UDP sessions created
    pub udp_sessions_opened: u64,
    /// Relay sockets that failed to connect
    pub connect_failures: u64,
    /// RST segments synthesized
    pub resets_sent: u64,
    /// Sessions evicted from a full table
    pub evictions: u64,
    /// UDP datagrams dropped because the socket was busy or gone
    pub datagrams_dropped: u64,
}
