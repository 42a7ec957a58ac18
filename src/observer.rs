//! Per-packet observer hook
//!
//! The tunnel pump reports every datagram it processes, together with the
//! filter verdict (when filtering is enabled), to an optional
//! [`PacketObserver`]. Observers run on the pump thread; a panicking observer
//! is contained and never affects relaying.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::filter::Verdict;
use crate::packet::Packet;

/// Receives every packet read from the virtual interface
pub trait PacketObserver: Send + Sync {
    /// Called once per processed packet; `verdict` is `None` when filtering
    /// is disabled
    fn on_packet(&self, packet: &Packet, verdict: Option<Verdict>);
}

impl<F> PacketObserver for F
where
    F: Fn(&Packet, Option<Verdict>) + Send + Sync,
{
    fn on_packet(&self, packet: &Packet, verdict: Option<Verdict>) {
        self(packet, verdict);
    }
}

/// Emits one tracing event per packet: denied packets at `debug`, the rest
/// at `trace`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl PacketObserver for TracingObserver {
    fn on_packet(&self, packet: &Packet, verdict: Option<Verdict>) {
        match verdict {
            Some(Verdict::Deny) => debug!(target: "tun_relay::packets", "{} verdict=deny", packet),
            Some(v) => trace!(target: "tun_relay::packets", "{} verdict={}", packet, v),
            None => trace!(target: "tun_relay::packets", "{}", packet),
        }
    }
}

/// Panic-isolating wrapper around an observer
#[derive(Clone)]
pub struct ObserverSlot {
    observer: Arc<dyn PacketObserver>,
    panics: Arc<AtomicU64>,
}

impl ObserverSlot {
    /// Wrap `observer`
    #[must_use]
    pub fn new(observer: Arc<dyn PacketObserver>) -> Self {
        Self {
            observer,
            panics: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Invoke the observer, swallowing any panic
    pub fn notify(&self, packet: &Packet, verdict: Option<Verdict>) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.observer.on_packet(packet, verdict);
        }));
        if result.is_err() {
            let count = self.panics.fetch_add(1, Ordering::Relaxed) + 1;
            warn!("Packet observer panicked ({} total), packet still relayed", count);
        }
    }

    /// Number of observer panics caught so far
    #[must_use]
    pub fn panics(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ObserverSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverSlot")
            .field("panics", &self.panics())
            .finish_non_exhaustive()
    }
}
