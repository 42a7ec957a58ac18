//! State shared by every worker of one engine

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use tracing::trace;

use super::stats::RelayStats;
use crate::config::Config;
use crate::io::{BufferPool, PooledBuffer};
use crate::protect::SocketProtector;

/// Handles and tunables passed to each worker
#[derive(Clone)]
pub struct RelayContext {
    /// Packet buffer pool
    pub pool: Arc<BufferPool>,
    /// Translated datagrams waiting to be written to the virtual interface
    pub device_tx: Sender<PooledBuffer>,
    /// Applied to every relay socket before connect
    pub protector: Arc<dyn SocketProtector>,
    /// Shared counters
    pub stats: Arc<RelayStats>,
    /// Set once shutdown begins
    pub stop: Arc<AtomicBool>,
    /// Largest payload of one synthesized TCP segment
    pub max_segment_payload: usize,
    /// Unsent device payload a TCP flow may hold
    pub write_backlog: usize,
    /// Idle back-off of queue-driven workers
    pub idle_sleep: Duration,
    /// Upper bound of one readiness wait
    pub poll_timeout: Duration,
}

impl RelayContext {
    /// Build a context from the engine configuration
    #[must_use]
    pub fn new(
        config: &Config,
        pool: Arc<BufferPool>,
        device_tx: Sender<PooledBuffer>,
        protector: Arc<dyn SocketProtector>,
    ) -> Self {
        Self {
            pool,
            device_tx,
            protector,
            stats: Arc::new(RelayStats::new()),
            stop: Arc::new(AtomicBool::new(false)),
            max_segment_payload: config.tunnel.max_segment_payload(),
            write_backlog: config.sessions.write_backlog,
            idle_sleep: config.workers.idle_sleep(),
            poll_timeout: config.workers.poll_timeout(),
        }
    }

    /// Whether workers should exit
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Ask every worker to exit
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Queue a finished datagram for the virtual interface
    pub fn send_to_device(&self, buffer: PooledBuffer) {
        // Receiver gone means the pump already exited; the buffer is dropped
        if self.device_tx.send(buffer).is_err() {
            trace!("Device queue closed, datagram dropped");
        }
    }
}

impl std::fmt::Debug for RelayContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayContext")
            .field("max_segment_payload", &self.max_segment_payload)
            .field("write_backlog", &self.write_backlog)
            .field("stopping", &self.is_stopping())
            .finish_non_exhaustive()
    }
}
