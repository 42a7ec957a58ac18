//! Lock-free packet buffer pool
//!
//! Every datagram read from the virtual interface or a relay socket lands in
//! a fixed-size buffer taken from this pool. The free list is a
//! `crossbeam_queue::SegQueue`, so acquire and release never block each other.
//!
//! Buffers carry a `position`/`limit` cursor: `limit` marks the end of the
//! valid datagram, `position` the next byte to consume. Both are reset when a
//! buffer is acquired.
//!
//! # Example
//!
//! ```
//! use tun_relay::io::BufferPool;
//! use std::sync::Arc;
//!
//! let pool = Arc::new(BufferPool::new(16 * 1024));
//!
//! let buffer = pool.acquire();
//! assert_eq!(buffer.capacity(), 16 * 1024);
//!
//! // Returned to the free list on drop
//! drop(buffer);
//! assert_eq!(pool.available(), 1);
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use tracing::debug;

/// Fixed size of a pooled buffer
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Statistics for the buffer pool
#[derive(Debug, Default)]
pub struct BufferPoolStats {
    /// Number of new buffer allocations (pool was empty)
    allocations: AtomicU64,
    /// Number of buffer reuses from pool
    reuses: AtomicU64,
    /// Number of buffers returned to pool
    returns: AtomicU64,
    /// Number of buffers discarded because the pool was cleared
    discards: AtomicU64,
}

impl BufferPoolStats {
    /// Get the number of allocations
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Get the number of reuses
    #[must_use]
    pub fn reuses(&self) -> u64 {
        self.reuses.load(Ordering::Relaxed)
    }

    /// Get the number of returns
    #[must_use]
    pub fn returns(&self) -> u64 {
        self.returns.load(Ordering::Relaxed)
    }

    /// Get the number of discards
    #[must_use]
    pub fn discards(&self) -> u64 {
        self.discards.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all stats
    #[must_use]
    pub fn snapshot(&self) -> BufferPoolStatsSnapshot {
        BufferPoolStatsSnapshot {
            allocations: self.allocations(),
            reuses: self.reuses(),
            returns: self.returns(),
            discards: self.discards(),
        }
    }
}

/// Snapshot of buffer pool statistics
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct BufferPoolStatsSnapshot {
    /// Number of new buffer allocations
    pub allocations: u64,
    /// Number of buffer reuses
    pub reuses: u64,
    /// Number of buffers returned
    pub returns: u64,
    /// Number of buffers discarded after clear
    pub discards: u64,
}

impl BufferPoolStatsSnapshot {
    /// Get pool efficiency (reuses / (reuses + allocations))
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // Precision loss acceptable for efficiency ratio
    pub fn efficiency(&self) -> f64 {
        let total = self.reuses + self.allocations;
        if total == 0 {
            0.0
        } else {
            self.reuses as f64 / total as f64
        }
    }
}

/// Process-wide pool of fixed-size packet buffers.
///
/// Acquire reuses a free buffer or allocates a new one; buffers return to the
/// free list when their [`PooledBuffer`] handle is dropped. Once [`clear`] has
/// run, released buffers are discarded instead of pooled.
///
/// [`clear`]: BufferPool::clear
#[derive(Debug)]
pub struct BufferPool {
    free: SegQueue<Vec<u8>>,
    buffer_size: usize,
    closed: AtomicBool,
    stats: BufferPoolStats,
}

impl BufferPool {
    /// Create an empty pool of `buffer_size`-byte buffers
    #[must_use]
    pub fn new(buffer_size: usize) -> Self {
        Self {
            free: SegQueue::new(),
            buffer_size,
            closed: AtomicBool::new(false),
            stats: BufferPoolStats::default(),
        }
    }

    /// Create a pool of 16 KiB buffers
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }

    /// Take a buffer from the free list, or allocate one if it is empty.
    ///
    /// The returned buffer always holds exactly `buffer_size` bytes with
    /// `position = 0` and `limit = capacity`. Reused buffers are not zeroed.
    #[must_use]
    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let data = match self.free.pop() {
            Some(buf) => {
                self.stats.reuses.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.stats.allocations.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.buffer_size]
            }
        };

        PooledBuffer {
            position: 0,
            limit: data.len(),
            data: Some(data),
            pool: Arc::clone(self),
        }
    }

    fn release(&self, data: Vec<u8>) {
        if self.closed.load(Ordering::Acquire) || data.len() != self.buffer_size {
            self.stats.discards.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.free.push(data);
        self.stats.returns.fetch_add(1, Ordering::Relaxed);
    }

    /// Pre-allocate `count` buffers onto the free list
    pub fn prewarm(&self, count: usize) {
        for _ in 0..count {
            self.free.push(vec![0u8; self.buffer_size]);
        }
    }

    /// Drop every pooled buffer and stop accepting releases.
    ///
    /// Used on engine teardown; buffers still held by callers are freed when
    /// they are dropped.
    pub fn clear(&self) {
        self.closed.store(true, Ordering::Release);
        let mut dropped = 0usize;
        while self.free.pop().is_some() {
            dropped += 1;
        }
        debug!("Buffer pool cleared, {} buffers freed", dropped);
    }

    /// Whether `clear` has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Get the buffer size
    #[must_use]
    pub const fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Get the current number of free buffers
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Get pool statistics
    #[must_use]
    pub fn stats(&self) -> &BufferPoolStats {
        &self.stats
    }
}

/// A buffer borrowed from the pool.
///
/// Derefs to the whole fixed-size slice; the valid region is
/// `position..limit`. Automatically returns to the pool when dropped.
#[derive(Debug)]
pub struct PooledBuffer {
    data: Option<Vec<u8>>,
    position: usize,
    limit: usize,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    /// Total size of the underlying buffer
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.as_ref().map_or(0, Vec::len)
    }

    /// Index of the next byte to consume
    #[must_use]
    pub const fn position(&self) -> usize {
        self.position
    }

    /// End of the valid region
    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// Set the read cursor, clamped to `limit`
    pub fn set_position(&mut self, position: usize) {
        self.position = position.min(self.limit);
    }

    /// Set the end of the valid region, clamped to capacity
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit.min(self.capacity());
        self.position = self.position.min(self.limit);
    }

    /// Reset the cursor to the whole buffer
    pub fn reset(&mut self) {
        self.position = 0;
        self.limit = self.capacity();
    }

    /// Bytes between position and limit
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    /// The valid region `position..limit`
    #[must_use]
    pub fn filled(&self) -> &[u8] {
        &self[self.position..self.limit]
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.release(data);
        }
    }
}
