//! I/O utilities for tun-relay
//!
//! # Buffer Pool
//!
//! The `BufferPool` provides lock-free reuse of fixed-size packet buffers so
//! the relay never allocates per datagram on the hot path.

mod buffer_pool;

pub use buffer_pool::{
    BufferPool, BufferPoolStats, BufferPoolStatsSnapshot, PooledBuffer, DEFAULT_BUFFER_SIZE,
};
