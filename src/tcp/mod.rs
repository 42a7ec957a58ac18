//! TCP translator
//!
//! Terminates each device TCP connection locally and re-originates it as an
//! ordinary non-blocking socket. Two workers share the control blocks:
//!
//! - [`TcpOutput`] consumes device segments (handshake, data, FIN, RST)
//! - [`TcpInput`] waits on the multiplexer for connect completion and
//!   remote data
//!
//! Each [`Tcb`] sits behind its own mutex, so the two workers serialize per
//! flow while distinct flows proceed independently. Neither worker blocks on
//! a relay socket: device payload the socket refuses waits in the block,
//! unacknowledged, until [`TcpInput`] sees the socket turn writable.
//!
//! # State machine
//!
//! ```text
//!  SYN ──► SYN_SENT ──connect──► SYN_RECEIVED ──ACK──► ESTABLISHED
//!                                                       │        │
//!                                            device FIN │        │ remote EOF
//!                                                       ▼        ▼
//!                                               CLOSE_WAIT    FIN_WAIT
//!                                                       │        │
//!                                            remote EOF │        │ device FIN
//!                                                       ▼        ▼
//!                                                  LAST_ACK ──► (removed)
//!                                                          ACK
//! ```
//!
//! Any RST, connect failure or socket error removes the block immediately.

mod input;
mod output;
mod tcb;

use std::num::NonZeroUsize;
use std::sync::Arc;

pub use input::TcpInput;
pub use output::TcpOutput;
pub use tcb::{emit_segment, Disposition, SharedTcb, Tcb, TcbState};

use crate::engine::RelayStats;
use crate::poller::PollerHandle;
use crate::session::{FlowKey, RemovalCause, SessionTable};

/// Create the TCB table; displaced blocks have their socket closed
pub fn tcb_table(
    capacity: NonZeroUsize,
    poller: Arc<PollerHandle<SharedTcb>>,
    stats: Arc<RelayStats>,
) -> SessionTable<FlowKey, SharedTcb> {
    SessionTable::new(
        "tcp",
        capacity,
        move |key: &FlowKey, tcb: &SharedTcb, cause: RemovalCause| {
            tcb.lock().close(&poller);
            if cause == RemovalCause::Evicted {
                RelayStats::incr(&stats.evictions);
                tracing::debug!("TCP {} evicted", key);
            }
        },
    )
}
