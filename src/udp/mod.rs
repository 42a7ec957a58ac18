//! UDP translator
//!
//! Connectionless NAT: the first datagram of a flow opens a connected,
//! protected socket to its destination; later datagrams reuse it. Replies
//! are wrapped with the flow's header template and queued for the device.

mod input;
mod output;
mod session;

use std::num::NonZeroUsize;
use std::sync::Arc;

pub use input::UdpInput;
pub use output::UdpOutput;
pub use session::{SharedUdpSession, UdpSession};

use crate::engine::RelayStats;
use crate::poller::PollerHandle;
use crate::session::{FlowKey, RemovalCause, SessionTable};

/// Create the UDP session table; displaced sessions have their socket closed
pub fn udp_table(
    capacity: NonZeroUsize,
    poller: Arc<PollerHandle<SharedUdpSession>>,
    stats: Arc<RelayStats>,
) -> SessionTable<FlowKey, SharedUdpSession> {
    SessionTable::new(
        "udp",
        capacity,
        move |key: &FlowKey, session: &SharedUdpSession, cause: RemovalCause| {
            session.lock().close(&poller);
            if cause == RemovalCause::Evicted {
                RelayStats::incr(&stats.evictions);
                tracing::debug!("UDP {} evicted", key);
            }
        },
    )
}
