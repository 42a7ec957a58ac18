//! Device → network UDP worker

use std::io;
use std::sync::Arc;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use super::session::{SharedUdpSession, UdpSession};
use crate::engine::{RelayContext, RelayStats};
use crate::error::TunnelError;
use crate::packet::Packet;
use crate::poller::PollerHandle;
use crate::session::{FlowKey, SessionTable};

/// Device → network half of the UDP translator
pub struct UdpOutput {
    ctx: RelayContext,
    rx: Receiver<Packet>,
    table: Arc<SessionTable<FlowKey, SharedUdpSession>>,
    poller: Arc<PollerHandle<SharedUdpSession>>,
}

impl UdpOutput {
    /// Create the worker
    pub fn new(
        ctx: RelayContext,
        rx: Receiver<Packet>,
        table: Arc<SessionTable<FlowKey, SharedUdpSession>>,
        poller: Arc<PollerHandle<SharedUdpSession>>,
    ) -> Self {
        Self {
            ctx,
            rx,
            table,
            poller,
        }
    }

    /// Process datagrams until the engine stops or the pump hangs up
    ///
    /// # Errors
    ///
    /// Never fails today; per-flow errors are handled in place.
    pub fn run(self) -> Result<(), TunnelError> {
        info!("UDP output worker started");
        while !self.ctx.is_stopping() {
            match self.rx.recv_timeout(self.ctx.idle_sleep) {
                Ok(packet) => self.handle(&packet),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("UDP output worker stopped");
        Ok(())
    }

    /// Relay one device datagram
    pub fn handle(&self, packet: &Packet) {
        let Some(key) = FlowKey::from_headers(packet.headers()) else {
            return;
        };
        let Some(shared) = self.session(key, packet) else {
            // Buffer goes back to the pool with the packet
            return;
        };

        let mut session = shared.lock();
        match session.send(packet.payload()) {
            Ok(n) => trace!("UDP {} sent {} bytes", key, n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                RelayStats::incr(&self.ctx.stats.datagrams_dropped);
                trace!("UDP {} send buffer full, datagram dropped", key);
            }
            Err(e) => {
                debug!("UDP {} send failed: {}", key, e);
                RelayStats::incr(&self.ctx.stats.datagrams_dropped);
                session.close(&self.poller);
                drop(session);
                self.table.remove_if(&key, |v| Arc::ptr_eq(v, &shared));
            }
        }
    }

    /// Existing open session for `key`, or a newly opened one
    fn session(&self, key: FlowKey, packet: &Packet) -> Option<SharedUdpSession> {
        if let Some(existing) = self.table.get(&key) {
            let closed = existing.lock().is_closed();
            if !closed {
                return Some(existing);
            }
            self.table.remove_if(&key, |v| Arc::ptr_eq(v, &existing));
        }

        let token = self.poller.allocate_token();
        let template = packet.headers().swapped();
        let session = match UdpSession::open(key, template, token, self.ctx.protector.as_ref()) {
            Ok(session) => session,
            Err(e) => {
                debug!("UDP {} {}, datagram dropped", key, e);
                RelayStats::incr(&self.ctx.stats.connect_failures);
                return None;
            }
        };
        RelayStats::incr(&self.ctx.stats.udp_sessions_opened);

        let shared = Arc::new(Mutex::new(session));
        self.table.put(key, Arc::clone(&shared));

        let mut session = shared.lock();
        self.poller.attach(token, Arc::clone(&shared));
        if let Err(e) = session.watch(&self.poller) {
            debug!("UDP {} register failed: {}", key, e);
            session.close(&self.poller);
            drop(session);
            self.table.remove_if(&key, |v| Arc::ptr_eq(v, &shared));
            return None;
        }
        drop(session);
        Some(shared)
    }
}
