//! Network → device UDP worker

use std::io;
use std::sync::Arc;

use tracing::{debug, info, trace};

use super::session::{SharedUdpSession, UdpSession};
use crate::engine::RelayContext;
use crate::error::TunnelError;
use crate::packet::{update_udp_buffer, UDP_PAYLOAD_OFFSET};
use crate::poller::{Poller, PollerHandle, Readiness};
use crate::session::{FlowKey, SessionTable};

/// Network → device half of the UDP translator
pub struct UdpInput {
    ctx: RelayContext,
    poller: Poller<SharedUdpSession>,
    handle: Arc<PollerHandle<SharedUdpSession>>,
    table: Arc<SessionTable<FlowKey, SharedUdpSession>>,
}

impl UdpInput {
    /// Create the worker around the multiplexer it owns
    pub fn new(
        ctx: RelayContext,
        poller: Poller<SharedUdpSession>,
        table: Arc<SessionTable<FlowKey, SharedUdpSession>>,
    ) -> Self {
        let handle = poller.handle();
        Self {
            ctx,
            poller,
            handle,
            table,
        }
    }

    /// Dispatch readiness events until the engine stops
    ///
    /// # Errors
    ///
    /// Returns `TunnelError::Multiplexer` if the readiness wait fails.
    pub fn run(mut self) -> Result<(), TunnelError> {
        info!("UDP input worker started");
        while !self.ctx.is_stopping() && !self.handle.is_closed() {
            let ready = self
                .poller
                .wait(self.ctx.poll_timeout)
                .map_err(|e| TunnelError::multiplexer("udp-input", e))?;
            for event in ready {
                self.handle_event(&event);
            }
        }
        info!("UDP input worker stopped");
        Ok(())
    }

    fn handle_event(&self, event: &Readiness<SharedUdpSession>) {
        if !event.readable && !event.error {
            return;
        }
        let shared = &event.session;
        let mut session = shared.lock();
        if session.is_closed() || session.token() != event.token {
            return;
        }

        if let Err(e) = self.drain(&session) {
            debug!("UDP {} receive failed: {}", session.key, e);
            let key = session.key;
            session.close(&self.handle);
            drop(session);
            self.table.remove_if(&key, |v| Arc::ptr_eq(v, shared));
        }
    }

    /// Forward every queued datagram to the device
    fn drain(&self, session: &UdpSession) -> io::Result<()> {
        let Some(socket) = session.socket() else {
            return Ok(());
        };
        loop {
            let mut buffer = self.ctx.pool.acquire();
            let n = match socket.recv(&mut buffer[UDP_PAYLOAD_OFFSET..]) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };

            match update_udp_buffer(&session.template, &mut buffer, n) {
                Ok(total) => {
                    buffer.set_limit(total);
                    buffer.set_position(0);
                    trace!("UDP {} -> device len={}", session.key, n);
                    self.ctx.send_to_device(buffer);
                }
                Err(e) => debug!("UDP {} failed to build datagram: {}", session.key, e),
            }
        }
    }
}
