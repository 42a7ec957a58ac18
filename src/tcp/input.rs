//! Network → device TCP worker
//!
//! Blocks on the TCP readiness multiplexer. Completes deferred connects,
//! flushes device payload the relay sockets could not take at once and
//! turns data read from relay sockets into PSH+ACK segments for the device.

use std::io::{self, Read};
use std::sync::Arc;

use tracing::{debug, info, trace};

use super::tcb::{Disposition, SharedTcb, Tcb, TcbState};
use crate::engine::{RelayContext, RelayStats};
use crate::error::TunnelError;
use crate::packet::{tcp_flags, TCP_PAYLOAD_OFFSET};
use crate::poller::{Poller, PollerHandle, Readiness};
use crate::session::{FlowKey, SessionTable};

/// Network → device half of the TCP translator
pub struct TcpInput {
    ctx: RelayContext,
    poller: Poller<SharedTcb>,
    handle: Arc<PollerHandle<SharedTcb>>,
    table: Arc<SessionTable<FlowKey, SharedTcb>>,
}

impl TcpInput {
    /// Create the worker around the multiplexer it owns
    pub fn new(
        ctx: RelayContext,
        poller: Poller<SharedTcb>,
        table: Arc<SessionTable<FlowKey, SharedTcb>>,
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
    /// Returns `TunnelError::Multiplexer` if the readiness wait fails; the
    /// engine tears down in response.
    pub fn run(mut self) -> Result<(), TunnelError> {
        info!("TCP input worker started");
        while !self.ctx.is_stopping() && !self.handle.is_closed() {
            let ready = self
                .poller
                .wait(self.ctx.poll_timeout)
                .map_err(|e| TunnelError::multiplexer("tcp-input", e))?;
            for event in ready {
                self.handle_event(event);
            }
        }
        info!("TCP input worker stopped");
        Ok(())
    }

    fn handle_event(&self, event: Readiness<SharedTcb>) {
        let shared = event.session;
        let mut tcb = shared.lock();
        if tcb.is_closed() || tcb.token() != event.token {
            return;
        }

        let disposition = match tcb.state {
            TcbState::SynSent if event.writable || event.error => self.on_connect(&mut tcb),
            TcbState::SynSent => Disposition::Keep,
            _ => {
                let mut disposition = Disposition::Keep;
                if (event.writable || event.error) && tcb.unsent_len() > 0 {
                    disposition = self.on_writable(&mut tcb);
                }
                if disposition == Disposition::Keep
                    && (event.readable || event.error)
                    && tcb.awaiting_data
                {
                    disposition = self.on_readable(&mut tcb);
                }
                disposition
            }
        };

        if disposition == Disposition::Destroy {
            let key = tcb.key;
            tcb.close(&self.handle);
            drop(tcb);
            self.table.remove_if(&key, |v| Arc::ptr_eq(v, &shared));
        }
    }

    fn on_connect(&self, tcb: &mut Tcb) -> Disposition {
        let Some(stream) = tcb.stream_mut() else {
            return Disposition::Destroy;
        };
        let outcome = match stream.take_error() {
            Ok(Some(e)) | Err(e) => Err(e),
            Ok(None) => match stream.peer_addr() {
                Ok(_) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
                Err(e) => Err(e),
            },
        };

        match outcome {
            Ok(true) => {
                tcb.unwatch(&self.handle);
                tcb.state = TcbState::SynReceived;
                tcb.send(&self.ctx, tcp_flags::SYN | tcp_flags::ACK, None);
                tcb.local_seq = tcb.local_seq.wrapping_add(1);
                debug!("TCP {} connected", tcb.key);
                Disposition::Keep
            }
            // Spurious wakeup, still connecting
            Ok(false) => Disposition::Keep,
            Err(e) => {
                debug!("TCP {} connect failed: {}", tcb.key, e);
                RelayStats::incr(&self.ctx.stats.connect_failures);
                tcb.send_reset(&self.ctx);
                Disposition::Destroy
            }
        }
    }

    fn on_writable(&self, tcb: &mut Tcb) -> Disposition {
        let before = tcb.local_ack;
        let drained = match tcb.flush() {
            Ok(drained) => drained,
            Err(e) => {
                debug!("TCP {} write failed: {}", tcb.key, e);
                tcb.send_reset(&self.ctx);
                return Disposition::Destroy;
            }
        };
        if !drained {
            if tcb.local_ack != before {
                tcb.send(&self.ctx, tcp_flags::ACK, None);
            }
            return Disposition::Keep;
        }

        if let Err(e) = tcb.rearm(&self.handle) {
            debug!("TCP {} register failed: {}", tcb.key, e);
            tcb.send_reset(&self.ctx);
            return Disposition::Destroy;
        }
        trace!("TCP {} backlog drained", tcb.key);
        if tcb.fin_pending {
            return tcb.complete_device_fin(&self.ctx);
        }
        tcb.send(&self.ctx, tcp_flags::ACK, None);
        Disposition::Keep
    }

    fn on_readable(&self, tcb: &mut Tcb) -> Disposition {
        let chunk = self
            .ctx
            .max_segment_payload
            .min(self.ctx.pool.buffer_size().saturating_sub(TCP_PAYLOAD_OFFSET));

        // Edge-triggered: drain until the socket would block
        loop {
            let mut buffer = self.ctx.pool.acquire();
            let Some(stream) = tcb.stream_mut() else {
                return Disposition::Destroy;
            };
            let result = stream.read(&mut buffer[TCP_PAYLOAD_OFFSET..TCP_PAYLOAD_OFFSET + chunk]);
            match result {
                Ok(0) => return self.on_eof(tcb),
                Ok(n) => {
                    trace!("TCP {} read {} bytes from remote", tcb.key, n);
                    tcb.send(&self.ctx, tcp_flags::PSH | tcp_flags::ACK, Some((buffer, n)));
                    tcb.local_seq = tcb.local_seq.wrapping_add(n as u32);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Disposition::Keep,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!("TCP {} read failed: {}", tcb.key, e);
                    tcb.send_reset(&self.ctx);
                    return Disposition::Destroy;
                }
            }
        }
    }

    fn on_eof(&self, tcb: &mut Tcb) -> Disposition {
        tcb.awaiting_data = false;
        if let Err(e) = tcb.rearm(&self.handle) {
            trace!("TCP {} rearm after EOF failed: {}", tcb.key, e);
        }
        match tcb.state {
            TcbState::CloseWait => {
                tcb.state = TcbState::LastAck;
            }
            TcbState::LastAck | TcbState::FinWait => return Disposition::Keep,
            _ => {
                tcb.state = TcbState::FinWait;
            }
        }
        tcb.send(&self.ctx, tcp_flags::FIN | tcp_flags::ACK, None);
        tcb.local_seq = tcb.local_seq.wrapping_add(1);
        debug!("TCP {} remote EOF -> {}", tcb.key, tcb.state);
        Disposition::Keep
    }
}
