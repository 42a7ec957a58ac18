//! Device → network TCP worker
//!
//! Consumes TCP packets classified by the tunnel pump, drives the control
//! block state machine and writes device payloads into the relay sockets.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use mio::net::TcpStream;
use mio::Interest;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, trace};

use super::tcb::{emit_segment, Disposition, SharedTcb, Tcb, TcbState};
use crate::engine::{RelayContext, RelayStats};
use crate::error::{FlowError, TunnelError};
use crate::packet::{tcp_flags, Packet, TcpHeader};
use crate::poller::PollerHandle;
use crate::session::{FlowKey, SessionTable};

/// What became of device payload offered to a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intake {
    /// Bytes reached the relay socket; `local_ack` moved
    Written,
    /// Accepted behind bytes the socket has not taken yet
    Queued,
    /// Duplicate, out of order or over the backlog limit
    Ignored,
}

/// Device → network half of the TCP translator
pub struct TcpOutput {
    ctx: RelayContext,
    rx: Receiver<Packet>,
    table: Arc<SessionTable<FlowKey, SharedTcb>>,
    poller: Arc<PollerHandle<SharedTcb>>,
}

impl TcpOutput {
    /// Create the worker
    pub fn new(
        ctx: RelayContext,
        rx: Receiver<Packet>,
        table: Arc<SessionTable<FlowKey, SharedTcb>>,
        poller: Arc<PollerHandle<SharedTcb>>,
    ) -> Self {
        Self {
            ctx,
            rx,
            table,
            poller,
        }
    }

    /// Process packets until the engine stops or the pump hangs up
    ///
    /// # Errors
    ///
    /// Never fails today; per-flow errors are handled in place.
    pub fn run(self) -> Result<(), TunnelError> {
        info!("TCP output worker started");
        while !self.ctx.is_stopping() {
            match self.rx.recv_timeout(self.ctx.idle_sleep) {
                Ok(packet) => self.handle(packet),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("TCP output worker stopped");
        Ok(())
    }

    /// Route one device packet to its control block
    pub fn handle(&self, packet: Packet) {
        let Some(tcp) = packet.tcp().copied() else {
            return;
        };
        let Some(key) = FlowKey::from_headers(packet.headers()) else {
            return;
        };
        trace!("TCP device -> {}", packet);

        match self.lookup(&key) {
            Some(tcb) => self.handle_known(&key, &tcb, &packet, &tcp),
            None => self.handle_unknown(key, &packet, &tcp),
        }
    }

    /// Live control block for `key`; a closed leftover is dropped
    fn lookup(&self, key: &FlowKey) -> Option<SharedTcb> {
        let tcb = self.table.get(key)?;
        let closed = tcb.lock().is_closed();
        if closed {
            self.table.remove_if(key, |v| Arc::ptr_eq(v, &tcb));
            return None;
        }
        Some(tcb)
    }

    fn handle_unknown(&self, key: FlowKey, packet: &Packet, tcp: &TcpHeader) {
        if tcp.is_rst() {
            return;
        }
        if tcp.is_syn() && !tcp.is_ack() {
            self.open(key, packet, tcp);
            return;
        }

        // Segment for a flow the relay does not know
        let mut ack = tcp.sequence_number.wrapping_add(packet.payload_len() as u32);
        if tcp.is_syn() || tcp.is_fin() {
            ack = ack.wrapping_add(1);
        }
        debug!("TCP {} unknown flow [{}], resetting", key, tcp.flags_string());
        emit_segment(
            &self.ctx,
            &key,
            &packet.headers().swapped(),
            tcp_flags::RST | tcp_flags::ACK,
            tcp.acknowledgement_number,
            ack,
            None,
        );
    }

    fn open(&self, key: FlowKey, packet: &Packet, tcp: &TcpHeader) {
        let template = packet.headers().swapped();
        let (stream, connected) = match self.connect(key.remote()) {
            Ok(result) => result,
            Err(e) => {
                debug!("TCP {} {}", key, e);
                RelayStats::incr(&self.ctx.stats.connect_failures);
                emit_segment(
                    &self.ctx,
                    &key,
                    &template,
                    tcp_flags::RST | tcp_flags::ACK,
                    0,
                    tcp.sequence_number.wrapping_add(1),
                    None,
                );
                return;
            }
        };

        let token = self.poller.allocate_token();
        let mut tcb = Tcb::new(
            key,
            rand::random(),
            tcp.sequence_number,
            tcp.acknowledgement_number,
            template,
            stream,
            token,
        );
        RelayStats::incr(&self.ctx.stats.tcp_sessions_opened);

        if connected {
            tcb.state = TcbState::SynReceived;
            tcb.send(&self.ctx, tcp_flags::SYN | tcp_flags::ACK, None);
            tcb.local_seq = tcb.local_seq.wrapping_add(1);
        }
        debug!("TCP {} opened in {}", key, tcb.state);

        let shared = Arc::new(Mutex::new(tcb));
        self.table.put(key, Arc::clone(&shared));

        let mut tcb = shared.lock();
        self.poller.attach(token, Arc::clone(&shared));
        if connected {
            return;
        }
        if let Err(e) = tcb.watch(&self.poller, Interest::WRITABLE) {
            debug!("TCP {} register failed: {}", key, e);
            tcb.send_reset(&self.ctx);
            tcb.close(&self.poller);
            drop(tcb);
            self.table.remove_if(&key, |v| Arc::ptr_eq(v, &shared));
        }
    }

    /// Create, protect and start connecting a non-blocking socket.
    ///
    /// Returns the stream and whether the connect already completed.
    fn connect(&self, remote: SocketAddr) -> Result<(TcpStream, bool), FlowError> {
        let connect_error = |source| FlowError::Connect {
            addr: remote,
            source,
        };

        let socket =
            Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(connect_error)?;
        socket.set_nonblocking(true).map_err(connect_error)?;
        self.ctx.protector.protect(&socket)?;
        if let Err(e) = socket.set_nodelay(true) {
            trace!("TCP_NODELAY on {} failed: {}", remote, e);
        }

        let connected = match socket.connect(&remote.into()) {
            Ok(()) => true,
            Err(e) if is_in_progress(&e) => false,
            Err(e) => return Err(connect_error(e)),
        };

        let stream: std::net::TcpStream = socket.into();
        Ok((TcpStream::from_std(stream), connected))
    }

    fn handle_known(&self, key: &FlowKey, shared: &SharedTcb, packet: &Packet, tcp: &TcpHeader) {
        let mut tcb = shared.lock();
        if tcb.is_closed() {
            return;
        }
        tcb.remote_seq = tcp.sequence_number;
        tcb.remote_ack = tcp.acknowledgement_number;

        let disposition = if tcp.is_rst() {
            debug!("TCP {} reset by device in {}", key, tcb.state);
            Disposition::Destroy
        } else if tcp.is_syn() {
            self.on_duplicate_syn(&mut tcb, tcp)
        } else if tcp.is_fin() {
            self.on_fin(&mut tcb, packet, tcp)
        } else if tcp.is_ack() {
            self.on_ack(&mut tcb, packet, tcp)
        } else {
            Disposition::Keep
        };

        if disposition == Disposition::Destroy {
            tcb.close(&self.poller);
            drop(tcb);
            self.table.remove_if(key, |v| Arc::ptr_eq(v, shared));
        }
    }

    fn on_duplicate_syn(&self, tcb: &mut Tcb, tcp: &TcpHeader) -> Disposition {
        if tcb.state == TcbState::SynSent {
            tcb.local_ack = tcp.sequence_number.wrapping_add(1);
            return Disposition::Keep;
        }
        debug!("TCP {} SYN in {}, resetting", tcb.key, tcb.state);
        tcb.send_reset(&self.ctx);
        Disposition::Destroy
    }

    fn on_fin(&self, tcb: &mut Tcb, packet: &Packet, tcp: &TcpHeader) -> Disposition {
        if tcb.fin_pending {
            // Acknowledged once the backlog drains
            return Disposition::Keep;
        }
        if matches!(tcb.state, TcbState::CloseWait | TcbState::LastAck) {
            // Retransmitted FIN
            tcb.send(&self.ctx, tcp_flags::ACK, None);
            return Disposition::Keep;
        }

        let payload = packet.payload();
        if !payload.is_empty() && self.take_payload(tcb, tcp.sequence_number, payload).is_err() {
            tcb.send_reset(&self.ctx);
            return Disposition::Destroy;
        }
        let fin_seq = tcp.sequence_number.wrapping_add(payload.len() as u32);
        if tcb.next_device_seq() != fin_seq {
            trace!("TCP {} FIN out of order, re-acking", tcb.key);
            tcb.send(&self.ctx, tcp_flags::ACK, None);
            return Disposition::Keep;
        }
        if tcb.unsent_len() > 0 {
            tcb.fin_pending = true;
            return Disposition::Keep;
        }
        tcb.complete_device_fin(&self.ctx)
    }

    fn on_ack(&self, tcb: &mut Tcb, packet: &Packet, tcp: &TcpHeader) -> Disposition {
        match tcb.state {
            TcbState::SynReceived => {
                tcb.state = TcbState::Established;
                tcb.awaiting_data = true;
                if let Err(e) = tcb.rearm(&self.poller) {
                    debug!("TCP {} register failed: {}", tcb.key, e);
                    tcb.send_reset(&self.ctx);
                    return Disposition::Destroy;
                }
                debug!("TCP {} established", tcb.key);
            }
            TcbState::LastAck => {
                debug!("TCP {} close handshake complete", tcb.key);
                return Disposition::Destroy;
            }
            _ => {}
        }

        let payload = packet.payload();
        if payload.is_empty() {
            return Disposition::Keep;
        }
        match self.take_payload(tcb, tcp.sequence_number, payload) {
            Ok(Intake::Queued) => {}
            Ok(Intake::Written | Intake::Ignored) => tcb.send(&self.ctx, tcp_flags::ACK, None),
            Err(_) => {
                tcb.send_reset(&self.ctx);
                return Disposition::Destroy;
            }
        }
        Disposition::Keep
    }

    /// Accept the part of `payload` that continues the device's byte stream
    /// and write what the relay socket takes without blocking.
    ///
    /// Whatever the socket refuses stays in the control block and is
    /// flushed by the input worker once the socket turns writable, so one
    /// slow remote never holds up other flows.
    fn take_payload(&self, tcb: &mut Tcb, seq: u32, payload: &[u8]) -> Result<Intake, FlowError> {
        let key = tcb.key;
        let addr = key.remote();
        let expected = tcb.next_device_seq();
        let behind = expected.wrapping_sub(seq) as i32;
        if behind < 0 {
            trace!("TCP {} segment ahead of {} dropped", key, expected);
            return Ok(Intake::Ignored);
        }
        let Some(fresh) = payload.get(behind.unsigned_abs() as usize..).filter(|p| !p.is_empty())
        else {
            return Ok(Intake::Ignored);
        };
        if tcb.unsent_len() > 0 && tcb.unsent_len() + fresh.len() > self.ctx.write_backlog {
            trace!("TCP {} backlog full, segment left unacknowledged", key);
            return Ok(Intake::Ignored);
        }

        let before = tcb.local_ack;
        tcb.queue_unsent(fresh);
        let drained = tcb.flush().map_err(|source| {
            debug!("TCP {} write failed: {}", key, source);
            FlowError::Write { addr, source }
        })?;
        if !drained {
            tcb.rearm(&self.poller).map_err(|source| {
                debug!("TCP {} register failed: {}", key, source);
                FlowError::Register { addr, source }
            })?;
        }

        Ok(if tcb.local_ack == before {
            Intake::Queued
        } else {
            Intake::Written
        })
    }
}

fn is_in_progress(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc::EINPROGRESS)
}
