//! TCP control block

use std::fmt;
use std::io::{self, Write};
use std::net::Shutdown;
use std::sync::Arc;

use mio::net::TcpStream;
use mio::{Interest, Token};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::engine::{RelayContext, RelayStats};
use crate::io::PooledBuffer;
use crate::packet::{flags_string, tcp_flags, update_tcp_buffer, PacketHeaders};
use crate::poller::PollerHandle;
use crate::session::FlowKey;

/// A control block shared between the TCP workers
pub type SharedTcb = Arc<Mutex<Tcb>>;

/// Relay-side TCP connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcbState {
    /// Relay socket connect in progress; SYN+ACK not yet sent
    SynSent,
    /// SYN+ACK sent, waiting for the device's ACK
    SynReceived,
    /// Data flows both ways
    Established,
    /// Device sent FIN while the remote may still send data
    CloseWait,
    /// FIN sent after the device's FIN, waiting for its ACK
    LastAck,
    /// Remote closed first; FIN sent, waiting for the device's FIN
    FinWait,
}

impl fmt::Display for TcbState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SynSent => write!(f, "SYN_SENT"),
            Self::SynReceived => write!(f, "SYN_RECEIVED"),
            Self::Established => write!(f, "ESTABLISHED"),
            Self::CloseWait => write!(f, "CLOSE_WAIT"),
            Self::LastAck => write!(f, "LAST_ACK"),
            Self::FinWait => write!(f, "FIN_WAIT"),
        }
    }
}

/// What to do with a control block after handling an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep the session
    Keep,
    /// Socket closed; remove the session from the table
    Destroy,
}

/// Per-flow TCP relay state
pub struct Tcb {
    /// Flow this block belongs to
    pub key: FlowKey,
    /// Next sequence number the relay sends
    pub local_seq: u32,
    /// Last sequence number seen from the device
    pub remote_seq: u32,
    /// Acknowledgement number the relay sends
    pub local_ack: u32,
    /// Last acknowledgement number seen from the device
    pub remote_ack: u32,
    /// Connection state
    pub state: TcbState,
    /// Device's first packet with endpoints swapped; stamped onto every reply
    pub template: PacketHeaders,
    /// Set while the relay socket is expected to deliver data
    pub awaiting_data: bool,
    /// Device FIN seen while `unsent` still held payload
    pub fin_pending: bool,
    /// Device payload accepted but not yet written; starts at `local_ack`
    unsent: Vec<u8>,
    token: Token,
    stream: Option<TcpStream>,
    registered: bool,
}

impl Tcb {
    /// Create a control block for a fresh SYN.
    ///
    /// `device_seq` / `device_ack` come from the SYN; the relay's own
    /// sequence starts at `initial_seq`.
    #[must_use]
    pub fn new(
        key: FlowKey,
        initial_seq: u32,
        device_seq: u32,
        device_ack: u32,
        template: PacketHeaders,
        stream: TcpStream,
        token: Token,
    ) -> Self {
        Self {
            key,
            local_seq: initial_seq,
            remote_seq: device_seq,
            local_ack: device_seq.wrapping_add(1),
            remote_ack: device_ack,
            state: TcbState::SynSent,
            template,
            awaiting_data: false,
            fin_pending: false,
            unsent: Vec::new(),
            token,
            stream: Some(stream),
            registered: false,
        }
    }

    /// Readiness token of this flow
    #[must_use]
    pub const fn token(&self) -> Token {
        self.token
    }

    /// Whether the relay socket has been closed
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Relay socket, if still open
    pub fn stream_mut(&mut self) -> Option<&mut TcpStream> {
        self.stream.as_mut()
    }

    /// Sequence number of the next device byte not yet accepted
    #[must_use]
    pub fn next_device_seq(&self) -> u32 {
        self.local_ack.wrapping_add(self.unsent.len() as u32)
    }

    /// Bytes accepted from the device and still waiting for the socket
    #[must_use]
    pub fn unsent_len(&self) -> usize {
        self.unsent.len()
    }

    /// Append device payload behind whatever is still unsent
    pub fn queue_unsent(&mut self, payload: &[u8]) {
        self.unsent.extend_from_slice(payload);
    }

    /// Write as much unsent payload as the relay socket takes without
    /// blocking. `local_ack` advances over every written byte.
    ///
    /// Returns whether nothing is left unsent.
    ///
    /// # Errors
    ///
    /// Returns the socket error; bytes written before it stay acknowledged.
    pub fn flush(&mut self) -> io::Result<bool> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        let mut written = 0;
        let result = loop {
            if written == self.unsent.len() {
                break Ok(());
            }
            match stream.write(&self.unsent[written..]) {
                Ok(0) => break Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        if written > 0 {
            self.unsent.drain(..written);
            self.local_ack = self.local_ack.wrapping_add(written as u32);
            trace!("TCP {} wrote {} bytes to remote", self.key, written);
        }
        result.map(|()| self.unsent.is_empty())
    }

    /// Derive readiness interest from what the flow is waiting for:
    /// readable while remote data is expected, writable while payload is
    /// unsent. Interest is dropped when neither applies.
    ///
    /// # Errors
    ///
    /// Returns the registry error.
    pub fn rearm(&mut self, poller: &PollerHandle<SharedTcb>) -> io::Result<()> {
        let interest = match (self.awaiting_data, !self.unsent.is_empty()) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (true, false) => Interest::READABLE,
            (false, true) => Interest::WRITABLE,
            (false, false) => {
                self.unwatch(poller);
                return Ok(());
            }
        };
        self.watch(poller, interest)
    }

    /// Act on the device's FIN once all payload before it is written:
    /// acknowledge it, half-close the relay socket and advance the state.
    pub fn complete_device_fin(&mut self, ctx: &RelayContext) -> Disposition {
        self.fin_pending = false;
        self.local_ack = self.local_ack.wrapping_add(1);
        if let Some(stream) = self.stream.as_mut() {
            if let Err(e) = stream.shutdown(Shutdown::Write) {
                trace!("TCP {} shutdown failed: {}", self.key, e);
            }
        }

        if self.state == TcbState::FinWait {
            self.send(ctx, tcp_flags::ACK, None);
            debug!("TCP {} closed by remote, handshake complete", self.key);
            return Disposition::Destroy;
        }

        if self.awaiting_data {
            self.state = TcbState::CloseWait;
            self.send(ctx, tcp_flags::ACK, None);
        } else {
            self.state = TcbState::LastAck;
            self.send(ctx, tcp_flags::FIN | tcp_flags::ACK, None);
            self.local_seq = self.local_seq.wrapping_add(1);
        }
        trace!("TCP {} device FIN -> {}", self.key, self.state);
        Disposition::Keep
    }

    /// Register or update interest in the relay socket
    ///
    /// # Errors
    ///
    /// Returns the registry error, or `NotConnected` if the socket is closed.
    pub fn watch(
        &mut self,
        poller: &PollerHandle<SharedTcb>,
        interest: Interest,
    ) -> io::Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        if self.registered {
            poller.reregister(stream, self.token, interest)
        } else {
            poller.register(stream, self.token, interest)?;
            self.registered = true;
            Ok(())
        }
    }

    /// Stop all readiness interest in the relay socket
    pub fn unwatch(&mut self, poller: &PollerHandle<SharedTcb>) {
        if let (true, Some(stream)) = (self.registered, self.stream.as_mut()) {
            if let Err(e) = poller.deregister(stream) {
                trace!("{} deregister failed: {}", self.key, e);
            }
        }
        self.registered = false;
    }

    /// Close the relay socket and forget its readiness token.
    ///
    /// Idempotent; the table entry is removed separately by the caller.
    pub fn close(&mut self, poller: &PollerHandle<SharedTcb>) {
        if self.stream.is_none() {
            return;
        }
        self.unwatch(poller);
        self.stream = None;
        poller.detach(self.token);
        debug!("TCP {} closed in {}", self.key, self.state);
    }

    /// Emit a segment with `flags` and the current sequence state.
    ///
    /// When `payload` is given it must already hold `payload_len` bytes at
    /// [`TCP_PAYLOAD_OFFSET`](crate::packet::TCP_PAYLOAD_OFFSET); otherwise a fresh buffer is used.
    pub fn send(&self, ctx: &RelayContext, flags: u8, payload: Option<(PooledBuffer, usize)>) {
        emit_segment(
            ctx,
            &self.key,
            &self.template,
            flags,
            self.local_seq,
            self.local_ack,
            payload,
        );
    }

    /// Emit RST+ACK at the current sequence state
    pub fn send_reset(&self, ctx: &RelayContext) {
        self.send(ctx, tcp_flags::RST | tcp_flags::ACK, None);
    }
}

/// Stamp `template` with `flags`, `seq` and `ack` and queue the segment for
/// the device.
///
/// Used directly for flows that have no control block.
pub fn emit_segment(
    ctx: &RelayContext,
    key: &FlowKey,
    template: &PacketHeaders,
    flags: u8,
    seq: u32,
    ack: u32,
    payload: Option<(PooledBuffer, usize)>,
) {
    let (mut buffer, payload_len) = payload.unwrap_or_else(|| (ctx.pool.acquire(), 0));
    match update_tcp_buffer(template, &mut buffer, flags, seq, ack, payload_len) {
        Ok(total) => {
            buffer.set_limit(total);
            buffer.set_position(0);
            if flags & tcp_flags::RST != 0 {
                RelayStats::incr(&ctx.stats.resets_sent);
            }
            trace!(
                "TCP {} -> device [{}] seq={} ack={} len={}",
                key,
                flags_string(flags),
                seq,
                ack,
                payload_len
            );
            ctx.send_to_device(buffer);
        }
        Err(e) => debug!("TCP {} failed to build segment: {}", key, e),
    }
}

impl fmt::Debug for Tcb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tcb")
            .field("key", &self.key)
            .field("state", &self.state)
            .field("local_seq", &self.local_seq)
            .field("local_ack", &self.local_ack)
            .field("awaiting_data", &self.awaiting_data)
            .field("unsent", &self.unsent.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
