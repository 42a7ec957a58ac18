//! Tunnel pump
//!
//! Single loop between the virtual interface and the translators. Each
//! iteration reads at most one datagram from the device and writes at most
//! one translated datagram back; when neither direction had work it waits on
//! the device queue for one idle period.

use std::io;
use std::sync::Arc;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, info, trace, warn};

use super::TunDevice;
use crate::engine::{RelayContext, RelayStats};
use crate::error::TunnelError;
use crate::filter::PacketFilter;
use crate::io::PooledBuffer;
use crate::observer::ObserverSlot;
use crate::packet::{Packet, TransportProtocol};

/// Moves datagrams between the device and the translators
pub struct TunnelPump {
    ctx: RelayContext,
    device: Arc<dyn TunDevice>,
    device_rx: Receiver<PooledBuffer>,
    tcp_tx: Sender<Packet>,
    udp_tx: Sender<Packet>,
    filter: Option<PacketFilter>,
    observer: Option<ObserverSlot>,
}

impl TunnelPump {
    /// Create the pump
    pub fn new(
        ctx: RelayContext,
        device: Arc<dyn TunDevice>,
        device_rx: Receiver<PooledBuffer>,
        tcp_tx: Sender<Packet>,
        udp_tx: Sender<Packet>,
    ) -> Self {
        Self {
            ctx,
            device,
            device_rx,
            tcp_tx,
            udp_tx,
            filter: None,
            observer: None,
        }
    }

    /// Consult `filter` for every datagram before it is enqueued
    #[must_use]
    pub fn with_filter(mut self, filter: Option<PacketFilter>) -> Self {
        self.filter = filter;
        self
    }

    /// Report every processed datagram to `observer`
    #[must_use]
    pub fn with_observer(mut self, observer: Option<ObserverSlot>) -> Self {
        self.observer = observer;
        self
    }

    /// Pump until the engine stops
    ///
    /// # Errors
    ///
    /// Returns `TunnelError::Io` if reading from or writing to the device
    /// fails.
    pub fn run(self) -> Result<(), TunnelError> {
        info!("Tunnel pump started");
        // A buffer that did not leave the pump is reused for the next read
        let mut spare: Option<PooledBuffer> = None;

        while !self.ctx.is_stopping() {
            let mut worked = false;

            let mut buffer = spare.take().unwrap_or_else(|| self.ctx.pool.acquire());
            buffer.reset();
            match self.device.read_packet(&mut buffer) {
                Ok(0) => spare = Some(buffer),
                Ok(n) => {
                    worked = true;
                    buffer.set_limit(n);
                    spare = self.dispatch(buffer);
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) =>
                {
                    spare = Some(buffer);
                }
                Err(e) => return Err(TunnelError::Io(e)),
            }

            match self.device_rx.try_recv() {
                Ok(outbound) => {
                    worked = true;
                    self.write(&outbound)?;
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => {}
            }

            if !worked {
                match self.device_rx.recv_timeout(self.ctx.idle_sleep) {
                    Ok(outbound) => self.write(&outbound)?,
                    Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {}
                }
            }
        }

        info!("Tunnel pump stopped");
        Ok(())
    }

    /// Classify one datagram and hand it to its translator.
    ///
    /// Returns the buffer when the datagram was dropped and the slot can be
    /// reused.
    fn dispatch(&self, buffer: PooledBuffer) -> Option<PooledBuffer> {
        let stats = &self.ctx.stats;
        RelayStats::incr(&stats.packets_from_device);
        RelayStats::add(&stats.bytes_from_device, buffer.limit());

        let packet = match Packet::parse(buffer) {
            Ok(packet) => packet,
            Err(e) => {
                RelayStats::incr(&stats.malformed);
                debug!("Dropping malformed datagram: {}", e);
                return None;
            }
        };

        let verdict = self.filter.as_ref().map(|f| f.check(packet.ip().destination));
        if let Some(observer) = &self.observer {
            observer.notify(&packet, verdict);
        }
        if verdict.is_some_and(|v| !v.forwards()) {
            RelayStats::incr(&stats.filtered);
            trace!("Filtered {}", packet);
            return Some(packet.into_buffer());
        }

        let queue = match packet.ip().protocol {
            TransportProtocol::Tcp if packet.is_tcp() => &self.tcp_tx,
            TransportProtocol::Udp if packet.is_udp() => &self.udp_tx,
            protocol => {
                RelayStats::incr(&stats.unknown_protocol);
                warn!(
                    "Dropping {} datagram to {}: unsupported protocol",
                    protocol,
                    packet.ip().destination
                );
                return Some(packet.into_buffer());
            }
        };

        if queue.send(packet).is_err() {
            trace!("Translator queue closed, datagram dropped");
        }
        None
    }

    fn write(&self, buffer: &PooledBuffer) -> Result<(), TunnelError> {
        let datagram = buffer.filled();
        self.device.write_packet(datagram)?;
        RelayStats::incr(&self.ctx.stats.packets_to_device);
        RelayStats::add(&self.ctx.stats.bytes_to_device, datagram.len());
        Ok(())
    }
}
