//! In-memory virtual interface

use std::io;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;

use super::TunDevice;

/// Engine side of an in-memory tunnel
#[derive(Debug)]
pub struct ChannelTun {
    inbound: Receiver<Vec<u8>>,
    outbound: Mutex<Option<Sender<Vec<u8>>>>,
}

/// Device side of an in-memory tunnel
#[derive(Debug, Clone)]
pub struct TunPeer {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

impl ChannelTun {
    /// Create a connected tunnel / peer pair
    #[must_use]
    pub fn pair() -> (Self, TunPeer) {
        let (to_engine, inbound) = unbounded();
        let (outbound, to_peer) = unbounded();
        let tun = Self {
            inbound,
            outbound: Mutex::new(Some(outbound)),
        };
        let peer = TunPeer {
            tx: to_engine,
            rx: to_peer,
        };
        (tun, peer)
    }

    /// Whether `close` has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.outbound.lock().is_none()
    }
}

impl TunDevice for ChannelTun {
    fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inbound.try_recv() {
            Ok(packet) => {
                if packet.len() > buf.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("datagram of {} bytes exceeds buffer", packet.len()),
                    ));
                }
                buf[..packet.len()].copy_from_slice(&packet);
                Ok(packet.len())
            }
            Err(TryRecvError::Empty) => Err(io::ErrorKind::WouldBlock.into()),
            Err(TryRecvError::Disconnected) => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }

    fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        let outbound = self.outbound.lock();
        let tx = outbound
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))?;
        tx.send(packet.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    fn close(&self) {
        self.outbound.lock().take();
    }
}

impl TunPeer {
    /// Inject a datagram as if the device sent it.
    ///
    /// Returns `false` if the engine side is gone.
    pub fn send(&self, packet: Vec<u8>) -> bool {
        self.tx.send(packet).is_ok()
    }

    /// Next datagram written by the engine, waiting up to `timeout`
    #[must_use]
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Next datagram written by the engine, if one is queued
    #[must_use]
    pub fn try_recv(&self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }

    /// Whether the engine closed its side and every queued datagram was read
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }
}
