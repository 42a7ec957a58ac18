//! UDP NAT entry

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use mio::net::UdpSocket;
use mio::{Interest, Token};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace};

use crate::error::FlowError;
use crate::packet::PacketHeaders;
use crate::poller::PollerHandle;
use crate::protect::SocketProtector;
use crate::session::FlowKey;

/// A UDP session shared between the UDP workers
pub type SharedUdpSession = Arc<Mutex<UdpSession>>;

/// Connected datagram socket relaying one device flow
pub struct UdpSession {
    /// Flow this session belongs to
    pub key: FlowKey,
    /// Device's first datagram with endpoints swapped
    pub template: PacketHeaders,
    token: Token,
    socket: Option<UdpSocket>,
}

impl UdpSession {
    /// Open a protected socket connected to the flow's destination
    ///
    /// # Errors
    ///
    /// Returns `FlowError` if the socket cannot be created, protected or
    /// connected.
    pub fn open(
        key: FlowKey,
        template: PacketHeaders,
        token: Token,
        protector: &dyn SocketProtector,
    ) -> Result<Self, FlowError> {
        let remote = key.remote();
        let socket = connect(remote, protector)?;
        debug!("UDP {} opened", key);
        Ok(Self {
            key,
            template,
            token,
            socket: Some(socket),
        })
    }

    /// Readiness token of this flow
    #[must_use]
    pub const fn token(&self) -> Token {
        self.token
    }

    /// Whether the socket has been closed
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.socket.is_none()
    }

    /// Relay socket, if still open
    pub fn socket(&self) -> Option<&UdpSocket> {
        self.socket.as_ref()
    }

    /// Register for read readiness
    ///
    /// # Errors
    ///
    /// Returns the registry error, or `NotConnected` if the socket is closed.
    pub fn watch(&mut self, poller: &PollerHandle<SharedUdpSession>) -> io::Result<()> {
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        poller.register(socket, self.token, Interest::READABLE)
    }

    /// Send one datagram to the remote
    ///
    /// # Errors
    ///
    /// Returns the socket error; `WouldBlock` means the datagram was not sent.
    pub fn send(&self, payload: &[u8]) -> io::Result<usize> {
        self.socket
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?
            .send(payload)
    }

    /// Close the socket and forget its readiness token. Idempotent.
    pub fn close(&mut self, poller: &PollerHandle<SharedUdpSession>) {
        let Some(mut socket) = self.socket.take() else {
            return;
        };
        if let Err(e) = poller.deregister(&mut socket) {
            trace!("UDP {} deregister failed: {}", self.key, e);
        }
        poller.detach(self.token);
        debug!("UDP {} closed", self.key);
    }
}

impl fmt::Debug for UdpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpSession")
            .field("key", &self.key)
            .field("token", &self.token)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn connect(remote: SocketAddr, protector: &dyn SocketProtector) -> Result<UdpSocket, FlowError> {
    let connect_error = |source| FlowError::Connect {
        addr: remote,
        source,
    };

    let socket =
        Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(connect_error)?;
    protector.protect(&socket)?;
    socket.connect(&remote.into()).map_err(connect_error)?;
    socket.set_nonblocking(true).map_err(connect_error)?;

    let socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(socket))
}
