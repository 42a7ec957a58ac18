//! Socket protection
//!
//! Every relay socket must be excluded from the tunnel's own route before it
//! connects, otherwise its traffic would loop back into the virtual
//! interface. The engine calls [`SocketProtector::protect`] on each freshly
//! created `socket2::Socket`, before `connect`.
//!
//! - [`NoopProtector`]: the embedder already isolates the relay (separate
//!   network namespace, uid routing rule).
//! - [`MarkProtector`]: Linux policy routing via `SO_MARK` and/or
//!   `SO_BINDTODEVICE`.
//! - [`FnProtector`]: adapter for a platform-supplied hook taking a raw fd.

use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use socket2::Socket;
use tracing::debug;

use crate::config::ProtectConfig;
use crate::error::FlowError;

/// Hook that keeps a relay socket from re-entering the tunnel
pub trait SocketProtector: Send + Sync + fmt::Debug {
    /// Protect `socket`; called once, before connect
    ///
    /// # Errors
    ///
    /// Returns `FlowError::SocketOption` if the socket cannot be protected;
    /// the flow is then abandoned.
    fn protect(&self, socket: &Socket) -> Result<(), FlowError>;
}

/// Build the protector described by `config`
#[must_use]
pub fn from_config(config: &ProtectConfig) -> Arc<dyn SocketProtector> {
    if config.is_enabled() {
        Arc::new(MarkProtector {
            routing_mark: config.routing_mark,
            bind_interface: config.bind_interface.clone(),
        })
    } else {
        Arc::new(NoopProtector)
    }
}

/// Leaves sockets untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProtector;

impl SocketProtector for NoopProtector {
    fn protect(&self, _socket: &Socket) -> Result<(), FlowError> {
        Ok(())
    }
}

/// Applies `SO_MARK` and `SO_BINDTODEVICE`
#[derive(Debug, Clone, Default)]
pub struct MarkProtector {
    /// Routing mark for policy routing
    pub routing_mark: Option<u32>,
    /// Interface the socket is bound to
    pub bind_interface: Option<String>,
}

impl SocketProtector for MarkProtector {
    fn protect(&self, socket: &Socket) -> Result<(), FlowError> {
        if let Some(interface) = &self.bind_interface {
            set_bind_device(socket, interface)?;
        }
        if let Some(mark) = self.routing_mark {
            set_routing_mark(socket, mark)?;
        }
        Ok(())
    }
}

/// Wraps a platform hook that receives the raw descriptor and reports
/// success, like a mobile VPN service's `protect(fd)`
pub struct FnProtector<F>(pub F);

impl<F> fmt::Debug for FnProtector<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnProtector")
    }
}

impl<F> SocketProtector for FnProtector<F>
where
    F: Fn(RawFd) -> bool + Send + Sync,
{
    fn protect(&self, socket: &Socket) -> Result<(), FlowError> {
        let fd = socket.as_raw_fd();
        if (self.0)(fd) {
            Ok(())
        } else {
            Err(FlowError::socket_option(
                "protect",
                format!("platform hook rejected fd {fd}"),
            ))
        }
    }
}

/// Bind the socket to a specific interface (`SO_BINDTODEVICE`)
#[cfg(target_os = "linux")]
fn set_bind_device(socket: &Socket, interface: &str) -> Result<(), FlowError> {
    // Interface name must be null-terminated and fit in IFNAMSIZ (16 bytes)
    if interface.len() > 15 {
        return Err(FlowError::socket_option(
            "SO_BINDTODEVICE",
            format!("Interface name too long: {interface} (max 15 chars)"),
        ));
    }

    let mut ifname = [0u8; 16];
    ifname[..interface.len()].copy_from_slice(interface.as_bytes());

    // SAFETY: `ifname` is NUL-padded, outlives the call and its length is passed
    #[allow(clippy::cast_possible_truncation)]
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            ifname.as_ptr().cast::<libc::c_void>(),
            ifname.len() as libc::socklen_t,
        )
    };

    if ret != 0 {
        let err = io::Error::last_os_error();
        return Err(FlowError::socket_option(
            "SO_BINDTODEVICE",
            format!("Failed to bind to interface {interface}: {err}"),
        ));
    }

    debug!("Bound relay socket to interface: {}", interface);
    Ok(())
}

/// Set `SO_MARK` for policy routing
#[cfg(target_os = "linux")]
fn set_routing_mark(socket: &Socket, mark: u32) -> Result<(), FlowError> {
    // SAFETY: `mark` is a live u32 and its exact size is passed
    #[allow(clippy::cast_possible_truncation)]
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_MARK,
            std::ptr::addr_of!(mark).cast::<libc::c_void>(),
            std::mem::size_of::<u32>() as libc::socklen_t,
        )
    };

    if ret != 0 {
        let err = io::Error::last_os_error();
        return Err(FlowError::socket_option(
            "SO_MARK",
            format!("Failed to set routing mark {mark}: {err}"),
        ));
    }

    debug!("Set relay socket routing mark: {}", mark);
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_bind_device(_socket: &Socket, interface: &str) -> Result<(), FlowError> {
    Err(FlowError::socket_option(
        "SO_BINDTODEVICE",
        format!("not supported on this platform ({interface})"),
    ))
}

#[cfg(not(target_os = "linux"))]
fn set_routing_mark(_socket: &Socket, mark: u32) -> Result<(), FlowError> {
    Err(FlowError::socket_option(
        "SO_MARK",
        format!("not supported on this platform ({mark})"),
    ))
}
