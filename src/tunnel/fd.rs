//! File-descriptor backed TUN device
//!
//! Wraps a TUN descriptor opened without packet information (`IFF_NO_PI`),
//! so every `read`/`write` carries exactly one raw IPv4 datagram.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info};

use super::TunDevice;

/// How long a write waits for a full device queue to drain
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause between write attempts on a full device queue
const WRITE_RETRY_INTERVAL: Duration = Duration::from_micros(200);

/// Non-blocking TUN file descriptor
#[derive(Debug)]
pub struct FdTun {
    fd: RwLock<Option<OwnedFd>>,
    name: String,
}

impl FdTun {
    /// Take ownership of a TUN descriptor supplied by the platform and switch
    /// it to non-blocking mode
    ///
    /// # Errors
    ///
    /// Returns the `fcntl` error.
    pub fn from_fd(fd: OwnedFd, name: impl Into<String>) -> io::Result<Self> {
        set_nonblocking(&fd)?;
        Ok(Self {
            fd: RwLock::new(Some(fd)),
            name: name.into(),
        })
    }

    /// Interface name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create (or attach to) the TUN interface `name` through `/dev/net/tun`
    ///
    /// # Errors
    ///
    /// Returns `TunnelError::Open` if the device cannot be opened, usually
    /// for lack of `CAP_NET_ADMIN`.
    #[cfg(target_os = "linux")]
    pub fn open(name: &str) -> Result<Self, crate::error::TunnelError> {
        use std::os::fd::FromRawFd;

        use crate::error::TunnelError;

        const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
        const IFF_TUN: libc::c_short = 0x0001;
        const IFF_NO_PI: libc::c_short = 0x1000;

        #[repr(C)]
        struct Ifreq {
            ifr_name: [libc::c_char; libc::IFNAMSIZ],
            ifr_flags: libc::c_short,
            _padding: [u8; 22],
        }

        if name.is_empty() || name.len() >= libc::IFNAMSIZ {
            return Err(TunnelError::open(name, "interface name must be 1-15 bytes"));
        }

        // SAFETY: the path is a NUL-terminated static byte string
        let raw = unsafe {
            libc::open(
                b"/dev/net/tun\0".as_ptr().cast::<libc::c_char>(),
                libc::O_RDWR | libc::O_CLOEXEC,
            )
        };
        if raw < 0 {
            return Err(TunnelError::open(
                name,
                format!("open /dev/net/tun: {}", io::Error::last_os_error()),
            ));
        }
        // SAFETY: `raw` was just returned by open and is owned by nobody else
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut ifr = Ifreq {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: IFF_TUN | IFF_NO_PI,
            _padding: [0; 22],
        };
        for (dst, &b) in ifr.ifr_name.iter_mut().zip(name.as_bytes()) {
            *dst = b as libc::c_char;
        }

        // SAFETY: `ifr` matches the kernel's `struct ifreq` layout and
        // outlives the call; the fd is open
        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF, &ifr) };
        if ret < 0 {
            return Err(TunnelError::open(
                name,
                format!("TUNSETIFF: {}", io::Error::last_os_error()),
            ));
        }

        let tun = Self::from_fd(fd, name).map_err(|e| TunnelError::open(name, e.to_string()))?;
        info!("Opened TUN device {}", name);
        Ok(tun)
    }

    fn with_fd<T>(&self, f: impl FnOnce(libc::c_int) -> io::Result<T>) -> io::Result<T> {
        let fd = self.fd.read();
        match fd.as_ref() {
            Some(fd) => f(fd.as_raw_fd()),
            None => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }
}

impl TunDevice for FdTun {
    fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.with_fd(|fd| {
            // SAFETY: `buf` is valid for writes of `buf.len()` bytes
            let ret = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            #[allow(clippy::cast_sign_loss)]
            let n = ret as usize;
            Ok(n)
        })
    }

    fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        self.with_fd(|fd| {
            let deadline = Instant::now() + WRITE_TIMEOUT;
            loop {
                // SAFETY: `packet` is valid for reads of `packet.len()` bytes
                let ret = unsafe { libc::write(fd, packet.as_ptr().cast(), packet.len()) };
                if ret >= 0 {
                    #[allow(clippy::cast_sign_loss)]
                    let written = ret as usize;
                    if written != packet.len() {
                        return Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            format!("short TUN write: {written} of {}", packet.len()),
                        ));
                    }
                    return Ok(());
                }

                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::Interrupted => {}
                    io::ErrorKind::WouldBlock if Instant::now() < deadline => {
                        thread::sleep(WRITE_RETRY_INTERVAL);
                    }
                    _ => return Err(err),
                }
            }
        })
    }

    fn close(&self) {
        if self.fd.write().take().is_some() {
            debug!("Closed TUN device {}", self.name);
        }
    }
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    // SAFETY: F_GETFL/F_SETFL take no pointers; the fd is borrowed and open
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Assign the interface address, MTU and captured route, then bring the
/// link up, using the `ip` tool
///
/// # Errors
///
/// Returns `TunnelError::Open` naming the first command that failed.
#[cfg(target_os = "linux")]
pub fn configure_interface(
    name: &str,
    config: &crate::config::TunnelConfig,
) -> Result<(), crate::error::TunnelError> {
    use std::process::Command;

    use crate::error::TunnelError;

    let (route_addr, route_prefix) = config
        .route_parts()
        .map_err(|e| TunnelError::open(name, e.to_string()))?;
    let address = format!("{}/{}", config.address, config.prefix_len);
    let mtu = config.mtu.to_string();
    let route = format!("{route_addr}/{route_prefix}");

    let steps: [&[&str]; 4] = [
        &["addr", "add", address.as_str(), "dev", name],
        &["link", "set", "dev", name, "mtu", mtu.as_str()],
        &["link", "set", "dev", name, "up"],
        &["route", "replace", route.as_str(), "dev", name],
    ];

    for args in steps {
        let status = Command::new("ip")
            .args(args)
            .status()
            .map_err(|e| TunnelError::open(name, format!("ip {}: {e}", args.join(" "))))?;
        if !status.success() {
            return Err(TunnelError::open(
                name,
                format!("ip {} exited with {status}", args.join(" ")),
            ));
        }
        debug!("ip {}", args.join(" "));
    }

    info!("Configured {} with {} and route {}", name, address, route);
    Ok(())
}
