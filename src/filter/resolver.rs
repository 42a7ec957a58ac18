//! Destination address → filter key resolution
//!
//! The pump consults the filter with a hostname derived from each packet's
//! destination address. [`LiteralResolver`] uses the dotted-quad text and
//! never touches the network. [`ReverseDnsResolver`] asks the system resolver
//! for the PTR name, which blocks; wrap it in a [`CachedResolver`] so the hot
//! path only pays for the first packet of each destination.

use std::ffi::CStr;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use moka::sync::Cache;
use tracing::trace;

/// Maximum hostname length returned by `getnameinfo` (`NI_MAXHOST`)
const NI_MAXHOST: usize = 1025;

/// Default number of cached reverse lookups
const DEFAULT_CACHE_CAPACITY: u64 = 4096;

/// Maps a destination address to the key looked up in the filter
pub trait HostResolver: Send + Sync + fmt::Debug {
    /// Filter key for `address`
    fn resolve(&self, address: Ipv4Addr) -> String;
}

/// Uses the address literal as the key
#[derive(Debug, Clone, Copy, Default)]
pub struct LiteralResolver;

impl HostResolver for LiteralResolver {
    fn resolve(&self, address: Ipv4Addr) -> String {
        address.to_string()
    }
}

/// Reverse-resolves through the system resolver, falling back to the
/// address literal when no name is registered
#[derive(Debug, Clone, Copy, Default)]
pub struct ReverseDnsResolver;

impl HostResolver for ReverseDnsResolver {
    fn resolve(&self, address: Ipv4Addr) -> String {
        match reverse_lookup(address) {
            Some(name) => {
                trace!("Reverse lookup {} -> {}", address, name);
                name
            }
            None => address.to_string(),
        }
    }
}

fn reverse_lookup(address: Ipv4Addr) -> Option<String> {
    let sockaddr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: 0,
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(address.octets()),
        },
        sin_zero: [0; 8],
    };
    let mut host = [0 as libc::c_char; NI_MAXHOST];

    // SAFETY: `sockaddr` is a fully initialized sockaddr_in of the stated
    // length and `host` is a writable buffer of the stated size
    #[allow(clippy::cast_possible_truncation)]
    let ret = unsafe {
        libc::getnameinfo(
            std::ptr::addr_of!(sockaddr).cast::<libc::sockaddr>(),
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            host.as_mut_ptr(),
            host.len() as libc::socklen_t,
            std::ptr::null_mut(),
            0,
            libc::NI_NAMEREQD,
        )
    };
    if ret != 0 {
        return None;
    }

    // SAFETY: getnameinfo NUL-terminates `host` on success
    let name = unsafe { CStr::from_ptr(host.as_ptr()) };
    name.to_str().ok().map(str::to_owned)
}

/// TTL cache in front of another resolver
pub struct CachedResolver<R> {
    inner: R,
    cache: Cache<Ipv4Addr, String>,
}

impl<R: HostResolver> CachedResolver<R> {
    /// Cache results of `inner` for `ttl`
    #[must_use]
    pub fn new(inner: R, ttl: Duration) -> Self {
        Self::with_capacity(inner, ttl, DEFAULT_CACHE_CAPACITY)
    }

    /// Cache at most `capacity` results of `inner` for `ttl`
    #[must_use]
    pub fn with_capacity(inner: R, ttl: Duration, capacity: u64) -> Self {
        Self {
            inner,
            cache: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Number of cached entries
    #[must_use]
    pub fn cached(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}

impl<R> fmt::Debug for CachedResolver<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedResolver")
            .field("entries", &self.cache.entry_count())
            .finish_non_exhaustive()
    }
}

impl<R: HostResolver> HostResolver for CachedResolver<R> {
    fn resolve(&self, address: Ipv4Addr) -> String {
        self.cache
            .get_with(address, || self.inner.resolve(address))
    }
}
