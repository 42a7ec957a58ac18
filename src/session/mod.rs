//! Session tables
//!
//! Two independent [`SessionTable`]s exist per engine, one for TCP control
//! blocks and one for UDP sockets, both keyed by [`FlowKey`].

mod table;

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

pub use table::{EvictionHandler, RemovalCause, SessionTable};

use crate::packet::PacketHeaders;

/// Identifies one relay session.
///
/// The tunnel has a single client, so the client address is implicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Remote host the device is talking to
    pub destination: Ipv4Addr,
    /// Remote port
    pub destination_port: u16,
    /// Device-side port
    pub source_port: u16,
}

impl FlowKey {
    /// Create a new flow key
    #[must_use]
    pub const fn new(destination: Ipv4Addr, destination_port: u16, source_port: u16) -> Self {
        Self {
            destination,
            destination_port,
            source_port,
        }
    }

    /// Key of a device-originated packet, if its protocol has ports
    #[must_use]
    pub fn from_headers(headers: &PacketHeaders) -> Option<Self> {
        let (source_port, destination_port) = headers.transport.ports()?;
        Some(Self::new(headers.ip.destination, destination_port, source_port))
    }

    /// Remote endpoint the relay socket connects to
    #[must_use]
    pub fn remote(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.destination, self.destination_port))
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.destination, self.destination_port, self.source_port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{build_tcp_packet, build_udp_packet, tcp_flags};
    use std::collections::HashSet;

    #[test]
    fn test_from_headers() {
        let bytes = build_tcp_packet(
            "10.1.10.1:41000".parse().unwrap(),
            "1.1.1.1:443".parse().unwrap(),
            1,
            0,
            tcp_flags::SYN,
            b"",
        )
        .unwrap();
        let (headers, _) = PacketHeaders::parse(&bytes).unwrap();
        let key = FlowKey::from_headers(&headers).unwrap();
        assert_eq!(key, FlowKey::new(Ipv4Addr::new(1, 1, 1, 1), 443, 41000));
        assert_eq!(key.remote(), "1.1.1.1:443".parse::<SocketAddr>().unwrap());
        assert_eq!(key.to_string(), "1.1.1.1:443:41000");
    }

    #[test]
    fn test_distinct_source_ports_distinct_keys() {
        let keys: HashSet<FlowKey> = (0..3)
            .map(|i| {
                let bytes = build_udp_packet(
                    SocketAddrV4::new(Ipv4Addr::new(10, 1, 10, 1), 5000 + i),
                    "8.8.8.8:53".parse().unwrap(),
                    b"",
                )
                .unwrap();
                let (headers, _) = PacketHeaders::parse(&bytes).unwrap();
                FlowKey::from_headers(&headers).unwrap()
            })
            .collect();
        assert_eq!(keys.len(), 3);
    }
}
