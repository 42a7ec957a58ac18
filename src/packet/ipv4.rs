//! IPv4 header codec

use std::fmt;
use std::net::Ipv4Addr;

use super::checksum::ipv4_header_checksum;
use super::{IPPROTO_TCP, IPPROTO_UDP};
use crate::error::PacketError;

/// Size of an IPv4 header without options
pub const IPV4_HEADER_LEN: usize = 20;

/// Transport protocol carried by an IPv4 datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    /// Protocol 6
    Tcp,
    /// Protocol 17
    Udp,
    /// Anything else; only the IPv4 header is parsed
    Other(u8),
}

impl TransportProtocol {
    /// Protocol number as carried in the header
    #[must_use]
    pub const fn number(self) -> u8 {
        match self {
            Self::Tcp => IPPROTO_TCP,
            Self::Udp => IPPROTO_UDP,
            Self::Other(n) => n,
        }
    }
}

impl From<u8> for TransportProtocol {
    fn from(n: u8) -> Self {
        match n {
            IPPROTO_TCP => Self::Tcp,
            IPPROTO_UDP => Self::Udp,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "TCP"),
            Self::Udp => write!(f, "UDP"),
            Self::Other(n) => write!(f, "proto-{n}"),
        }
    }
}

/// Parsed IPv4 header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    /// IP version (always 4 once parsed)
    pub version: u8,
    /// Header length in 32-bit words
    pub ihl: u8,
    /// Type-of-service byte
    pub type_of_service: u8,
    /// Total datagram length
    pub total_length: u16,
    /// Identification, flags and fragment offset as one field
    pub identification_and_flags: u32,
    /// Time to live
    pub ttl: u8,
    /// Transport protocol
    pub protocol: TransportProtocol,
    /// Header checksum as read
    pub header_checksum: u16,
    /// Source address
    pub source: Ipv4Addr,
    /// Destination address
    pub destination: Ipv4Addr,
}

impl Ipv4Header {
    /// Parse the IPv4 header at the start of `data`
    ///
    /// # Errors
    ///
    /// Returns `PacketError` if the data is shorter than the header, the
    /// version is not 4, or the IHL is below 5 words.
    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < IPV4_HEADER_LEN {
            return Err(PacketError::truncated(IPV4_HEADER_LEN, data.len()));
        }

        let version = data[0] >> 4;
        if version != 4 {
            return Err(PacketError::UnsupportedVersion(version));
        }

        let ihl = data[0] & 0x0F;
        let header_len = usize::from(ihl) * 4;
        if header_len < IPV4_HEADER_LEN {
            return Err(PacketError::InvalidHeaderLength(header_len));
        }
        if data.len() < header_len {
            return Err(PacketError::truncated(header_len, data.len()));
        }

        Ok(Self {
            version,
            ihl,
            type_of_service: data[1],
            total_length: u16::from_be_bytes([data[2], data[3]]),
            identification_and_flags: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ttl: data[8],
            protocol: TransportProtocol::from(data[9]),
            header_checksum: u16::from_be_bytes([data[10], data[11]]),
            source: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            destination: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
        })
    }

    /// Header length in bytes
    #[must_use]
    pub const fn header_len(&self) -> usize {
        self.ihl as usize * 4
    }

    /// Write this header as a 20-byte option-less header carrying
    /// `total_length`, then fill in its checksum.
    ///
    /// `out` must hold at least [`IPV4_HEADER_LEN`] bytes.
    pub fn write(&self, out: &mut [u8], total_length: u16) {
        let out = &mut out[..IPV4_HEADER_LEN];
        out[0] = 0x45;
        out[1] = self.type_of_service;
        out[2..4].copy_from_slice(&total_length.to_be_bytes());
        out[4..8].copy_from_slice(&self.identification_and_flags.to_be_bytes());
        out[8] = self.ttl;
        out[9] = self.protocol.number();
        out[10..12].fill(0);
        out[12..16].copy_from_slice(&self.source.octets());
        out[16..20].copy_from_slice(&self.destination.octets());

        let checksum = ipv4_header_checksum(out);
        out[10..12].copy_from_slice(&checksum.to_be_bytes());
    }
}
