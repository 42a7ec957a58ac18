//! Packet codec
//!
//! Parses and serializes IPv4/TCP/UDP headers in place inside pooled buffers.
//!
//! A [`Packet`] is a parsed view over one datagram read from the virtual
//! interface: its [`PacketHeaders`] plus the buffer it lives in, with the
//! buffer cursor positioned on the transport payload. Replies are never built
//! from scratch; a session keeps a [`PacketHeaders`] template (the device's
//! first packet with endpoints swapped) and [`update_tcp_buffer`] /
//! [`update_udp_buffer`] stamp headers around a payload already placed at
//! [`TCP_PAYLOAD_OFFSET`] / [`UDP_PAYLOAD_OFFSET`].
//!
//! Egress headers are always option-less: 20-byte IPv4, 20-byte TCP, 8-byte
//! UDP with the checksum disabled.

pub mod checksum;
mod ipv4;
mod tcp;
mod udp;

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

pub use checksum::{internet_checksum, ipv4_header_checksum, tcp_checksum, verify_ipv4_checksum};
pub use ipv4::{Ipv4Header, TransportProtocol, IPV4_HEADER_LEN};
pub use tcp::{flags_string, tcp_flags, TcpHeader, TCP_HEADER_LEN};
pub use udp::{UdpHeader, UDP_HEADER_LEN};

use crate::error::PacketError;
use crate::io::PooledBuffer;

/// IP protocol number for TCP
pub const IPPROTO_TCP: u8 = 6;

/// IP protocol number for UDP
pub const IPPROTO_UDP: u8 = 17;

/// Where a synthesized TCP segment's payload starts
pub const TCP_PAYLOAD_OFFSET: usize = IPV4_HEADER_LEN + TCP_HEADER_LEN;

/// Where a synthesized UDP datagram's payload starts
pub const UDP_PAYLOAD_OFFSET: usize = IPV4_HEADER_LEN + UDP_HEADER_LEN;

/// Default TTL of packets built from scratch
const DEFAULT_TTL: u8 = 64;

/// Transport header selected by the IPv4 protocol number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportHeader {
    /// TCP segment
    Tcp(TcpHeader),
    /// UDP datagram
    Udp(UdpHeader),
    /// Unrecognized protocol, IPv4 header only
    None,
}

impl TransportHeader {
    /// Length of the transport header in bytes
    #[must_use]
    pub const fn header_len(&self) -> usize {
        match self {
            Self::Tcp(tcp) => tcp.header_len(),
            Self::Udp(_) => UDP_HEADER_LEN,
            Self::None => 0,
        }
    }

    /// Source and destination ports, if the protocol has them
    #[must_use]
    pub const fn ports(&self) -> Option<(u16, u16)> {
        match self {
            Self::Tcp(tcp) => Some((tcp.source_port, tcp.destination_port)),
            Self::Udp(udp) => Some((udp.source_port, udp.destination_port)),
            Self::None => None,
        }
    }
}

/// IPv4 header plus transport header of one datagram.
///
/// `Copy`, so sessions keep one as a reply template without holding a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeaders {
    /// IPv4 header
    pub ip: Ipv4Header,
    /// Transport header
    pub transport: TransportHeader,
}

impl PacketHeaders {
    /// Parse the headers at the start of `data`.
    ///
    /// Returns the headers and the byte range of the payload, bounded by the
    /// IPv4 total length.
    ///
    /// # Errors
    ///
    /// Returns `PacketError` if any header is malformed or the datagram is
    /// shorter than its total length claims.
    pub fn parse(data: &[u8]) -> Result<(Self, std::ops::Range<usize>), PacketError> {
        let ip = Ipv4Header::parse(data)?;

        let total_length = usize::from(ip.total_length);
        if total_length < ip.header_len() {
            return Err(PacketError::truncated(ip.header_len(), total_length));
        }
        if data.len() < total_length {
            return Err(PacketError::truncated(total_length, data.len()));
        }
        let datagram = &data[..total_length];
        let transport_data = &datagram[ip.header_len()..];

        let transport = match ip.protocol {
            TransportProtocol::Tcp => TransportHeader::Tcp(TcpHeader::parse(transport_data)?),
            TransportProtocol::Udp => TransportHeader::Udp(UdpHeader::parse(transport_data)?),
            TransportProtocol::Other(_) => TransportHeader::None,
        };

        let payload_start = ip.header_len() + transport.header_len();
        Ok((Self { ip, transport }, payload_start..total_length))
    }

    /// The same headers with source and destination (addresses and ports)
    /// exchanged, for use as a reply template.
    #[must_use]
    pub fn swapped(&self) -> Self {
        let mut out = *self;
        std::mem::swap(&mut out.ip.source, &mut out.ip.destination);
        match &mut out.transport {
            TransportHeader::Tcp(tcp) => {
                std::mem::swap(&mut tcp.source_port, &mut tcp.destination_port);
            }
            TransportHeader::Udp(udp) => {
                std::mem::swap(&mut udp.source_port, &mut udp.destination_port);
            }
            TransportHeader::None => {}
        }
        out
    }

    /// TCP header, if this is a TCP packet
    #[must_use]
    pub const fn tcp(&self) -> Option<&TcpHeader> {
        match &self.transport {
            TransportHeader::Tcp(tcp) => Some(tcp),
            _ => None,
        }
    }

    /// UDP header, if this is a UDP packet
    #[must_use]
    pub const fn udp(&self) -> Option<&UdpHeader> {
        match &self.transport {
            TransportHeader::Udp(udp) => Some(udp),
            _ => None,
        }
    }

    /// Destination socket address, if the protocol has ports
    #[must_use]
    pub fn destination(&self) -> Option<SocketAddrV4> {
        self.transport
            .ports()
            .map(|(_, dst)| SocketAddrV4::new(self.ip.destination, dst))
    }

    /// Source socket address, if the protocol has ports
    #[must_use]
    pub fn source(&self) -> Option<SocketAddrV4> {
        self.transport
            .ports()
            .map(|(src, _)| SocketAddrV4::new(self.ip.source, src))
    }
}

impl fmt::Display for PacketHeaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.transport, self.source(), self.destination()) {
            (TransportHeader::Tcp(tcp), Some(src), Some(dst)) => write!(
                f,
                "TCP {src} -> {dst} [{}] seq={} ack={}",
                tcp.flags_string(),
                tcp.sequence_number,
                tcp.acknowledgement_number
            ),
            (TransportHeader::Udp(_), Some(src), Some(dst)) => write!(f, "UDP {src} -> {dst}"),
            _ => write!(
                f,
                "{} {} -> {}",
                self.ip.protocol, self.ip.source, self.ip.destination
            ),
        }
    }
}

/// A parsed datagram living in a pooled buffer.
///
/// The buffer cursor spans the transport payload. Dropping the packet
/// returns the buffer to its pool.
#[derive(Debug)]
pub struct Packet {
    headers: PacketHeaders,
    buffer: PooledBuffer,
}

impl Packet {
    /// Parse the datagram held in `buffer[..limit]`.
    ///
    /// # Errors
    ///
    /// Returns `PacketError` if the headers are malformed; the buffer is
    /// released.
    pub fn parse(mut buffer: PooledBuffer) -> Result<Self, PacketError> {
        let (headers, payload) = PacketHeaders::parse(&buffer[..buffer.limit()])?;
        buffer.set_limit(payload.end);
        buffer.set_position(payload.start);
        Ok(Self { headers, buffer })
    }

    /// Parsed headers
    #[must_use]
    pub const fn headers(&self) -> &PacketHeaders {
        &self.headers
    }

    /// IPv4 header
    #[must_use]
    pub const fn ip(&self) -> &Ipv4Header {
        &self.headers.ip
    }

    /// TCP header, if this is a TCP packet
    #[must_use]
    pub const fn tcp(&self) -> Option<&TcpHeader> {
        self.headers.tcp()
    }

    /// UDP header, if this is a UDP packet
    #[must_use]
    pub const fn udp(&self) -> Option<&UdpHeader> {
        self.headers.udp()
    }

    /// Check if this is a TCP packet
    #[must_use]
    pub const fn is_tcp(&self) -> bool {
        matches!(self.headers.transport, TransportHeader::Tcp(_))
    }

    /// Check if this is a UDP packet
    #[must_use]
    pub const fn is_udp(&self) -> bool {
        matches!(self.headers.transport, TransportHeader::Udp(_))
    }

    /// Transport payload
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        self.buffer.filled()
    }

    /// Transport payload length
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.buffer.remaining()
    }

    /// Give back the underlying buffer
    #[must_use]
    pub fn into_buffer(self) -> PooledBuffer {
        self.buffer
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} len={}", self.headers, self.payload_len())
    }
}

fn check_capacity(buffer: &[u8], needed: usize) -> Result<u16, PacketError> {
    if buffer.len() < needed {
        return Err(PacketError::BufferTooSmall {
            needed,
            capacity: buffer.len(),
        });
    }
    u16::try_from(needed).map_err(|_| PacketError::BufferTooSmall {
        needed,
        capacity: usize::from(u16::MAX),
    })
}

/// Stamp IPv4 + TCP headers from `template` around the `payload_len` bytes
/// already at `buffer[TCP_PAYLOAD_OFFSET..]`, filling in both checksums.
///
/// Returns the total length of the resulting datagram.
///
/// # Errors
///
/// Returns `PacketError` if the template is not TCP or the buffer cannot
/// hold the segment.
pub fn update_tcp_buffer(
    template: &PacketHeaders,
    buffer: &mut [u8],
    flags: u8,
    sequence_number: u32,
    acknowledgement_number: u32,
    payload_len: usize,
) -> Result<usize, PacketError> {
    let tcp = template.tcp().ok_or(PacketError::WrongTransport("TCP"))?;
    let total = TCP_PAYLOAD_OFFSET + payload_len;
    let total_length = check_capacity(buffer, total)?;

    let mut ip = template.ip;
    ip.protocol = TransportProtocol::Tcp;
    ip.write(&mut buffer[..IPV4_HEADER_LEN], total_length);

    let segment = &mut buffer[IPV4_HEADER_LEN..total];
    tcp.write(segment, flags, sequence_number, acknowledgement_number);
    let checksum = tcp_checksum(segment, ip.source, ip.destination);
    segment[16..18].copy_from_slice(&checksum.to_be_bytes());

    Ok(total)
}

/// Stamp IPv4 + UDP headers from `template` around the `payload_len` bytes
/// already at `buffer[UDP_PAYLOAD_OFFSET..]`. The UDP checksum is zero.
///
/// Returns the total length of the resulting datagram.
///
/// # Errors
///
/// Returns `PacketError` if the template is not UDP or the buffer cannot
/// hold the datagram.
pub fn update_udp_buffer(
    template: &PacketHeaders,
    buffer: &mut [u8],
    payload_len: usize,
) -> Result<usize, PacketError> {
    let udp = template.udp().ok_or(PacketError::WrongTransport("UDP"))?;
    let total = UDP_PAYLOAD_OFFSET + payload_len;
    let total_length = check_capacity(buffer, total)?;

    let mut ip = template.ip;
    ip.protocol = TransportProtocol::Udp;
    ip.write(&mut buffer[..IPV4_HEADER_LEN], total_length);

    // total_length fits u16, so does the UDP length
    let udp_length = total_length - IPV4_HEADER_LEN as u16;
    udp.write(&mut buffer[IPV4_HEADER_LEN..], udp_length);

    Ok(total)
}

fn base_ip_header(source: Ipv4Addr, destination: Ipv4Addr, protocol: TransportProtocol) -> Ipv4Header {
    Ipv4Header {
        version: 4,
        ihl: 5,
        type_of_service: 0,
        total_length: 0,
        // DF set, id 0
        identification_and_flags: 0x0000_4000,
        ttl: DEFAULT_TTL,
        protocol,
        header_checksum: 0,
        source,
        destination,
    }
}

/// Build a complete IPv4/TCP datagram.
///
/// Used by tests and embedders that inject traffic into a device.
///
/// # Errors
///
/// Returns `PacketError::BufferTooSmall` if the datagram would exceed 64 KiB.
pub fn build_tcp_packet(
    source: SocketAddrV4,
    destination: SocketAddrV4,
    sequence_number: u32,
    acknowledgement_number: u32,
    flags: u8,
    payload: &[u8],
) -> Result<Vec<u8>, PacketError> {
    let template = PacketHeaders {
        ip: base_ip_header(*source.ip(), *destination.ip(), TransportProtocol::Tcp),
        transport: TransportHeader::Tcp(TcpHeader {
            source_port: source.port(),
            destination_port: destination.port(),
            sequence_number,
            acknowledgement_number,
            data_offset_and_reserved: 0x50,
            flags,
            window: u16::MAX,
            checksum: 0,
            urgent_pointer: 0,
            options_len: 0,
        }),
    };

    let mut packet = vec![0u8; TCP_PAYLOAD_OFFSET + payload.len()];
    packet[TCP_PAYLOAD_OFFSET..].copy_from_slice(payload);
    update_tcp_buffer(
        &template,
        &mut packet,
        flags,
        sequence_number,
        acknowledgement_number,
        payload.len(),
    )?;
    Ok(packet)
}

/// Build a complete IPv4/UDP datagram.
///
/// # Errors
///
/// Returns `PacketError::BufferTooSmall` if the datagram would exceed 64 KiB.
pub fn build_udp_packet(
    source: SocketAddrV4,
    destination: SocketAddrV4,
    payload: &[u8],
) -> Result<Vec<u8>, PacketError> {
    let template = PacketHeaders {
        ip: base_ip_header(*source.ip(), *destination.ip(), TransportProtocol::Udp),
        transport: TransportHeader::Udp(UdpHeader {
            source_port: source.port(),
            destination_port: destination.port(),
            length: 0,
            checksum: 0,
        }),
    };

    let mut packet = vec![0u8; UDP_PAYLOAD_OFFSET + payload.len()];
    packet[UDP_PAYLOAD_OFFSET..].copy_from_slice(payload);
    update_udp_buffer(&template, &mut packet, payload.len())?;
    Ok(packet)
}
