//! UDP header codec

use crate::error::PacketError;

/// Size of a UDP header
pub const UDP_HEADER_LEN: usize = 8;

/// Parsed UDP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    /// Source port
    pub source_port: u16,
    /// Destination port
    pub destination_port: u16,
    /// Header plus payload length
    pub length: u16,
    /// Checksum as read
    pub checksum: u16,
}

impl UdpHeader {
    /// Parse the UDP header at the start of `data`
    ///
    /// # Errors
    ///
    /// Returns `PacketError::Truncated` if `data` is shorter than 8 bytes.
    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < UDP_HEADER_LEN {
            return Err(PacketError::truncated(UDP_HEADER_LEN, data.len()));
        }
        Ok(Self {
            source_port: u16::from_be_bytes([data[0], data[1]]),
            destination_port: u16::from_be_bytes([data[2], data[3]]),
            length: u16::from_be_bytes([data[4], data[5]]),
            checksum: u16::from_be_bytes([data[6], data[7]]),
        })
    }

    /// Write the header for a datagram of `length` bytes with the checksum
    /// disabled (zero).
    pub fn write(&self, out: &mut [u8], length: u16) {
        let out = &mut out[..UDP_HEADER_LEN];
        out[0..2].copy_from_slice(&self.source_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.destination_port.to_be_bytes());
        out[4..6].copy_from_slice(&length.to_be_bytes());
        out[6..8].fill(0);
    }
}
