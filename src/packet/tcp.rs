//! TCP header codec

use crate::error::PacketError;

/// Size of a TCP header without options
pub const TCP_HEADER_LEN: usize = 20;

/// TCP flag bits
pub mod tcp_flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
}

/// Parsed TCP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    /// Source port
    pub source_port: u16,
    /// Destination port
    pub destination_port: u16,
    /// Sequence number
    pub sequence_number: u32,
    /// Acknowledgement number
    pub acknowledgement_number: u32,
    /// Data offset (high nibble) and reserved bits
    pub data_offset_and_reserved: u8,
    /// Flag bits, see [`tcp_flags`]
    pub flags: u8,
    /// Advertised window
    pub window: u16,
    /// Checksum as read
    pub checksum: u16,
    /// Urgent pointer
    pub urgent_pointer: u16,
    /// Length of the options carried after the fixed header
    pub options_len: usize,
}

impl TcpHeader {
    /// Parse the TCP header at the start of `data`
    ///
    /// # Errors
    ///
    /// Returns `PacketError` if `data` is shorter than the header or the
    /// data offset is below 5 words.
    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < TCP_HEADER_LEN {
            return Err(PacketError::truncated(TCP_HEADER_LEN, data.len()));
        }

        let data_offset_and_reserved = data[12];
        let header_len = usize::from(data_offset_and_reserved >> 4) * 4;
        if header_len < TCP_HEADER_LEN {
            return Err(PacketError::InvalidDataOffset(header_len));
        }
        if data.len() < header_len {
            return Err(PacketError::truncated(header_len, data.len()));
        }

        Ok(Self {
            source_port: u16::from_be_bytes([data[0], data[1]]),
            destination_port: u16::from_be_bytes([data[2], data[3]]),
            sequence_number: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            acknowledgement_number: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            data_offset_and_reserved,
            flags: data[13],
            window: u16::from_be_bytes([data[14], data[15]]),
            checksum: u16::from_be_bytes([data[16], data[17]]),
            urgent_pointer: u16::from_be_bytes([data[18], data[19]]),
            options_len: header_len - TCP_HEADER_LEN,
        })
    }

    /// Header length in bytes, including options
    #[must_use]
    pub const fn header_len(&self) -> usize {
        TCP_HEADER_LEN + self.options_len
    }

    /// Write a 20-byte option-less header with the given sequence state.
    /// The checksum field is left zero.
    ///
    /// `out` must hold at least [`TCP_HEADER_LEN`] bytes.
    pub fn write(&self, out: &mut [u8], flags: u8, sequence_number: u32, acknowledgement_number: u32) {
        let out = &mut out[..TCP_HEADER_LEN];
        out[0..2].copy_from_slice(&self.source_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.destination_port.to_be_bytes());
        out[4..8].copy_from_slice(&sequence_number.to_be_bytes());
        out[8..12].copy_from_slice(&acknowledgement_number.to_be_bytes());
        out[12] = 0x50;
        out[13] = flags;
        out[14..16].copy_from_slice(&self.window.to_be_bytes());
        out[16..18].fill(0);
        out[18..20].copy_from_slice(&self.urgent_pointer.to_be_bytes());
    }

    /// Check if SYN flag is set
    #[must_use]
    pub const fn is_syn(&self) -> bool {
        self.flags & tcp_flags::SYN != 0
    }

    /// Check if ACK flag is set
    #[must_use]
    pub const fn is_ack(&self) -> bool {
        self.flags & tcp_flags::ACK != 0
    }

    /// Check if FIN flag is set
    #[must_use]
    pub const fn is_fin(&self) -> bool {
        self.flags & tcp_flags::FIN != 0
    }

    /// Check if RST flag is set
    #[must_use]
    pub const fn is_rst(&self) -> bool {
        self.flags & tcp_flags::RST != 0
    }

    /// Check if PSH flag is set
    #[must_use]
    pub const fn is_psh(&self) -> bool {
        self.flags & tcp_flags::PSH != 0
    }

    /// Get a human-readable description of the flags
    #[must_use]
    pub fn flags_string(&self) -> String {
        flags_string(self.flags)
    }
}

/// Render flag bits as `SYN,ACK`
#[must_use]
pub fn flags_string(flags: u8) -> String {
    let names = [
        (tcp_flags::SYN, "SYN"),
        (tcp_flags::ACK, "ACK"),
        (tcp_flags::FIN, "FIN"),
        (tcp_flags::RST, "RST"),
        (tcp_flags::PSH, "PSH"),
        (tcp_flags::URG, "URG"),
    ];
    let set: Vec<&str> = names
        .iter()
        .filter(|(bit, _)| flags & bit != 0)
        .map(|(_, name)| *name)
        .collect();
    if set.is_empty() {
        "none".to_string()
    } else {
        set.join(",")
    }
}
