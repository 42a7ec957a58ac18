//! Internet checksum helpers
//!
//! 16-bit ones'-complement sums as used by the IPv4 header and TCP.

use std::net::Ipv4Addr;

use super::IPPROTO_TCP;

/// Offset of the checksum field inside an IPv4 header
const IPV4_CHECKSUM_OFFSET: usize = 10;

/// Offset of the checksum field inside a TCP header
const TCP_CHECKSUM_OFFSET: usize = 16;

/// Add the big-endian 16-bit words of `data` to `sum`, skipping the word at
/// `skip` if given. An odd trailing byte is summed as the high byte.
fn sum_words(data: &[u8], mut sum: u32, skip: Option<usize>) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for (i, word) in chunks.by_ref().enumerate() {
        if skip == Some(i * 2) {
            continue;
        }
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([word[0], word[1]])));
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([*last, 0])));
    }
    sum
}

/// Fold carries back into the low 16 bits
#[allow(clippy::cast_possible_truncation)] // folded sum fits in 16 bits
fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// Complemented ones'-complement sum over every word of `data`.
///
/// Over a header that already carries a valid checksum the result is zero.
#[must_use]
pub fn internet_checksum(data: &[u8]) -> u16 {
    !fold(sum_words(data, 0, None))
}

/// Calculate an IPv4 header checksum.
///
/// The checksum field (bytes 10-11) is treated as zero regardless of its
/// current contents.
#[must_use]
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    !fold(sum_words(header, 0, Some(IPV4_CHECKSUM_OFFSET)))
}

/// Verify an IPv4 header checksum
#[must_use]
pub fn verify_ipv4_checksum(header: &[u8]) -> bool {
    internet_checksum(header) == 0
}

/// Calculate the TCP checksum of `segment` (header plus payload) including
/// the IPv4 pseudo-header. The checksum field is treated as zero.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // segment length is bounded by the 16-bit total length
pub fn tcp_checksum(segment: &[u8], source: Ipv4Addr, destination: Ipv4Addr) -> u16 {
    let mut sum = sum_words(&source.octets(), 0, None);
    sum = sum_words(&destination.octets(), sum, None);
    sum = sum.wrapping_add(u32::from(IPPROTO_TCP));
    sum = sum.wrapping_add(segment.len() as u32 & 0xFFFF);
    !fold(sum_words(segment, sum, Some(TCP_CHECKSUM_OFFSET)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: [u8; 20] = [
        0x45, 0x00, 0x00, 0x3C, 0x1C, 0x46, 0x40, 0x00, 0x40, 0x06, 0x00, 0x00, 0xAC, 0x10, 0x0A,
        0x63, 0xAC, 0x10, 0x0A, 0x0C,
    ];

    #[test]
    fn test_ipv4_checksum_known_vector() {
        assert_eq!(ipv4_header_checksum(&HEADER), 0xB1E6);
    }

    #[test]
    fn test_ipv4_checksum_roundtrip_folds_to_zero() {
        let mut header = HEADER;
        let checksum = ipv4_header_checksum(&header);
        header[10..12].copy_from_slice(&checksum.to_be_bytes());
        assert_eq!(internet_checksum(&header), 0);
        assert!(verify_ipv4_checksum(&header));

        // The stored field is ignored on recompute
        assert_eq!(ipv4_header_checksum(&header), checksum);
    }

    #[test]
    fn test_ipv4_checksum_detects_corruption() {
        let mut header = HEADER;
        let checksum = ipv4_header_checksum(&header);
        header[10..12].copy_from_slice(&checksum.to_be_bytes());
        header[8] = 0x3F;
        assert!(!verify_ipv4_checksum(&header));
    }

    #[test]
    fn test_odd_length_high_byte_aligned() {
        // 0xAB00 alone, complemented
        assert_eq!(internet_checksum(&[0xAB]), !0xAB00);
        assert_eq!(internet_checksum(&[0x12, 0x34, 0xAB]), !(0x1234u16 + 0xAB00));
    }

    #[test]
    fn test_tcp_checksum_verifies() {
        let src = Ipv4Addr::new(10, 0, 0, 2);
        let dst = Ipv4Addr::new(93, 184, 216, 34);

        // 20-byte header plus a 3-byte payload
        let mut segment = vec![0u8; 23];
        segment[0..2].copy_from_slice(&40000u16.to_be_bytes());
        segment[2..4].copy_from_slice(&80u16.to_be_bytes());
        segment[4..8].copy_from_slice(&1000u32.to_be_bytes());
        segment[12] = 0x50;
        segment[13] = 0x18;
        segment[14..16].copy_from_slice(&65535u16.to_be_bytes());
        segment[20..23].copy_from_slice(b"abc");

        let checksum = tcp_checksum(&segment, src, dst);
        segment[16..18].copy_from_slice(&checksum.to_be_bytes());

        // Summing pseudo-header and segment with the checksum in place gives 0xFFFF
        let mut pseudo = Vec::new();
        pseudo.extend_from_slice(&src.octets());
        pseudo.extend_from_slice(&dst.octets());
        pseudo.extend_from_slice(&[0, IPPROTO_TCP]);
        pseudo.extend_from_slice(&23u16.to_be_bytes());
        pseudo.extend_from_slice(&segment);
        pseudo.push(0);
        assert_eq!(internet_checksum(&pseudo), 0);
    }
}
