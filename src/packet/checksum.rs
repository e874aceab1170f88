//! RFC 1071 internet checksum

use std::net::Ipv4Addr;

/// Add `data` to a running 32-bit ones'-complement accumulator.
/// An odd trailing byte is padded with zero.
#[inline]
pub fn accumulate(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([pair[0], pair[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    sum
}

/// Fold carries and complement
#[inline]
pub fn finish(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Checksum over a single buffer (IPv4 header, ICMP message)
#[inline]
pub fn internet_checksum(data: &[u8]) -> u16 {
    finish(accumulate(0, data))
}

/// Sum of the TCP/UDP pseudo-header (addresses, zero, protocol, length)
#[inline]
pub fn pseudo_header_sum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, length: u16) -> u32 {
    let mut sum = accumulate(0, &src.octets());
    sum = accumulate(sum, &dst.octets());
    sum = sum.wrapping_add(protocol as u32);
    sum.wrapping_add(length as u32)
}

/// Checksum of a transport segment (header with zeroed checksum field, plus
/// payload) prefixed by its pseudo-header
pub fn transport_checksum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    let sum = pseudo_header_sum(src, dst, protocol, segment.len() as u16);
    finish(accumulate(sum, segment))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_ipv4_header() {
        // 192.168.0.1 -> 192.168.0.199, UDP, total length 0x73
        let mut header = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8,
            0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];
        assert_eq!(internet_checksum(&header), 0xb861);

        header[10..12].copy_from_slice(&0xb861u16.to_be_bytes());
        assert_eq!(internet_checksum(&header), 0);
    }

    #[test]
    fn test_odd_length_padding() {
        assert_eq!(internet_checksum(&[0x01]), !0x0100);
        assert_eq!(internet_checksum(&[0x01, 0x00]), internet_checksum(&[0x01]));
    }

    #[test]
    fn test_carry_folding() {
        let data = [0xff; 64];
        // 32 words of 0xffff fold to 0xffff; complement is zero
        assert_eq!(internet_checksum(&data), 0);
    }
}
