//! Synthesis of response datagrams injected into the tunnel device

use std::net::SocketAddrV4;

use super::checksum::{internet_checksum, transport_checksum};
use super::{TcpFlags, IPPROTO_TCP, IPPROTO_UDP, IPV4_MIN_HEADER_LEN, TCP_MIN_HEADER_LEN, UDP_HEADER_LEN};

/// TTL stamped on synthesized datagrams
pub const DEFAULT_TTL: u8 = 64;

/// Largest payload a single IPv4 + TCP datagram can carry
pub const MAX_TCP_PAYLOAD: usize = u16::MAX as usize - IPV4_MIN_HEADER_LEN - TCP_MIN_HEADER_LEN;

/// Largest payload a single IPv4 + UDP datagram can carry
pub const MAX_UDP_PAYLOAD: usize = u16::MAX as usize - IPV4_MIN_HEADER_LEN - UDP_HEADER_LEN;

/// Header fields of a synthesized TCP segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpSegment {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
}

/// Compose a complete IPv4 + TCP datagram with both checksums filled in.
///
/// Payloads above [`MAX_TCP_PAYLOAD`] are the caller's problem; forwarders
/// read into buffers small enough to never hit it.
pub fn tcp_segment(seg: &TcpSegment, payload: &[u8]) -> Vec<u8> {
    let tcp_len = TCP_MIN_HEADER_LEN + payload.len();
    let total_len = IPV4_MIN_HEADER_LEN + tcp_len;
    let mut pkt = vec![0u8; total_len];

    write_ipv4_header(&mut pkt, seg.src, seg.dst, IPPROTO_TCP, total_len as u16);

    let tcp = &mut pkt[IPV4_MIN_HEADER_LEN..];
    tcp[0..2].copy_from_slice(&seg.src.port().to_be_bytes());
    tcp[2..4].copy_from_slice(&seg.dst.port().to_be_bytes());
    tcp[4..8].copy_from_slice(&seg.seq.to_be_bytes());
    tcp[8..12].copy_from_slice(&seg.ack.to_be_bytes());
    tcp[12] = ((TCP_MIN_HEADER_LEN / 4) as u8) << 4;
    tcp[13] = seg.flags.bits();
    tcp[14..16].copy_from_slice(&seg.window.to_be_bytes());
    // [16..18] checksum, [18..20] urgent pointer
    tcp[TCP_MIN_HEADER_LEN..].copy_from_slice(payload);

    let csum = transport_checksum(*seg.src.ip(), *seg.dst.ip(), IPPROTO_TCP, tcp);
    tcp[16..18].copy_from_slice(&csum.to_be_bytes());

    pkt
}

/// Compose a complete IPv4 + UDP datagram with both checksums filled in
pub fn udp_datagram(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let total_len = IPV4_MIN_HEADER_LEN + udp_len;
    let mut pkt = vec![0u8; total_len];

    write_ipv4_header(&mut pkt, src, dst, IPPROTO_UDP, total_len as u16);

    let udp = &mut pkt[IPV4_MIN_HEADER_LEN..];
    udp[0..2].copy_from_slice(&src.port().to_be_bytes());
    udp[2..4].copy_from_slice(&dst.port().to_be_bytes());
    udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    udp[UDP_HEADER_LEN..].copy_from_slice(payload);

    let mut csum = transport_checksum(*src.ip(), *dst.ip(), IPPROTO_UDP, udp);
    // Zero means "no checksum" for UDP
    if csum == 0 {
        csum = 0xffff;
    }
    udp[6..8].copy_from_slice(&csum.to_be_bytes());

    pkt
}

fn write_ipv4_header(pkt: &mut [u8], src: SocketAddrV4, dst: SocketAddrV4, protocol: u8, total_len: u16) {
    let ip = &mut pkt[..IPV4_MIN_HEADER_LEN];
    ip[0] = 0x45;
    ip[1] = 0;
    ip[2..4].copy_from_slice(&total_len.to_be_bytes());
    // id 0, don't fragment
    ip[6] = 0x40;
    ip[8] = DEFAULT_TTL;
    ip[9] = protocol;
    ip[12..16].copy_from_slice(&src.ip().octets());
    ip[16..20].copy_from_slice(&dst.ip().octets());

    let csum = internet_checksum(ip);
    ip[10..12].copy_from_slice(&csum.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    /// Straightforward word-by-word reference, kept separate from the
    /// accumulator used by the builders.
    fn reference_checksum(bytes: &[u8]) -> u16 {
        let mut padded = bytes.to_vec();
        if padded.len() % 2 == 1 {
            padded.push(0);
        }
        let mut sum: u64 = 0;
        let mut i = 0;
        while i < padded.len() {
            sum += ((padded[i] as u64) << 8) | padded[i + 1] as u64;
            i += 2;
        }
        while sum > 0xffff {
            sum = (sum >> 16) + (sum & 0xffff);
        }
        !(sum as u16)
    }

    fn reference_transport(pkt: &[u8], protocol: u8) -> u16 {
        let mut l4 = pkt[20..].to_vec();
        let csum_at = if protocol == IPPROTO_TCP { 16 } else { 6 };
        l4[csum_at] = 0;
        l4[csum_at + 1] = 0;

        let mut pseudo = Vec::new();
        pseudo.extend_from_slice(&pkt[12..20]);
        pseudo.push(0);
        pseudo.push(protocol);
        pseudo.extend_from_slice(&(l4.len() as u16).to_be_bytes());
        pseudo.extend_from_slice(&l4);
        match reference_checksum(&pseudo) {
            0 if protocol == IPPROTO_UDP => 0xffff,
            csum => csum,
        }
    }

    fn field(pkt: &[u8], at: usize) -> u16 {
        u16::from_be_bytes([pkt[at], pkt[at + 1]])
    }

    fn server() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 443)
    }

    fn client() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 5000)
    }

    #[test]
    fn test_tcp_segment_layout() {
        let payload = [0xabu8; 50];
        let pkt = tcp_segment(
            &TcpSegment {
                src: server(),
                dst: client(),
                seq: 1000,
                ack: 1100,
                flags: TcpFlags::PSH | TcpFlags::ACK,
                window: 65535,
            },
            &payload,
        );

        assert_eq!(pkt.len(), 90);
        assert_eq!(field(&pkt, 2), 90);
        assert_eq!(pkt[9], IPPROTO_TCP);
        assert_eq!(&pkt[12..16], &[93, 184, 216, 34]);
        assert_eq!(&pkt[16..20], &[10, 0, 0, 2]);
        assert_eq!(field(&pkt, 20), 443);
        assert_eq!(field(&pkt, 22), 5000);
        assert_eq!(u32::from_be_bytes([pkt[24], pkt[25], pkt[26], pkt[27]]), 1000);
        assert_eq!(u32::from_be_bytes([pkt[28], pkt[29], pkt[30], pkt[31]]), 1100);
        assert_eq!(pkt[33], 0x18);
        assert_eq!(&pkt[40..], &payload[..]);
    }

    #[test]
    fn test_tcp_checksums_match_reference() {
        for len in [0usize, 1, 50, 1399] {
            let payload: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
            let pkt = tcp_segment(
                &TcpSegment {
                    src: server(),
                    dst: client(),
                    seq: 0xdead_beef,
                    ack: 42,
                    flags: TcpFlags::PSH | TcpFlags::ACK,
                    window: 65535,
                },
                &payload,
            );

            let mut header = pkt[..20].to_vec();
            header[10] = 0;
            header[11] = 0;
            assert_eq!(field(&pkt, 10), reference_checksum(&header));
            assert_eq!(field(&pkt, 36), reference_transport(&pkt, IPPROTO_TCP));
        }
    }

    #[test]
    fn test_udp_checksums_match_reference() {
        let dns = SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53);
        for payload in [&b""[..], b"x", b"response-bytes"] {
            let pkt = udp_datagram(dns, client(), payload);

            assert_eq!(pkt.len(), 28 + payload.len());
            assert_eq!(field(&pkt, 24), (8 + payload.len()) as u16);

            let mut header = pkt[..20].to_vec();
            header[10] = 0;
            header[11] = 0;
            assert_eq!(field(&pkt, 10), reference_checksum(&header));
            assert_eq!(field(&pkt, 26), reference_transport(&pkt, IPPROTO_UDP));
        }
    }

    #[test]
    fn test_synthesized_header_verifies_to_zero() {
        let pkt = udp_datagram(server(), client(), b"abc");
        assert_eq!(internet_checksum(&pkt[..20]), 0);
    }
}
