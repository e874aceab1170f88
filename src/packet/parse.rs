//! Stateless IPv4 / TCP / UDP / ICMP decoder

use std::net::Ipv4Addr;

use super::cursor::Cursor;
use super::{
    FlowKey, IcmpHeader, Ipv4Header, ParseError, ParsedPacket, TcpFlags, TcpHeader, Transport,
    UdpHeader, ICMP_HEADER_LEN, IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP, IPV4_MIN_HEADER_LEN,
    TCP_MIN_HEADER_LEN, UDP_HEADER_LEN,
};

/// Decode the first `len` bytes of `buf` as an IPv4 datagram.
///
/// Never panics on malformed input; every short or inconsistent header is
/// reported as a [`ParseError`]. `len` larger than the buffer is clamped.
pub fn parse(buf: &[u8], len: usize) -> Result<ParsedPacket, ParseError> {
    let data = &buf[..len.min(buf.len())];
    let mut cur = Cursor::new(data);

    let ver_ihl = cur.read_u8()?;
    let version = ver_ihl >> 4;
    if version != 4 {
        return Err(ParseError::UnsupportedVersion(version));
    }

    let header_len = ((ver_ihl & 0x0f) as usize) * 4;
    if header_len < IPV4_MIN_HEADER_LEN || header_len > data.len() {
        return Err(ParseError::BadHeaderLength {
            layer: "IPv4",
            header_len,
            available: data.len(),
        });
    }

    let _tos = cur.read_u8()?;
    let total_len = cur.read_u16()?;
    let _id = cur.read_u16()?;
    let frag = cur.read_u16()?;
    let ttl = cur.read_u8()?;
    let protocol = cur.read_u8()?;
    let _checksum = cur.read_u16()?;
    let src = Ipv4Addr::from(cur.read_array::<4>()?);
    let dst = Ipv4Addr::from(cur.read_array::<4>()?);
    cur.skip(header_len - IPV4_MIN_HEADER_LEN)?;

    if (total_len as usize) < header_len {
        return Err(ParseError::BadTotalLength {
            total_len: total_len as usize,
            header_len,
        });
    }

    let ip = Ipv4Header {
        version,
        header_len,
        total_len,
        ttl,
        protocol,
        fragment_offset: frag & 0x1fff,
        src,
        dst,
    };

    // Datagram end: the declared total length, unless the buffer is shorter
    let end = (total_len as usize).min(data.len());
    let mut l4 = cur.sub(end - header_len)?;

    let (transport, l4_header_len) = if ip.fragment_offset != 0 {
        // Non-initial fragments carry no transport header
        (Transport::Unknown, 0)
    } else {
        match protocol {
            IPPROTO_TCP => parse_tcp(&mut l4)?,
            IPPROTO_UDP => parse_udp(&mut l4)?,
            IPPROTO_ICMP => parse_icmp(&mut l4)?,
            _ => (Transport::Unknown, 0),
        }
    };

    let payload_offset = header_len + l4_header_len;
    let mut payload_len = end - payload_offset;
    if let Transport::Udp(udp) = transport {
        let declared = (udp.length as usize).saturating_sub(UDP_HEADER_LEN);
        payload_len = payload_len.min(declared);
    }

    let (src_port, dst_port) = transport.ports().unwrap_or((0, 0));
    let key = FlowKey::new(src, src_port, dst, dst_port, protocol);

    Ok(ParsedPacket {
        ip,
        transport,
        key,
        payload_offset,
        payload_len,
    })
}

fn parse_tcp(cur: &mut Cursor<'_>) -> Result<(Transport, usize), ParseError> {
    cur.require(TCP_MIN_HEADER_LEN)?;

    let src_port = cur.read_u16()?;
    let dst_port = cur.read_u16()?;
    let seq = cur.read_u32()?;
    let ack = cur.read_u32()?;
    let offset_byte = cur.read_u8()?;
    let flags = TcpFlags::from_bits_truncate(cur.read_u8()?);
    let window = cur.read_u16()?;
    let _checksum = cur.read_u16()?;
    let _urgent = cur.read_u16()?;

    let header_len = ((offset_byte >> 4) as usize) * 4;
    if header_len < TCP_MIN_HEADER_LEN {
        return Err(ParseError::BadHeaderLength {
            layer: "TCP",
            header_len,
            available: cur.position() + cur.remaining(),
        });
    }
    // Options
    cur.skip(header_len - TCP_MIN_HEADER_LEN)?;

    let header = TcpHeader {
        src_port,
        dst_port,
        seq,
        ack,
        header_len,
        flags,
        window,
    };
    Ok((Transport::Tcp(header), header_len))
}

fn parse_udp(cur: &mut Cursor<'_>) -> Result<(Transport, usize), ParseError> {
    cur.require(UDP_HEADER_LEN)?;

    let header = UdpHeader {
        src_port: cur.read_u16()?,
        dst_port: cur.read_u16()?,
        length: cur.read_u16()?,
    };
    let _checksum = cur.read_u16()?;
    Ok((Transport::Udp(header), UDP_HEADER_LEN))
}

fn parse_icmp(cur: &mut Cursor<'_>) -> Result<(Transport, usize), ParseError> {
    cur.require(ICMP_HEADER_LEN)?;

    let icmp_type = cur.read_u8()?;
    let code = cur.read_u8()?;
    // checksum + rest-of-header
    cur.skip(6)?;
    Ok((Transport::Icmp(IcmpHeader { icmp_type, code }), ICMP_HEADER_LEN))
}
