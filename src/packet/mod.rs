//! Raw IPv4 packet handling
//!
//! Decoding of datagrams read from the tunnel device and synthesis of the
//! response datagrams written back to it.
//!
//! ```text
//! tun bytes ──► parse() ──► ParsedPacket { ip, transport, key, payload }
//!                                                    │
//! tun bytes ◄── build::tcp_segment / build::udp_datagram ◄── forwarders
//! ```

pub mod build;
pub mod checksum;
pub mod cursor;
mod parse;

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use parse::parse;

/// IP protocol number for ICMP
pub const IPPROTO_ICMP: u8 = 1;
/// IP protocol number for TCP
pub const IPPROTO_TCP: u8 = 6;
/// IP protocol number for UDP
pub const IPPROTO_UDP: u8 = 17;

/// Minimum IPv4 header length (IHL = 5)
pub const IPV4_MIN_HEADER_LEN: usize = 20;
/// Minimum TCP header length (data offset = 5)
pub const TCP_MIN_HEADER_LEN: usize = 20;
/// Fixed UDP header length
pub const UDP_HEADER_LEN: usize = 8;
/// Fixed ICMP header length
pub const ICMP_HEADER_LEN: usize = 8;

/// Reasons a buffer could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("truncated at offset {offset}: needed {needed} bytes, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("unsupported IP version {0}")]
    UnsupportedVersion(u8),

    #[error("invalid {layer} header length {header_len} ({available} bytes available)")]
    BadHeaderLength {
        layer: &'static str,
        header_len: usize,
        available: usize,
    },

    #[error("IPv4 total length {total_len} shorter than header length {header_len}")]
    BadTotalLength { total_len: usize, header_len: usize },
}

/// Immutable 5-tuple flow identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowKey {
    /// Source address
    pub src_ip: Ipv4Addr,
    /// Source port (0 for portless protocols)
    pub src_port: u16,
    /// Destination address
    pub dst_ip: Ipv4Addr,
    /// Destination port (0 for portless protocols)
    pub dst_port: u16,
    /// IP protocol number
    pub protocol: u8,
}

impl FlowKey {
    /// Create new flow key
    pub const fn new(
        src_ip: Ipv4Addr,
        src_port: u16,
        dst_ip: Ipv4Addr,
        dst_port: u16,
        protocol: u8,
    ) -> Self {
        Self {
            src_ip,
            src_port,
            dst_ip,
            dst_port,
            protocol,
        }
    }

    /// Key as seen from the remote side (server → client)
    pub fn reverse(&self) -> Self {
        Self::new(self.dst_ip, self.dst_port, self.src_ip, self.src_port, self.protocol)
    }

    /// Client endpoint
    pub fn source(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.src_ip, self.src_port)
    }

    /// Remote endpoint
    pub fn destination(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.dst_ip, self.dst_port)
    }

    /// Protocol class of this flow
    pub fn protocol_kind(&self) -> Protocol {
        Protocol::from(self.protocol)
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{} -> {}:{}",
            self.protocol_kind(),
            self.src_ip,
            self.src_port,
            self.dst_ip,
            self.dst_port
        )
    }
}

/// Protocol class used for per-protocol policy (timeouts, forwarders)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Other(u8),
}

impl From<u8> for Protocol {
    fn from(value: u8) -> Self {
        match value {
            IPPROTO_TCP => Self::Tcp,
            IPPROTO_UDP => Self::Udp,
            IPPROTO_ICMP => Self::Icmp,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("TCP"),
            Self::Udp => f.write_str("UDP"),
            Self::Icmp => f.write_str("ICMP"),
            Self::Other(n) => write!(f, "proto-{}", n),
        }
    }
}

/// TCP control flag set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TcpFlags(u8);

impl TcpFlags {
    pub const FIN: Self = Self(0x01);
    pub const SYN: Self = Self(0x02);
    pub const RST: Self = Self(0x04);
    pub const PSH: Self = Self(0x08);
    pub const ACK: Self = Self(0x10);
    pub const URG: Self = Self(0x20);

    const ALL: u8 = 0x3f;

    pub const fn empty() -> Self {
        Self(0)
    }

    /// Keep only the six classic control bits
    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & Self::ALL)
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn intersects(&self, other: Self) -> bool {
        (self.0 & other.0) != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Connection-opening segment (SYN without ACK)
    pub const fn is_bare_syn(&self) -> bool {
        self.contains(Self::SYN) && !self.contains(Self::ACK)
    }
}

impl BitOr for TcpFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for TcpFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(TcpFlags, &str); 6] = [
            (TcpFlags::FIN, "FIN"),
            (TcpFlags::SYN, "SYN"),
            (TcpFlags::RST, "RST"),
            (TcpFlags::PSH, "PSH"),
            (TcpFlags::ACK, "ACK"),
            (TcpFlags::URG, "URG"),
        ];
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("-")?;
        }
        Ok(())
    }
}

/// IPv4 header summary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub version: u8,
    /// Header length in bytes
    pub header_len: usize,
    pub total_len: u16,
    pub ttl: u8,
    pub protocol: u8,
    /// Fragment offset in 8-byte units
    pub fragment_offset: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    /// Header length in bytes (data offset * 4)
    pub header_len: usize,
    pub flags: TcpFlags,
    pub window: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    /// Length field (header + payload)
    pub length: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpHeader {
    pub icmp_type: u8,
    pub code: u8,
}

/// Transport layer of a parsed datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp(TcpHeader),
    Udp(UdpHeader),
    Icmp(IcmpHeader),
    /// Unrecognised protocol or non-initial fragment
    Unknown,
}

impl Transport {
    /// (source, destination) ports, when the protocol has them
    pub fn ports(&self) -> Option<(u16, u16)> {
        match self {
            Transport::Tcp(h) => Some((h.src_port, h.dst_port)),
            Transport::Udp(h) => Some((h.src_port, h.dst_port)),
            Transport::Icmp(_) | Transport::Unknown => None,
        }
    }
}

/// Result of parsing one raw datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPacket {
    pub ip: Ipv4Header,
    pub transport: Transport,
    pub key: FlowKey,
    /// Offset of the transport payload in the source buffer
    pub payload_offset: usize,
    /// Payload length, clamped to the IPv4 total length
    pub payload_len: usize,
}

impl ParsedPacket {
    /// Slice the transport payload out of the buffer this packet was parsed from
    pub fn payload<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        let end = self.payload_offset + self.payload_len;
        buf.get(self.payload_offset..end).unwrap_or(&[])
    }
}
