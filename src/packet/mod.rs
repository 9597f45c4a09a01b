//! Packet Codec
//!
//! Responsibilities:
//! - Parse raw IP packets read from the virtual interface
//! - Serialize (re-checksum) packets written back to it
//! - Build reply packets for flows terminated locally
//!
//! The codec is a pure transform: no IO, no shared state. Parsed packets
//! keep a reference-counted view of the original buffer, so the payload is
//! never copied while a packet is inspected and forwarded.

pub mod builder;
pub mod checksum;

pub use builder::PacketBuilder;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Bytes, BytesMut};

use crate::common::{FlowKey, IpProtocol};
use crate::error::{Error, Result};

const IPV4_MIN_HEADER: usize = 20;
const IPV6_HEADER: usize = 40;
const TCP_MIN_HEADER: usize = 20;
const UDP_HEADER: usize = 8;

/// IP version of a parsed packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

/// TCP control flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;

    pub fn contains(self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    pub fn is_syn(self) -> bool {
        self.contains(Self::SYN) && !self.contains(Self::ACK)
    }

    pub fn is_fin(self) -> bool {
        self.contains(Self::FIN)
    }

    pub fn is_rst(self) -> bool {
        self.contains(Self::RST)
    }
}

/// TCP header fields the router and the direct path care about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpInfo {
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
}

/// A validated IP packet with a parsed view of its headers.
///
/// Immutable once parsed. `data` holds exactly the bytes covered by the
/// declared total length; trailing link padding is dropped.
#[derive(Debug, Clone)]
pub struct ParsedPacket {
    data: Bytes,
    version: IpVersion,
    header_len: usize,
    protocol: IpProtocol,
    src: IpAddr,
    dst: IpAddr,
    src_port: u16,
    dst_port: u16,
    /// Length of the TCP/UDP header, 0 when not parsed
    transport_header_len: usize,
    /// Non-initial fragment, or first fragment of a fragmented datagram
    fragment: bool,
    tcp: Option<TcpInfo>,
}

impl ParsedPacket {
    pub fn version(&self) -> IpVersion {
        self.version
    }

    pub fn protocol(&self) -> IpProtocol {
        self.protocol
    }

    pub fn source(&self) -> SocketAddr {
        SocketAddr::new(self.src, self.src_port)
    }

    pub fn destination(&self) -> SocketAddr {
        SocketAddr::new(self.dst, self.dst_port)
    }

    pub fn tcp(&self) -> Option<TcpInfo> {
        self.tcp
    }

    pub fn is_fragment(&self) -> bool {
        self.fragment
    }

    /// Total packet length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The whole packet as received
    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }

    /// Offset of the transport payload from the start of the packet
    pub fn payload_offset(&self) -> usize {
        self.header_len + self.transport_header_len
    }

    /// Transport payload (zero-copy view)
    pub fn payload(&self) -> Bytes {
        self.data.slice(self.payload_offset()..)
    }

    /// Flow identity of this packet as sent by the device
    pub fn flow_key(&self) -> FlowKey {
        FlowKey::new(self.protocol, self.source(), self.destination())
    }

    /// Re-encode the packet, recomputing the IPv4 header checksum and the
    /// TCP/UDP checksum.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::from(&self.data[..]);
        self.fill_checksums(&mut buf);
        buf.freeze()
    }

    /// Rewrite source and destination endpoints (addresses and, for TCP/UDP,
    /// ports) and return the re-checksummed packet.
    ///
    /// Used for return traffic: whatever the upstream side addressed the
    /// packet to, it is delivered to the flow's client-facing tuple.
    pub fn readdress(&self, src: SocketAddr, dst: SocketAddr) -> Result<ParsedPacket> {
        let mut buf = BytesMut::from(&self.data[..]);
        match (self.version, src.ip(), dst.ip()) {
            (IpVersion::V4, IpAddr::V4(s), IpAddr::V4(d)) => {
                buf[12..16].copy_from_slice(&s.octets());
                buf[16..20].copy_from_slice(&d.octets());
            }
            (IpVersion::V6, IpAddr::V6(s), IpAddr::V6(d)) => {
                buf[8..24].copy_from_slice(&s.octets());
                buf[24..40].copy_from_slice(&d.octets());
            }
            _ => return Err(Error::MalformedPacket("address family mismatch")),
        }
        if self.transport_header_len > 0 {
            let t = self.header_len;
            buf[t..t + 2].copy_from_slice(&src.port().to_be_bytes());
            buf[t + 2..t + 4].copy_from_slice(&dst.port().to_be_bytes());
        }

        let mut packet = self.clone();
        packet.src = src.ip();
        packet.dst = dst.ip();
        if self.transport_header_len > 0 {
            packet.src_port = src.port();
            packet.dst_port = dst.port();
        }
        packet.fill_checksums(&mut buf);
        packet.data = buf.freeze();
        Ok(packet)
    }

    fn fill_checksums(&self, buf: &mut BytesMut) {
        if self.version == IpVersion::V4 {
            buf[10] = 0;
            buf[11] = 0;
            let sum = checksum::ipv4_header(&buf[..self.header_len]);
            buf[10..12].copy_from_slice(&sum.to_be_bytes());
        }

        // L4 checksums cover the reassembled datagram; leave fragments alone
        if self.fragment || self.transport_header_len == 0 {
            return;
        }

        let t = self.header_len;
        let offset = match self.protocol {
            IpProtocol::Tcp => t + 16,
            IpProtocol::Udp => t + 6,
            _ => return,
        };

        if self.protocol == IpProtocol::Udp
            && self.version == IpVersion::V4
            && buf[offset] == 0
            && buf[offset + 1] == 0
        {
            // IPv4 UDP checksum of zero means "not computed"
            return;
        }

        buf[offset] = 0;
        buf[offset + 1] = 0;
        let mut sum = checksum::transport(self.src, self.dst, self.protocol.number(), &buf[t..]);
        if sum == 0 && self.protocol == IpProtocol::Udp {
            sum = 0xFFFF;
        }
        buf[offset..offset + 2].copy_from_slice(&sum.to_be_bytes());
    }
}

/// Parse a raw IP packet.
///
/// Anything that fails validation is reported as `Error::MalformedPacket`;
/// the caller drops and counts it.
pub fn parse(data: Bytes) -> Result<ParsedPacket> {
    if data.is_empty() {
        return Err(Error::MalformedPacket("empty packet"));
    }
    match data[0] >> 4 {
        4 => parse_v4(data),
        6 => parse_v6(data),
        _ => Err(Error::MalformedPacket("unknown IP version")),
    }
}

/// Serialize a parsed packet for writing to the virtual interface
pub fn serialize(packet: &ParsedPacket) -> Bytes {
    packet.serialize()
}

fn parse_v4(data: Bytes) -> Result<ParsedPacket> {
    if data.len() < IPV4_MIN_HEADER {
        return Err(Error::MalformedPacket("IPv4 header too short"));
    }
    let header_len = ((data[0] & 0x0F) as usize) * 4;
    if header_len < IPV4_MIN_HEADER {
        return Err(Error::MalformedPacket("IPv4 IHL below minimum"));
    }
    let total_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    if total_len < header_len {
        return Err(Error::MalformedPacket("IPv4 total length below header length"));
    }
    if total_len > data.len() {
        return Err(Error::MalformedPacket("IPv4 total length exceeds buffer"));
    }

    let flags_frag = u16::from_be_bytes([data[6], data[7]]);
    let more_fragments = flags_frag & 0x2000 != 0;
    let frag_offset = flags_frag & 0x1FFF;
    let protocol = IpProtocol::from_number(data[9]);
    let src = IpAddr::V4(Ipv4Addr::new(data[12], data[13], data[14], data[15]));
    let dst = IpAddr::V4(Ipv4Addr::new(data[16], data[17], data[18], data[19]));

    let data = data.slice(..total_len);
    let mut packet = ParsedPacket {
        data,
        version: IpVersion::V4,
        header_len,
        protocol,
        src,
        dst,
        src_port: 0,
        dst_port: 0,
        transport_header_len: 0,
        fragment: more_fragments || frag_offset != 0,
        tcp: None,
    };

    // Only the first fragment carries the transport header
    if frag_offset == 0 {
        parse_transport(&mut packet)?;
    }
    Ok(packet)
}

fn parse_v6(data: Bytes) -> Result<ParsedPacket> {
    if data.len() < IPV6_HEADER {
        return Err(Error::MalformedPacket("IPv6 header too short"));
    }
    let payload_len = u16::from_be_bytes([data[4], data[5]]) as usize;
    let total_len = IPV6_HEADER + payload_len;
    if total_len > data.len() {
        return Err(Error::MalformedPacket("IPv6 payload length exceeds buffer"));
    }

    let protocol = IpProtocol::from_number(data[6]);
    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&data[8..24]);
    dst.copy_from_slice(&data[24..40]);

    let mut packet = ParsedPacket {
        data: data.slice(..total_len),
        version: IpVersion::V6,
        header_len: IPV6_HEADER,
        protocol,
        src: IpAddr::V6(Ipv6Addr::from(src)),
        dst: IpAddr::V6(Ipv6Addr::from(dst)),
        src_port: 0,
        dst_port: 0,
        transport_header_len: 0,
        // Fragment header (44) shows up as the next header
        fragment: data[6] == 44,
        tcp: None,
    };
    parse_transport(&mut packet)?;
    Ok(packet)
}

fn parse_transport(packet: &mut ParsedPacket) -> Result<()> {
    let segment = &packet.data[packet.header_len..];
    match packet.protocol {
        IpProtocol::Tcp => {
            if segment.len() < TCP_MIN_HEADER {
                return Err(Error::MalformedPacket("TCP header too short"));
            }
            let data_offset = ((segment[12] >> 4) as usize) * 4;
            if data_offset < TCP_MIN_HEADER || data_offset > segment.len() {
                return Err(Error::MalformedPacket("TCP data offset out of range"));
            }
            packet.src_port = u16::from_be_bytes([segment[0], segment[1]]);
            packet.dst_port = u16::from_be_bytes([segment[2], segment[3]]);
            packet.tcp = Some(TcpInfo {
                seq: u32::from_be_bytes([segment[4], segment[5], segment[6], segment[7]]),
                ack: u32::from_be_bytes([segment[8], segment[9], segment[10], segment[11]]),
                flags: TcpFlags(segment[13]),
                window: u16::from_be_bytes([segment[14], segment[15]]),
            });
            packet.transport_header_len = data_offset;
        }
        IpProtocol::Udp => {
            if segment.len() < UDP_HEADER {
                return Err(Error::MalformedPacket("UDP header too short"));
            }
            let udp_len = u16::from_be_bytes([segment[4], segment[5]]) as usize;
            // A fragmented datagram declares the reassembled length
            if udp_len < UDP_HEADER || (!packet.fragment && udp_len != segment.len()) {
                return Err(Error::MalformedPacket("UDP length inconsistent"));
            }
            packet.src_port = u16::from_be_bytes([segment[0], segment[1]]);
            packet.dst_port = u16::from_be_bytes([segment[2], segment[3]]);
            packet.transport_header_len = UDP_HEADER;
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn udp_packet() -> Bytes {
        PacketBuilder::udp(
            "10.0.0.2:40000".parse().unwrap(),
            "1.1.1.1:53".parse().unwrap(),
            b"hello dns",
        )
        .unwrap()
    }

    #[test]
    fn test_parse_udp() {
        let packet = parse(udp_packet()).unwrap();
        assert_eq!(packet.version(), IpVersion::V4);
        assert_eq!(packet.protocol(), IpProtocol::Udp);
        assert_eq!(packet.source(), "10.0.0.2:40000".parse().unwrap());
        assert_eq!(packet.destination(), "1.1.1.1:53".parse().unwrap());
        assert_eq!(&packet.payload()[..], b"hello dns");
        assert_eq!(packet.payload_offset(), 28);
    }

    #[test]
    fn test_round_trip_is_byte_exact() {
        let tcp = PacketBuilder::tcp(
            "10.0.0.2:51000".parse().unwrap(),
            "93.184.216.34:443".parse().unwrap(),
            1000,
            2000,
            TcpFlags(TcpFlags::ACK | TcpFlags::PSH),
            65535,
            b"GET / HTTP/1.1\r\n\r\n",
        )
        .unwrap();

        for raw in [udp_packet(), tcp] {
            let parsed = parse(raw.clone()).unwrap();
            assert_eq!(parsed.serialize(), raw);
        }
    }

    #[test]
    fn test_round_trip_preserves_zero_udp_checksum() {
        let mut raw = BytesMut::from(&udp_packet()[..]);
        raw[26] = 0;
        raw[27] = 0;
        let raw = raw.freeze();
        assert_eq!(parse(raw.clone()).unwrap().serialize(), raw);
    }

    #[test]
    fn test_trailing_padding_is_dropped() {
        let raw = udp_packet();
        let mut padded = BytesMut::from(&raw[..]);
        padded.extend_from_slice(&[0u8; 6]);
        let parsed = parse(padded.freeze()).unwrap();
        assert_eq!(parsed.len(), raw.len());
        assert_eq!(parsed.serialize(), raw);
    }

    #[test]
    fn test_malformed_packets() {
        // Too short
        assert!(matches!(
            parse(Bytes::from_static(&[0x45, 0, 0, 20])),
            Err(Error::MalformedPacket(_))
        ));

        // Bad version
        let mut raw = BytesMut::from(&udp_packet()[..]);
        raw[0] = 0x55;
        assert!(parse(raw.freeze()).is_err());

        // Declared length longer than the buffer
        let mut raw = BytesMut::from(&udp_packet()[..]);
        raw[2] = 0x05;
        assert!(parse(raw.freeze()).is_err());

        // IHL below 5
        let mut raw = BytesMut::from(&udp_packet()[..]);
        raw[0] = 0x44;
        assert!(parse(raw.freeze()).is_err());

        // Truncated TCP header
        let mut raw = BytesMut::from(&udp_packet()[..]);
        raw[9] = 6;
        assert!(parse(raw.freeze()).is_err());

        assert!(parse(Bytes::new()).is_err());
    }

    #[test]
    fn test_readdress_rewrites_tuple_and_checksums() {
        let packet = parse(udp_packet()).unwrap();
        let rewritten = packet
            .readdress(
                "1.1.1.1:53".parse().unwrap(),
                "10.0.0.2:40000".parse().unwrap(),
            )
            .unwrap();

        assert_eq!(rewritten.source(), "1.1.1.1:53".parse().unwrap());
        assert_eq!(rewritten.destination(), "10.0.0.2:40000".parse().unwrap());

        let expected = PacketBuilder::udp(
            "1.1.1.1:53".parse().unwrap(),
            "10.0.0.2:40000".parse().unwrap(),
            b"hello dns",
        )
        .unwrap();
        assert_eq!(rewritten.as_bytes(), &expected);

        // Re-parsing the rewritten bytes gives the same view
        let reparsed = parse(rewritten.as_bytes().clone()).unwrap();
        assert_eq!(reparsed.flow_key(), rewritten.flow_key());

        assert!(packet
            .readdress("[::1]:53".parse().unwrap(), "10.0.0.2:1".parse().unwrap())
            .is_err());
    }

    #[test]
    fn test_parse_ipv6_udp() {
        let raw = PacketBuilder::udp(
            "[fd00::2]:5353".parse().unwrap(),
            "[2001:4860:4860::8888]:53".parse().unwrap(),
            b"query",
        )
        .unwrap();
        let packet = parse(raw.clone()).unwrap();
        assert_eq!(packet.version(), IpVersion::V6);
        assert_eq!(packet.destination().port(), 53);
        assert_eq!(&packet.payload()[..], b"query");
        assert_eq!(packet.serialize(), raw);
    }

    #[test]
    fn test_icmp_has_no_ports() {
        let mut raw = BytesMut::from(&udp_packet()[..]);
        raw[9] = 1;
        let packet = parse(raw.freeze()).unwrap();
        assert_eq!(packet.protocol(), IpProtocol::Icmp);
        assert_eq!(packet.source().port(), 0);
        assert_eq!(packet.payload_offset(), 20);
    }
}
