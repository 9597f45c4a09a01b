//! Reply packet construction for flows terminated on the direct path

use std::net::{IpAddr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};

use crate::common::IpProtocol;
use crate::error::{Error, Result};

use super::{checksum, TcpFlags};

const DEFAULT_TTL: u8 = 64;

/// Builds IPv4/IPv6 UDP datagrams and TCP segments
pub struct PacketBuilder;

impl PacketBuilder {
    /// Build a UDP datagram from `src` to `dst`
    pub fn udp(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Result<Bytes> {
        let udp_len = 8 + payload.len();
        if udp_len > u16::MAX as usize {
            return Err(Error::MalformedPacket("UDP payload too large"));
        }

        let mut segment = BytesMut::with_capacity(udp_len);
        segment.put_u16(src.port());
        segment.put_u16(dst.port());
        segment.put_u16(udp_len as u16);
        segment.put_u16(0);
        segment.put_slice(payload);

        let mut sum = checksum::transport(src.ip(), dst.ip(), IpProtocol::Udp.number(), &segment);
        if sum == 0 {
            sum = 0xFFFF;
        }
        segment[6..8].copy_from_slice(&sum.to_be_bytes());

        Self::wrap(src.ip(), dst.ip(), IpProtocol::Udp, &segment)
    }

    /// Build a TCP segment from `src` to `dst` with a 20-byte header
    #[allow(clippy::too_many_arguments)]
    pub fn tcp(
        src: SocketAddr,
        dst: SocketAddr,
        seq: u32,
        ack: u32,
        flags: TcpFlags,
        window: u16,
        payload: &[u8],
    ) -> Result<Bytes> {
        let mut segment = BytesMut::with_capacity(20 + payload.len());
        segment.put_u16(src.port());
        segment.put_u16(dst.port());
        segment.put_u32(seq);
        segment.put_u32(ack);
        segment.put_u8(5 << 4);
        segment.put_u8(flags.0);
        segment.put_u16(window);
        segment.put_u16(0); // checksum
        segment.put_u16(0); // urgent pointer
        segment.put_slice(payload);

        let sum = checksum::transport(src.ip(), dst.ip(), IpProtocol::Tcp.number(), &segment);
        segment[16..18].copy_from_slice(&sum.to_be_bytes());

        Self::wrap(src.ip(), dst.ip(), IpProtocol::Tcp, &segment)
    }

    fn wrap(src: IpAddr, dst: IpAddr, protocol: IpProtocol, segment: &[u8]) -> Result<Bytes> {
        match (src, dst) {
            (IpAddr::V4(s), IpAddr::V4(d)) => {
                let total_len = 20 + segment.len();
                if total_len > u16::MAX as usize {
                    return Err(Error::MalformedPacket("IPv4 packet too large"));
                }
                let mut buf = BytesMut::with_capacity(total_len);
                buf.put_u8(0x45);
                buf.put_u8(0);
                buf.put_u16(total_len as u16);
                buf.put_u16(0); // identification
                buf.put_u16(0x4000); // don't fragment
                buf.put_u8(DEFAULT_TTL);
                buf.put_u8(protocol.number());
                buf.put_u16(0);
                buf.put_slice(&s.octets());
                buf.put_slice(&d.octets());
                let sum = checksum::ipv4_header(&buf[..20]);
                buf[10..12].copy_from_slice(&sum.to_be_bytes());
                buf.put_slice(segment);
                Ok(buf.freeze())
            }
            (IpAddr::V6(s), IpAddr::V6(d)) => {
                if segment.len() > u16::MAX as usize {
                    return Err(Error::MalformedPacket("IPv6 payload too large"));
                }
                let mut buf = BytesMut::with_capacity(40 + segment.len());
                buf.put_u32(0x6000_0000);
                buf.put_u16(segment.len() as u16);
                buf.put_u8(protocol.number());
                buf.put_u8(DEFAULT_TTL);
                buf.put_slice(&s.octets());
                buf.put_slice(&d.octets());
                buf.put_slice(segment);
                Ok(buf.freeze())
            }
            _ => Err(Error::MalformedPacket("address family mismatch")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::parse;

    #[test]
    fn test_tcp_segment_fields() {
        let raw = PacketBuilder::tcp(
            "93.184.216.34:443".parse().unwrap(),
            "10.0.0.2:51000".parse().unwrap(),
            7,
            1001,
            TcpFlags(TcpFlags::SYN | TcpFlags::ACK),
            65535,
            &[],
        )
        .unwrap();

        assert_eq!(raw.len(), 40);
        let packet = parse(raw).unwrap();
        let tcp = packet.tcp().unwrap();
        assert_eq!(tcp.seq, 7);
        assert_eq!(tcp.ack, 1001);
        assert!(tcp.flags.contains(TcpFlags::SYN));
        assert!(tcp.flags.contains(TcpFlags::ACK));
        assert!(!tcp.flags.is_syn());
        assert_eq!(tcp.window, 65535);
    }

    #[test]
    fn test_built_checksums_verify() {
        let raw = PacketBuilder::udp(
            "10.0.0.2:1234".parse().unwrap(),
            "192.0.2.1:9999".parse().unwrap(),
            b"odd",
        )
        .unwrap();
        // A correct checksum sums to zero when included
        assert_eq!(checksum::finish(checksum::sum_words(&raw[..20], 0)), 0);
        let packet = parse(raw.clone()).unwrap();
        assert_eq!(packet.serialize(), raw);
    }

    #[test]
    fn test_family_mismatch() {
        assert!(PacketBuilder::udp(
            "10.0.0.2:1".parse().unwrap(),
            "[::1]:1".parse().unwrap(),
            b""
        )
        .is_err());
    }
}
