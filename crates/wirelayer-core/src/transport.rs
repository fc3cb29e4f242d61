use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use etherparse::{NetHeaders, PacketHeaders, TransportHeader};

use crate::error::TransportDecodeError;
use crate::models::{LinkType, Packet, TcpFlags, TransportId, TransportProtocol, TransportRecord};

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88A8;

/// Decode the network and transport headers of one packet.
///
/// Pure: the same bytes always produce the same record. Unknown L4
/// protocols yield a record with `TransportProtocol::Other` and no payload
/// interpretation; only unparseable or non-IP frames are errors.
pub fn decode_packet(packet: &Packet, link: LinkType) -> Result<TransportRecord, TransportDecodeError> {
    let frame = packet.data.as_slice();
    let ip = strip_link_layer(frame, link)?;

    let headers = PacketHeaders::from_ip_slice(ip).map_err(|_| TransportDecodeError::MalformedHeader)?;

    let (ip_version, src_ip, dst_ip, ttl, ip_number, mut checksum_valid) = match headers.net {
        Some(NetHeaders::Ipv4(ref h, _)) => (
            4u8,
            IpAddr::V4(Ipv4Addr::from(h.source)),
            IpAddr::V4(Ipv4Addr::from(h.destination)),
            h.time_to_live,
            h.protocol.0,
            Some(h.calc_header_checksum() == h.header_checksum),
        ),
        Some(NetHeaders::Ipv6(ref h, _)) => (
            6u8,
            IpAddr::V6(Ipv6Addr::from(h.source)),
            IpAddr::V6(Ipv6Addr::from(h.destination)),
            h.hop_limit,
            h.next_header.0,
            None,
        ),
        #[allow(unreachable_patterns)]
        _ => return Err(TransportDecodeError::UnsupportedProtocol),
    };

    let payload = headers.payload.slice();
    let payload_offset = (payload.as_ptr() as usize)
        .checked_sub(frame.as_ptr() as usize)
        .filter(|off| *off <= frame.len())
        .ok_or(TransportDecodeError::MalformedHeader)?;

    let mut record = TransportRecord {
        id: TransportId(packet.id),
        packet: packet.id,
        timestamp: packet.timestamp,
        protocol: TransportProtocol::Other(ip_number),
        ip_version: Some(ip_version),
        src_ip: Some(src_ip),
        dst_ip: Some(dst_ip),
        src_port: 0,
        dst_port: 0,
        ttl: Some(ttl),
        tcp_flags: None,
        tcp_seq: None,
        tcp_ack: None,
        tcp_window: None,
        payload_offset,
        payload_size: payload.len() as u32,
        checksum_valid: None,
        decode_error: None,
    };

    match headers.transport {
        Some(TransportHeader::Tcp(ref tcp)) => {
            record.protocol = TransportProtocol::Tcp;
            record.src_port = tcp.source_port;
            record.dst_port = tcp.destination_port;
            record.tcp_flags = Some(TcpFlags {
                fin: tcp.fin,
                syn: tcp.syn,
                rst: tcp.rst,
                psh: tcp.psh,
                ack: tcp.ack,
                urg: tcp.urg,
                ece: tcp.ece,
                cwr: tcp.cwr,
            });
            record.tcp_seq = Some(tcp.sequence_number);
            record.tcp_ack = Some(tcp.acknowledgment_number);
            record.tcp_window = Some(tcp.window_size);

            let l4_ok = match headers.net {
                Some(NetHeaders::Ipv4(ref h, _)) => tcp.calc_checksum_ipv4(h, payload).ok(),
                Some(NetHeaders::Ipv6(ref h, _)) => tcp.calc_checksum_ipv6(h, payload).ok(),
                #[allow(unreachable_patterns)]
                _ => None,
            }
            .map(|sum| sum == tcp.checksum);
            checksum_valid = merge_checksums(checksum_valid, l4_ok);
        }
        Some(TransportHeader::Udp(ref udp)) => {
            record.protocol = TransportProtocol::Udp;
            record.src_port = udp.source_port;
            record.dst_port = udp.destination_port;

            // A zero UDP checksum over IPv4 means "not computed".
            let l4_ok = match headers.net {
                Some(NetHeaders::Ipv4(ref h, _)) if udp.checksum != 0 => {
                    udp.calc_checksum_ipv4(h, payload).ok()
                }
                Some(NetHeaders::Ipv6(ref h, _)) => udp.calc_checksum_ipv6(h, payload).ok(),
                _ => None,
            }
            .map(|sum| sum == udp.checksum);
            checksum_valid = merge_checksums(checksum_valid, l4_ok);
        }
        Some(TransportHeader::Icmpv4(_)) | Some(TransportHeader::Icmpv6(_)) => {
            record.protocol = TransportProtocol::Icmp;
        }
        None => {}
    }

    record.checksum_valid = checksum_valid;

    if checksum_valid == Some(false) {
        tracing::debug!(packet = %packet.id, "checksum mismatch (advisory)");
    }

    Ok(record)
}

/// Like [`decode_packet`], but a decode failure is downgraded into a
/// best-effort record carrying the error tag so later stages still have a
/// join target.
pub fn decode_or_degrade(packet: &Packet, link: LinkType) -> TransportRecord {
    match decode_packet(packet, link) {
        Ok(record) => record,
        Err(err) => {
            tracing::debug!(packet = %packet.id, error = %err, "transport decode failed");
            TransportRecord {
                id: TransportId(packet.id),
                packet: packet.id,
                timestamp: packet.timestamp,
                protocol: TransportProtocol::Other(0),
                ip_version: None,
                src_ip: None,
                dst_ip: None,
                src_port: 0,
                dst_port: 0,
                ttl: None,
                tcp_flags: None,
                tcp_seq: None,
                tcp_ack: None,
                tcp_window: None,
                payload_offset: 0,
                payload_size: 0,
                checksum_valid: None,
                decode_error: Some(err),
            }
        }
    }
}

fn merge_checksums(ip: Option<bool>, l4: Option<bool>) -> Option<bool> {
    match (ip, l4) {
        (Some(a), Some(b)) => Some(a && b),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Return the IP datagram inside a link-layer frame.
fn strip_link_layer(data: &[u8], link: LinkType) -> Result<&[u8], TransportDecodeError> {
    match link {
        LinkType::RawIp => Ok(data),
        LinkType::Null => data.get(4..).ok_or(TransportDecodeError::MalformedHeader),
        LinkType::LinuxSll => {
            if data.len() < 16 {
                return Err(TransportDecodeError::MalformedHeader);
            }
            let ethertype = u16::from_be_bytes([data[14], data[15]]);
            ip_after_ethertype(data, ethertype, 16)
        }
        LinkType::Ethernet => {
            if data.len() < 14 {
                return Err(TransportDecodeError::MalformedHeader);
            }
            let mut ethertype = u16::from_be_bytes([data[12], data[13]]);
            let mut offset = 14usize;

            // 802.1Q / QinQ tags, at most two deep
            for _ in 0..2 {
                if ethertype != ETHERTYPE_VLAN && ethertype != ETHERTYPE_QINQ {
                    break;
                }
                if data.len() < offset + 4 {
                    return Err(TransportDecodeError::MalformedHeader);
                }
                ethertype = u16::from_be_bytes([data[offset + 2], data[offset + 3]]);
                offset += 4;
            }

            ip_after_ethertype(data, ethertype, offset)
        }
    }
}

fn ip_after_ethertype(data: &[u8], ethertype: u16, offset: usize) -> Result<&[u8], TransportDecodeError> {
    match ethertype {
        ETHERTYPE_IPV4 | ETHERTYPE_IPV6 => Ok(&data[offset..]),
        _ => Err(TransportDecodeError::UnsupportedProtocol),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, packet};

    #[test]
    fn test_decode_tcp_syn() {
        let frame = testutil::tcp_frame(
            [192, 168, 1, 100], 54321,
            [93, 184, 216, 34], 80,
            testutil::Tcp::syn(1000),
            &[],
        );
        let record = decode_packet(&packet(1, &frame), LinkType::Ethernet).unwrap();
        assert_eq!(record.protocol, TransportProtocol::Tcp);
        assert_eq!(record.src_port, 54321);
        assert_eq!(record.dst_port, 80);
        assert_eq!(record.src_ip, Some("192.168.1.100".parse().unwrap()));
        assert!(record.tcp_flags.unwrap().is_syn_only());
        assert_eq!(record.tcp_seq, Some(1000));
        assert_eq!(record.payload_size, 0);
        assert_eq!(record.checksum_valid, Some(true));
        assert_eq!(record.ip_version, Some(4));
    }

    #[test]
    fn test_payload_offset_points_into_frame() {
        let body = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        let frame = testutil::tcp_frame(
            [10, 0, 0, 1], 40000,
            [10, 0, 0, 2], 80,
            testutil::Tcp::psh_ack(1, 1),
            body,
        );
        let pkt = packet(7, &frame);
        let record = decode_packet(&pkt, LinkType::Ethernet).unwrap();
        assert_eq!(record.payload(&pkt), body);
        // 14 ethernet + 20 ipv4 + 20 tcp
        assert_eq!(record.payload_offset, 54);
    }

    #[test]
    fn test_decode_udp_ipv6() {
        let frame = testutil::udp6_frame(
            [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1], 5353,
            [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2], 53,
            b"hello",
        );
        let record = decode_packet(&packet(2, &frame), LinkType::Ethernet).unwrap();
        assert_eq!(record.protocol, TransportProtocol::Udp);
        assert_eq!(record.ip_version, Some(6));
        assert_eq!(record.dst_port, 53);
        assert_eq!(record.payload_size, 5);
    }

    #[test]
    fn test_unknown_l4_is_other() {
        // IPv4 header carrying protocol 47 (GRE) and four payload bytes
        let mut ip = vec![
            0x45, 0x00, 0x00, 0x18, 0x00, 0x01, 0x00, 0x00, 0x40, 47, 0x00, 0x00,
            10, 0, 0, 1, 10, 0, 0, 2,
        ];
        ip.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        let record = decode_packet(&packet(3, &ip), LinkType::RawIp).unwrap();
        assert_eq!(record.protocol, TransportProtocol::Other(47));
        assert_eq!(record.protocol.to_string(), "OTHER");
        assert!(record.decode_error.is_none());
    }

    #[test]
    fn test_non_ip_ethertype_is_unsupported() {
        let mut frame = vec![0u8; 12];
        frame.extend_from_slice(&[0x08, 0x06]); // ARP
        frame.extend_from_slice(&[0u8; 28]);
        assert_eq!(
            decode_packet(&packet(4, &frame), LinkType::Ethernet),
            Err(TransportDecodeError::UnsupportedProtocol)
        );
    }

    #[test]
    fn test_truncated_frame_degrades() {
        let record = decode_or_degrade(&packet(5, &[0x00, 0x01, 0x02]), LinkType::Ethernet);
        assert_eq!(record.decode_error, Some(TransportDecodeError::MalformedHeader));
        assert_eq!(record.protocol.label(), "OTHER");
        assert!(record.src_ip.is_none());
    }

    #[test]
    fn test_vlan_tag_is_skipped() {
        let plain = testutil::tcp_frame(
            [10, 0, 0, 1], 1234, [10, 0, 0, 2], 22, testutil::Tcp::syn(5), &[],
        );
        let mut tagged = plain[..12].to_vec();
        tagged.extend_from_slice(&[0x81, 0x00, 0x00, 0x0a]);
        tagged.extend_from_slice(&plain[12..]);
        let record = decode_packet(&packet(6, &tagged), LinkType::Ethernet).unwrap();
        assert_eq!(record.dst_port, 22);
        assert_eq!(record.payload_offset, 58);
    }

    /// IPv4 datagram of a TCP SYN, without the Ethernet header.
    fn ipv4_syn() -> Vec<u8> {
        let frame = testutil::tcp_frame(
            [172, 16, 0, 5], 40001, [172, 16, 0, 9], 443, testutil::Tcp::syn(77), &[],
        );
        frame[14..].to_vec()
    }

    #[test]
    fn test_linux_sll_header_is_stripped() {
        // packet type, ARPHRD_ETHER, address length, 8 address bytes, protocol
        let mut frame = vec![0x00, 0x00, 0x00, 0x01, 0x00, 0x06];
        frame.extend_from_slice(&[0x02, 0x42, 0xac, 0x11, 0x00, 0x02, 0x00, 0x00]);
        frame.extend_from_slice(&[0x08, 0x00]);
        frame.extend_from_slice(&ipv4_syn());

        let record = decode_packet(&packet(11, &frame), LinkType::LinuxSll).unwrap();
        assert_eq!(record.protocol, TransportProtocol::Tcp);
        assert_eq!(record.dst_port, 443);
        assert_eq!(record.src_ip, Some("172.16.0.5".parse().unwrap()));
        assert_eq!(record.payload_offset, 56);
    }

    #[test]
    fn test_short_linux_sll_frame_is_malformed() {
        let frame = [0x00, 0x00, 0x00, 0x01, 0x00, 0x06, 0x00, 0x00, 0x08, 0x00];
        assert_eq!(
            decode_packet(&packet(12, &frame), LinkType::LinuxSll),
            Err(TransportDecodeError::MalformedHeader)
        );
    }

    #[test]
    fn test_bsd_loopback_header_is_stripped() {
        // AF_INET in host byte order
        let mut frame = 2u32.to_le_bytes().to_vec();
        frame.extend_from_slice(&ipv4_syn());

        let record = decode_packet(&packet(13, &frame), LinkType::Null).unwrap();
        assert_eq!(record.protocol, TransportProtocol::Tcp);
        assert_eq!(record.src_port, 40001);
        assert!(record.tcp_flags.unwrap().is_syn_only());
        assert_eq!(record.payload_offset, 44);

        assert_eq!(
            decode_packet(&packet(14, &[0x02, 0x00]), LinkType::Null),
            Err(TransportDecodeError::MalformedHeader)
        );
    }

    #[test]
    fn test_qinq_double_tag_is_skipped() {
        let plain = testutil::tcp_frame(
            [10, 0, 0, 1], 1234, [10, 0, 0, 2], 8080, testutil::Tcp::syn(5), &[],
        );
        let mut tagged = plain[..12].to_vec();
        tagged.extend_from_slice(&[0x88, 0xa8, 0x00, 0x64]);
        tagged.extend_from_slice(&[0x81, 0x00, 0x00, 0x0a]);
        tagged.extend_from_slice(&plain[12..]);

        let record = decode_packet(&packet(15, &tagged), LinkType::Ethernet).unwrap();
        assert_eq!(record.dst_port, 8080);
        assert_eq!(record.payload_offset, 62);
    }

    #[test]
    fn test_decoding_is_deterministic() {
        let frame = testutil::tcp_frame(
            [10, 0, 0, 1], 1, [10, 0, 0, 2], 2, testutil::Tcp::psh_ack(9, 9), b"abc",
        );
        let pkt = packet(8, &frame);
        assert_eq!(
            decode_packet(&pkt, LinkType::Ethernet),
            decode_packet(&pkt, LinkType::Ethernet)
        );
    }
}
