//! Frame builders shared by the unit tests.

use chrono::{DateTime, Utc};
use etherparse::PacketBuilder;

use crate::models::{Packet, PacketId, SessionId};

const SRC_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
const DST_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x02];

#[derive(Debug, Clone, Copy, Default)]
pub struct Tcp {
    pub seq: u32,
    pub ack: Option<u32>,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
}

impl Tcp {
    pub fn syn(seq: u32) -> Self {
        Self { seq, syn: true, ..Default::default() }
    }

    pub fn syn_ack(seq: u32, ack: u32) -> Self {
        Self { seq, ack: Some(ack), syn: true, ..Default::default() }
    }

    pub fn psh_ack(seq: u32, ack: u32) -> Self {
        Self { seq, ack: Some(ack), psh: true, ..Default::default() }
    }

    pub fn fin_ack(seq: u32, ack: u32) -> Self {
        Self { seq, ack: Some(ack), fin: true, ..Default::default() }
    }

    pub fn rst(seq: u32) -> Self {
        Self { seq, rst: true, ..Default::default() }
    }
}

pub fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

pub fn packet(frame_number: u64, data: &[u8]) -> Packet {
    packet_in(SessionId::new(), frame_number, data)
}

pub fn packet_in(session: SessionId, frame_number: u64, data: &[u8]) -> Packet {
    Packet {
        id: PacketId { session, frame_number },
        timestamp: ts(frame_number as i64),
        size: data.len() as u32,
        data: data.to_vec(),
    }
}

pub fn tcp_frame(
    src: [u8; 4],
    src_port: u16,
    dst: [u8; 4],
    dst_port: u16,
    tcp: Tcp,
    payload: &[u8],
) -> Vec<u8> {
    let mut builder = PacketBuilder::ethernet2(SRC_MAC, DST_MAC)
        .ipv4(src, dst, 64)
        .tcp(src_port, dst_port, tcp.seq, 64240);
    if tcp.syn {
        builder = builder.syn();
    }
    if tcp.fin {
        builder = builder.fin();
    }
    if tcp.rst {
        builder = builder.rst();
    }
    if tcp.psh {
        builder = builder.psh();
    }
    if let Some(ack) = tcp.ack {
        builder = builder.ack(ack);
    }
    let mut buf = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut buf, payload).unwrap();
    buf
}

pub fn udp_frame(src: [u8; 4], src_port: u16, dst: [u8; 4], dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2(SRC_MAC, DST_MAC)
        .ipv4(src, dst, 64)
        .udp(src_port, dst_port);
    let mut buf = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut buf, payload).unwrap();
    buf
}

pub fn udp6_frame(src: [u8; 16], src_port: u16, dst: [u8; 16], dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2(SRC_MAC, DST_MAC)
        .ipv6(src, dst, 64)
        .udp(src_port, dst_port);
    let mut buf = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut buf, payload).unwrap();
    buf
}

/// Minimal DNS query for `name` (type A, class IN).
pub fn dns_query(id: u16, name: &str) -> Vec<u8> {
    let mut msg = id.to_be_bytes().to_vec();
    msg.extend_from_slice(&[0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    for label in name.split('.') {
        msg.push(label.len() as u8);
        msg.extend_from_slice(label.as_bytes());
    }
    msg.extend_from_slice(&[0x00, 0x00, 0x01, 0x00, 0x01]);
    msg
}

/// TLS handshake record carrying a ClientHello with one SNI extension and
/// two cipher suites (TLS_AES_128_GCM_SHA256, TLS_RSA_WITH_AES_128_CBC_SHA).
pub fn tls_client_hello(sni: &str, version: u16) -> Vec<u8> {
    let name = sni.as_bytes();
    let mut sni_ext = Vec::new();
    sni_ext.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
    sni_ext.push(0);
    sni_ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
    sni_ext.extend_from_slice(name);

    let mut extensions = vec![0x00, 0x00];
    extensions.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
    extensions.extend_from_slice(&sni_ext);

    let mut body = version.to_be_bytes().to_vec();
    body.extend_from_slice(&[0x42; 32]);
    body.push(0);
    body.extend_from_slice(&[0x00, 0x04, 0x13, 0x01, 0x00, 0x2f]);
    body.extend_from_slice(&[0x01, 0x00]);
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = vec![0x01];
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}
