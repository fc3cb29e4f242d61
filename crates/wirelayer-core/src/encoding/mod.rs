//! Encoding layer: demultiplexes one transport payload into typed
//! application framing.

pub mod dns;
pub mod http;
pub mod ssh;
pub mod tls;

use std::collections::HashMap;

use crate::config::AnalysisConfig;
use crate::entropy::{looks_encrypted, shannon_entropy};
use crate::models::*;

/// What a protocol parser recovered from one payload.
#[derive(Debug, Default)]
pub struct Framing {
    pub version: Option<String>,
    pub headers: HashMap<String, String>,
    pub raw_body: Vec<u8>,
    pub decoded_body: Option<Vec<u8>>,
    pub body_complete: bool,
    pub is_compressed: bool,
    /// The protocol itself implies encryption (TLS).
    pub encrypted: bool,
    pub errors: Vec<String>,
}

impl Framing {
    fn unknown(payload: &[u8], error: impl Into<String>) -> Self {
        Self {
            raw_body: payload.to_vec(),
            errors: vec![error.into()],
            ..Default::default()
        }
    }
}

/// Decode one transport segment. Always yields a record: payloads nothing
/// recognizes come back as UNKNOWN with `encoding_errors` filled in.
pub fn decode(transport: &TransportRecord, payload: &[u8], config: &AnalysisConfig) -> EncodingRecord {
    let (encoding_type, framing) = if let Some(err) = transport.decode_error {
        (EncodingType::Unknown, Framing::unknown(&[], format!("transport header undecodable: {}", err)))
    } else if payload.is_empty() {
        (EncodingType::Unknown, Framing::unknown(payload, "empty payload"))
    } else {
        match detect(transport, payload) {
            Some(EncodingType::Http) => (EncodingType::Http, http::parse(payload, config.max_body_bytes)),
            Some(EncodingType::Dns) => (EncodingType::Dns, dns::parse(dns_message(transport, payload))),
            Some(EncodingType::Tls) => (EncodingType::Tls, tls::parse(payload)),
            Some(EncodingType::Ssh) => (EncodingType::Ssh, ssh::parse(payload)),
            _ => (
                EncodingType::Unknown,
                Framing::unknown(payload, "no recognized protocol signature"),
            ),
        }
    };

    let body = framing.decoded_body.as_deref().unwrap_or(&framing.raw_body);
    let entropy = shannon_entropy(body);
    let encryption_detected = framing.encrypted
        || (!framing.is_compressed
            && looks_encrypted(
                entropy,
                body.len(),
                config.encryption_entropy_threshold,
                config.min_entropy_sample,
            ));

    if !framing.errors.is_empty() {
        tracing::debug!(
            transport = %transport.id,
            encoding = %encoding_type,
            errors = ?framing.errors,
            "encoding decoded with errors"
        );
    }

    EncodingRecord {
        id: EncodingId(transport.id.packet()),
        transport: transport.id,
        timestamp: transport.timestamp,
        encoding_type,
        version: framing.version,
        headers: framing.headers,
        raw_body: framing.raw_body,
        decoded_body: framing.decoded_body,
        body_complete: framing.body_complete,
        is_compressed: framing.is_compressed,
        encryption_detected,
        entropy,
        encoding_errors: framing.errors,
    }
}

/// Pick a protocol by payload signature, falling back to well-known ports.
pub fn detect(transport: &TransportRecord, payload: &[u8]) -> Option<EncodingType> {
    if !matches!(transport.protocol, TransportProtocol::Tcp | TransportProtocol::Udp) {
        return None;
    }
    if http::starts_like_http(payload) {
        return Some(EncodingType::Http);
    }
    if payload.starts_with(b"SSH-") {
        return Some(EncodingType::Ssh);
    }
    // DNS before TLS: a transaction id can look like a TLS record header.
    if on_port(transport, &[53, 5353]) && dns::looks_like_dns(dns_message(transport, payload)) {
        return Some(EncodingType::Dns);
    }
    if transport.protocol == TransportProtocol::Tcp && tls::looks_like_tls(payload) {
        return Some(EncodingType::Tls);
    }
    if transport.protocol == TransportProtocol::Tcp && on_port(transport, &[22]) {
        return Some(EncodingType::Ssh);
    }
    None
}

fn on_port(transport: &TransportRecord, ports: &[u16]) -> bool {
    ports.contains(&transport.src_port) || ports.contains(&transport.dst_port)
}

/// DNS over TCP carries a two-byte length prefix.
fn dns_message<'a>(transport: &TransportRecord, payload: &'a [u8]) -> &'a [u8] {
    if transport.protocol == TransportProtocol::Tcp && payload.len() >= 2 {
        let declared = u16::from_be_bytes([payload[0], payload[1]]) as usize;
        if declared == payload.len() - 2 {
            return &payload[2..];
        }
    }
    payload
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
