use md5::{Digest, Md5};

use super::Framing;

/// Record header check: known content type and a 3.x record version.
pub fn looks_like_tls(payload: &[u8]) -> bool {
    payload.len() >= 5 && (20..=23).contains(&payload[0]) && payload[1] == 0x03 && payload[2] <= 0x04
}

/// Versions below TLS 1.2.
pub fn is_weak_version(version: &str) -> bool {
    matches!(version, "SSL 2.0" | "SSL 3.0" | "TLS 1.0" | "TLS 1.1")
}

/// Walk the TLS records in one segment. Hello messages contribute SNI, ALPN,
/// JA3/JA3S and the negotiated version; everything else is opaque.
pub fn parse(payload: &[u8]) -> Framing {
    let mut framing = Framing {
        raw_body: payload.to_vec(),
        encrypted: true,
        body_complete: true,
        ..Default::default()
    };

    let mut record_types: Vec<&str> = Vec::new();
    let mut record_version = None;
    let mut offset = 0;

    while offset + 5 <= payload.len() {
        let content_type = payload[offset];
        let version = u16::from_be_bytes([payload[offset + 1], payload[offset + 2]]);
        let len = u16::from_be_bytes([payload[offset + 3], payload[offset + 4]]) as usize;
        let start = offset + 5;

        record_version.get_or_insert(version);
        let name = record_type_name(content_type);
        if record_types.last() != Some(&name) {
            record_types.push(name);
        }

        let end = start + len;
        if end > payload.len() {
            framing.errors.push("truncated TLS record".to_string());
            framing.body_complete = false;
            if content_type == 22 {
                parse_handshake(&payload[start..], &mut framing);
            }
            offset = payload.len();
            break;
        }
        if content_type == 22 {
            parse_handshake(&payload[start..end], &mut framing);
        }
        offset = end;
    }

    if offset < payload.len() {
        framing.errors.push("trailing bytes after last TLS record".to_string());
        framing.body_complete = false;
    }

    framing.headers.insert("record_types".into(), record_types.join(","));
    if let Some(v) = record_version {
        framing.headers.insert("record_version".into(), format_tls_version(v));
        if framing.version.is_none() {
            framing.version = Some(format_tls_version(v));
        }
    }
    framing
}

fn parse_handshake(hs: &[u8], framing: &mut Framing) {
    let Some(&msg_type) = hs.first() else {
        return;
    };
    framing
        .headers
        .entry("handshake".into())
        .or_insert_with(|| handshake_name(msg_type).to_string());

    match msg_type {
        1 => match parse_client_hello(hs) {
            Some(ch) => {
                let version = ch
                    .supported_versions
                    .iter()
                    .copied()
                    .max()
                    .unwrap_or(ch.version);
                framing.version = Some(format_tls_version(version));
                let (ja3_string, ja3) = compute_ja3(&ch);
                framing.headers.insert("ja3".into(), ja3);
                framing.headers.insert("ja3_string".into(), ja3_string);
                if let Some(sni) = ch.sni {
                    framing.headers.insert("sni".into(), sni);
                }
                if !ch.alpn.is_empty() {
                    framing.headers.insert("alpn".into(), ch.alpn.join(","));
                }
            }
            None => framing.errors.push("malformed ClientHello".to_string()),
        },
        2 => match parse_server_hello(hs) {
            Some(sh) => {
                framing.version = Some(format_tls_version(sh.selected_version.unwrap_or(sh.version)));
                framing
                    .headers
                    .insert("cipher_suite".into(), format!("0x{:04x}", sh.cipher_suite));
                framing.headers.insert("ja3s".into(), compute_ja3s(&sh));
            }
            None => framing.errors.push("malformed ServerHello".to_string()),
        },
        _ => {}
    }
}

struct ClientHello {
    version: u16,
    ciphers: Vec<u16>,
    extensions: Vec<u16>,
    elliptic_curves: Vec<u16>,
    ec_point_formats: Vec<u8>,
    supported_versions: Vec<u16>,
    sni: Option<String>,
    alpn: Vec<String>,
}

struct ServerHello {
    version: u16,
    cipher_suite: u16,
    extensions: Vec<u16>,
    selected_version: Option<u16>,
}

/// `hs` starts at the handshake type byte.
fn parse_client_hello(hs: &[u8]) -> Option<ClientHello> {
    if hs.len() < 38 {
        return None;
    }

    let version = u16::from_be_bytes([hs[4], hs[5]]);
    // Skip random (32 bytes): hs[6..38]
    let mut offset = 38;

    let session_id_len = *hs.get(offset)? as usize;
    offset += 1 + session_id_len;

    if offset + 2 > hs.len() {
        return None;
    }
    let cs_len = u16::from_be_bytes([hs[offset], hs[offset + 1]]) as usize;
    offset += 2;
    if offset + cs_len > hs.len() {
        return None;
    }
    let ciphers = hs[offset..offset + cs_len]
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .filter(|c| !is_grease(*c))
        .collect();
    offset += cs_len;

    let comp_len = *hs.get(offset)? as usize;
    offset += 1 + comp_len;

    let mut hello = ClientHello {
        version,
        ciphers,
        extensions: Vec::new(),
        elliptic_curves: Vec::new(),
        ec_point_formats: Vec::new(),
        supported_versions: Vec::new(),
        sni: None,
        alpn: Vec::new(),
    };

    for (ext_type, ext_data) in extensions(hs, offset) {
        if !is_grease(ext_type) {
            hello.extensions.push(ext_type);
        }
        match ext_type {
            0x0000 => hello.sni = parse_sni_extension(ext_data),
            0x000a => hello.elliptic_curves = parse_u16_list(ext_data, 2),
            0x000b => hello.ec_point_formats = parse_ec_point_formats(ext_data),
            0x0010 => hello.alpn = parse_alpn_extension(ext_data),
            0x002b => hello.supported_versions = parse_u16_list(ext_data, 1),
            _ => {}
        }
    }

    Some(hello)
}

fn parse_server_hello(hs: &[u8]) -> Option<ServerHello> {
    if hs.len() < 40 {
        return None;
    }

    let version = u16::from_be_bytes([hs[4], hs[5]]);
    let mut offset = 38;

    let session_id_len = *hs.get(offset)? as usize;
    offset += 1 + session_id_len;

    if offset + 2 > hs.len() {
        return None;
    }
    let cipher_suite = u16::from_be_bytes([hs[offset], hs[offset + 1]]);
    // cipher suite + compression method
    offset += 3;

    let mut hello = ServerHello {
        version,
        cipher_suite,
        extensions: Vec::new(),
        selected_version: None,
    };
    for (ext_type, ext_data) in extensions(hs, offset) {
        if !is_grease(ext_type) {
            hello.extensions.push(ext_type);
        }
        if ext_type == 0x002b && ext_data.len() == 2 {
            hello.selected_version = Some(u16::from_be_bytes([ext_data[0], ext_data[1]]));
        }
    }
    Some(hello)
}

/// Iterate `(type, data)` over the extension block starting at `offset`.
fn extensions(hs: &[u8], mut offset: usize) -> Vec<(u16, &[u8])> {
    let mut out = Vec::new();
    if offset + 2 > hs.len() {
        return out;
    }
    let total = u16::from_be_bytes([hs[offset], hs[offset + 1]]) as usize;
    offset += 2;
    let end = (offset + total).min(hs.len());

    while offset + 4 <= end {
        let ext_type = u16::from_be_bytes([hs[offset], hs[offset + 1]]);
        let ext_len = u16::from_be_bytes([hs[offset + 2], hs[offset + 3]]) as usize;
        offset += 4;
        if offset + ext_len > end {
            break;
        }
        out.push((ext_type, &hs[offset..offset + ext_len]));
        offset += ext_len;
    }
    out
}

/// JA3 = md5(TLSVersion,Ciphers,Extensions,EllipticCurves,EllipticCurvePointFormats)
fn compute_ja3(ch: &ClientHello) -> (String, String) {
    let ja3_string = format!(
        "{},{},{},{},{}",
        ch.version,
        join(&ch.ciphers),
        join(&ch.extensions),
        join(&ch.elliptic_curves),
        join(&ch.ec_point_formats),
    );
    let hash = hex::encode(Md5::digest(ja3_string.as_bytes()));
    (ja3_string, hash)
}

/// JA3S = md5(TLSVersion,CipherSuite,Extensions)
fn compute_ja3s(sh: &ServerHello) -> String {
    let ja3s_string = format!("{},{},{}", sh.version, sh.cipher_suite, join(&sh.extensions));
    hex::encode(Md5::digest(ja3s_string.as_bytes()))
}

fn join<T: ToString>(values: &[T]) -> String {
    values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join("-")
}

fn parse_sni_extension(data: &[u8]) -> Option<String> {
    if data.len() < 5 {
        return None;
    }
    let name_len = u16::from_be_bytes([data[3], data[4]]) as usize;
    if data.len() < 5 + name_len {
        return None;
    }
    String::from_utf8(data[5..5 + name_len].to_vec()).ok()
}

/// List of u16 values behind a `prefix_len`-byte length prefix, GREASE removed.
fn parse_u16_list(data: &[u8], prefix_len: usize) -> Vec<u16> {
    if data.len() < prefix_len {
        return Vec::new();
    }
    let list_len = match prefix_len {
        1 => data[0] as usize,
        _ => u16::from_be_bytes([data[0], data[1]]) as usize,
    };
    let end = (prefix_len + list_len).min(data.len());
    data[prefix_len..end]
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .filter(|v| !is_grease(*v))
        .collect()
}

fn parse_ec_point_formats(data: &[u8]) -> Vec<u8> {
    if data.is_empty() {
        return Vec::new();
    }
    let len = data[0] as usize;
    data[1..(1 + len).min(data.len())].to_vec()
}

fn parse_alpn_extension(data: &[u8]) -> Vec<String> {
    if data.len() < 2 {
        return Vec::new();
    }
    let mut offset = 2;
    let mut protocols = Vec::new();

    while offset < data.len() {
        let proto_len = data[offset] as usize;
        offset += 1;
        if offset + proto_len > data.len() {
            break;
        }
        if let Ok(s) = String::from_utf8(data[offset..offset + proto_len].to_vec()) {
            protocols.push(s);
        }
        offset += proto_len;
    }
    protocols
}

fn record_type_name(t: u8) -> &'static str {
    match t {
        20 => "change_cipher_spec",
        21 => "alert",
        22 => "handshake",
        23 => "application_data",
        _ => "unknown",
    }
}

fn handshake_name(t: u8) -> &'static str {
    match t {
        1 => "client_hello",
        2 => "server_hello",
        4 => "new_session_ticket",
        11 => "certificate",
        12 => "server_key_exchange",
        13 => "certificate_request",
        14 => "server_hello_done",
        16 => "client_key_exchange",
        20 => "finished",
        _ => "encrypted",
    }
}

fn format_tls_version(v: u16) -> String {
    match v {
        0x0002 => "SSL 2.0".to_string(),
        0x0300 => "SSL 3.0".to_string(),
        0x0301 => "TLS 1.0".to_string(),
        0x0302 => "TLS 1.1".to_string(),
        0x0303 => "TLS 1.2".to_string(),
        0x0304 => "TLS 1.3".to_string(),
        _ => format!("0x{:04x}", v),
    }
}

fn is_grease(val: u16) -> bool {
    (val & 0x0f0f) == 0x0a0a
}
