use std::net::{Ipv4Addr, Ipv6Addr};

use super::Framing;

/// Header shape check: sane opcode and a small question count.
pub fn looks_like_dns(msg: &[u8]) -> bool {
    if msg.len() < 12 {
        return false;
    }
    let flags = u16::from_be_bytes([msg[2], msg[3]]);
    let opcode = (flags >> 11) & 0xF;
    let qdcount = u16::from_be_bytes([msg[4], msg[5]]);
    opcode <= 2 && (1..=10).contains(&qdcount)
}

/// Parse one DNS message. Header fields become headers; questions and
/// answers are rendered one per line into the decoded body.
pub fn parse(msg: &[u8]) -> Framing {
    let mut framing = Framing {
        raw_body: msg.to_vec(),
        ..Default::default()
    };
    if msg.len() < 12 {
        framing.errors.push("truncated DNS header".to_string());
        return framing;
    }

    let id = u16::from_be_bytes([msg[0], msg[1]]);
    let flags = u16::from_be_bytes([msg[2], msg[3]]);
    let is_response = (flags & 0x8000) != 0;
    let qdcount = u16::from_be_bytes([msg[4], msg[5]]) as usize;
    let ancount = u16::from_be_bytes([msg[6], msg[7]]) as usize;

    let headers = &mut framing.headers;
    headers.insert("id".into(), format!("0x{:04x}", id));
    headers.insert("qr".into(), if is_response { "response" } else { "query" }.into());
    headers.insert("opcode".into(), ((flags >> 11) & 0xF).to_string());
    headers.insert("rcode".into(), rcode_name(flags & 0x000F).into());
    headers.insert("qdcount".into(), qdcount.to_string());
    headers.insert("ancount".into(), ancount.to_string());

    let mut lines = Vec::new();
    let mut offset = 12;
    let mut complete = true;

    for i in 0..qdcount {
        let Some((name, next)) = read_name(msg, offset) else {
            framing.errors.push("malformed question name".to_string());
            complete = false;
            break;
        };
        if next + 4 > msg.len() {
            framing.errors.push("truncated question section".to_string());
            complete = false;
            break;
        }
        let qtype = type_name(u16::from_be_bytes([msg[next], msg[next + 1]]));
        if i == 0 {
            framing.headers.insert("qname".into(), name.clone());
            framing.headers.insert("qtype".into(), qtype.clone());
        }
        lines.push(format!("question {} {}", name, qtype));
        offset = next + 4;
    }

    if complete && is_response {
        for _ in 0..ancount {
            let Some((name, next)) = read_name(msg, offset) else {
                framing.errors.push("malformed answer name".to_string());
                complete = false;
                break;
            };
            if next + 10 > msg.len() {
                framing.errors.push("truncated answer section".to_string());
                complete = false;
                break;
            }
            let rtype = u16::from_be_bytes([msg[next], msg[next + 1]]);
            let ttl = u32::from_be_bytes([msg[next + 4], msg[next + 5], msg[next + 6], msg[next + 7]]);
            let rdlength = u16::from_be_bytes([msg[next + 8], msg[next + 9]]) as usize;
            let rdata_start = next + 10;
            if rdata_start + rdlength > msg.len() {
                framing.errors.push("truncated answer data".to_string());
                complete = false;
                break;
            }
            let rdata = render_rdata(rtype, msg, rdata_start, rdlength);
            lines.push(format!("answer {} {} ttl={} {}", name, type_name(rtype), ttl, rdata));
            offset = rdata_start + rdlength;
        }
    }

    framing.body_complete = complete;
    framing.decoded_body = Some(lines.join("\n").into_bytes());
    framing
}

/// Read a possibly compressed name; returns it with the offset just past
/// its in-place encoding.
fn read_name(data: &[u8], mut offset: usize) -> Option<(String, usize)> {
    let mut parts: Vec<String> = Vec::new();
    let mut jumped = false;
    let mut return_offset = 0;
    let mut seen = 0;

    loop {
        if offset >= data.len() || seen > 256 {
            return None;
        }
        seen += 1;

        let len = data[offset] as usize;
        if len == 0 {
            if !jumped {
                return_offset = offset + 1;
            }
            break;
        }

        if len & 0xC0 == 0xC0 {
            if offset + 1 >= data.len() {
                return None;
            }
            let ptr = ((len & 0x3F) << 8) | (data[offset + 1] as usize);
            if !jumped {
                return_offset = offset + 2;
            }
            offset = ptr;
            jumped = true;
            continue;
        }

        offset += 1;
        if offset + len > data.len() {
            return None;
        }
        parts.push(String::from_utf8_lossy(&data[offset..offset + len]).into_owned());
        offset += len;
    }

    let name = if parts.is_empty() { ".".to_string() } else { parts.join(".") };
    Some((name, return_offset))
}

fn render_rdata(rtype: u16, msg: &[u8], start: usize, len: usize) -> String {
    let rdata = &msg[start..start + len];
    match rtype {
        1 if len == 4 => Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]).to_string(),
        28 if len == 16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(rdata);
            Ipv6Addr::from(octets).to_string()
        }
        // CNAME, NS, PTR
        2 | 5 | 12 => read_name(msg, start).map(|(n, _)| n).unwrap_or_else(|| hex::encode(rdata)),
        15 if len > 2 => {
            let pref = u16::from_be_bytes([rdata[0], rdata[1]]);
            match read_name(msg, start + 2) {
                Some((exchange, _)) => format!("{} {}", pref, exchange),
                None => hex::encode(rdata),
            }
        }
        16 if !rdata.is_empty() => {
            let txt_len = rdata[0] as usize;
            if txt_len < rdata.len() {
                String::from_utf8_lossy(&rdata[1..1 + txt_len]).into_owned()
            } else {
                hex::encode(rdata)
            }
        }
        _ => hex::encode(rdata),
    }
}

fn rcode_name(rcode: u16) -> &'static str {
    match rcode {
        0 => "NOERROR",
        1 => "FORMERR",
        2 => "SERVFAIL",
        3 => "NXDOMAIN",
        4 => "NOTIMP",
        5 => "REFUSED",
        _ => "UNKNOWN",
    }
}

fn type_name(qtype: u16) -> String {
    match qtype {
        1 => "A".to_string(),
        2 => "NS".to_string(),
        5 => "CNAME".to_string(),
        6 => "SOA".to_string(),
        12 => "PTR".to_string(),
        15 => "MX".to_string(),
        16 => "TXT".to_string(),
        28 => "AAAA".to_string(),
        33 => "SRV".to_string(),
        41 => "OPT".to_string(),
        65 => "HTTPS".to_string(),
        255 => "ANY".to_string(),
        _ => format!("TYPE{}", qtype),
    }
}
