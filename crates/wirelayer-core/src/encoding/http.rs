use std::collections::HashMap;
use std::io::Read;

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};

use super::{find, Framing};

const METHODS: [&str; 9] = [
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "CONNECT", "TRACE",
];

enum StartLine {
    Request,
    Response { status: Option<u16> },
}

pub fn starts_like_http(payload: &[u8]) -> bool {
    if payload.starts_with(b"HTTP/") {
        return true;
    }
    METHODS.iter().any(|m| {
        payload.len() > m.len() && payload.starts_with(m.as_bytes()) && payload[m.len()] == b' '
    })
}

/// Parse one HTTP/1.x message. The start line lands in `:`-prefixed
/// pseudo-headers; the body is de-chunked and decompressed into
/// `decoded_body` when needed.
pub fn parse(payload: &[u8], max_body: usize) -> Framing {
    let mut framing = Framing::default();

    let (head, body) = match find(payload, b"\r\n\r\n") {
        Some(end) => (&payload[..end], Some(&payload[end + 4..])),
        None => {
            framing.errors.push("incomplete header block".to_string());
            (payload, None)
        }
    };

    let head = String::from_utf8_lossy(head);
    let mut lines = head.lines();
    let start = parse_start_line(lines.next().unwrap_or_default(), &mut framing);

    for line in lines {
        match line.split_once(':') {
            Some((key, value)) => insert_header(&mut framing.headers, key.trim().to_lowercase(), value.trim()),
            None if line.trim().is_empty() => {}
            None => framing.errors.push(format!("malformed header line: {}", line)),
        }
    }

    if let Some(body) = body {
        read_body(&start, body, max_body, &mut framing);
        decompress(max_body, &mut framing);
    }

    framing
}

fn parse_start_line(line: &str, framing: &mut Framing) -> StartLine {
    let parts: Vec<&str> = line.splitn(3, ' ').collect();

    if line.starts_with("HTTP/") {
        framing.version = Some(parts[0].to_string());
        let status = parts.get(1).and_then(|s| s.trim().parse::<u16>().ok());
        match status {
            Some(code) => {
                framing.headers.insert(":status".to_string(), code.to_string());
            }
            None => framing.errors.push(format!("malformed status line: {}", line)),
        }
        if let Some(reason) = parts.get(2) {
            framing.headers.insert(":reason".to_string(), reason.trim().to_string());
        }
        return StartLine::Response { status };
    }

    framing.headers.insert(":method".to_string(), parts[0].to_string());
    if let Some(uri) = parts.get(1) {
        framing.headers.insert(":uri".to_string(), uri.to_string());
    }
    match parts.get(2) {
        Some(version) if version.starts_with("HTTP/") => framing.version = Some(version.trim().to_string()),
        _ => framing.errors.push(format!("malformed request line: {}", line)),
    }
    StartLine::Request
}

/// Repeated headers are folded into one comma-separated value.
fn insert_header(headers: &mut HashMap<String, String>, key: String, value: &str) {
    headers
        .entry(key)
        .and_modify(|existing| {
            existing.push_str(", ");
            existing.push_str(value);
        })
        .or_insert_with(|| value.to_string());
}

fn read_body(start: &StartLine, body: &[u8], max_body: usize, framing: &mut Framing) {
    let chunked = framing
        .headers
        .get("transfer-encoding")
        .map(|v| v.to_lowercase().contains("chunked"))
        .unwrap_or(false);

    if chunked {
        let (data, complete) = dechunk(body, max_body);
        if !complete {
            framing.errors.push("truncated chunked body".to_string());
        }
        framing.raw_body = body.to_vec();
        framing.decoded_body = Some(data);
        framing.body_complete = complete;
        return;
    }

    let declared = match framing.headers.get("content-length") {
        Some(v) => match v.trim().parse::<usize>() {
            Ok(len) => Some(len),
            Err(_) => {
                framing.errors.push(format!("invalid content-length: {}", v));
                None
            }
        },
        None => None,
    };

    match declared {
        Some(len) => {
            let take = len.min(body.len()).min(max_body);
            framing.raw_body = body[..take].to_vec();
            framing.body_complete = body.len() >= len;
            if !framing.body_complete {
                framing
                    .errors
                    .push(format!("truncated body: expected {} bytes, got {}", len, body.len()));
            }
        }
        None => {
            framing.raw_body = body[..body.len().min(max_body)].to_vec();
            // Without a length only bodiless messages are known to be whole.
            framing.body_complete = match start {
                StartLine::Request => body.is_empty(),
                StartLine::Response { status } => {
                    matches!(status, Some(100..=199) | Some(204) | Some(304))
                }
            };
        }
    }
}

fn decompress(max_body: usize, framing: &mut Framing) {
    let coding = match framing.headers.get("content-encoding") {
        Some(v) => v.trim().to_lowercase(),
        None => return,
    };
    let source = framing.decoded_body.as_deref().unwrap_or(&framing.raw_body);
    if source.is_empty() {
        return;
    }

    let inflated = match coding.as_str() {
        "gzip" | "x-gzip" => inflate(GzDecoder::new(source), max_body),
        "deflate" => inflate(ZlibDecoder::new(source), max_body)
            .or_else(|_| inflate(DeflateDecoder::new(source), max_body)),
        "identity" => return,
        other => {
            framing.errors.push(format!("unsupported content-encoding: {}", other));
            return;
        }
    };

    framing.is_compressed = true;
    match inflated {
        Ok(data) => framing.decoded_body = Some(data),
        Err(e) => framing.errors.push(format!("{} decode failed: {}", coding, e)),
    }
}

fn inflate(reader: impl Read, limit: usize) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    reader.take(limit as u64).read_to_end(&mut out)?;
    Ok(out)
}

/// Returns the de-chunked bytes and whether the terminating chunk was seen.
fn dechunk(body: &[u8], limit: usize) -> (Vec<u8>, bool) {
    let mut out = Vec::new();
    let mut remaining = body;
    loop {
        let line_end = match find(remaining, b"\r\n") {
            Some(pos) => pos,
            None => return (out, false),
        };
        let size_line = String::from_utf8_lossy(&remaining[..line_end]);
        let size_hex = size_line.split(';').next().unwrap_or_default().trim();
        let chunk_size = match usize::from_str_radix(size_hex, 16) {
            Ok(s) => s,
            Err(_) => return (out, false),
        };
        remaining = &remaining[line_end + 2..];
        if chunk_size == 0 {
            return (out, true);
        }

        let available = chunk_size.min(remaining.len());
        let room = limit.saturating_sub(out.len());
        out.extend_from_slice(&remaining[..available.min(room)]);
        if available < chunk_size {
            return (out, false);
        }
        remaining = &remaining[chunk_size..];
        remaining = remaining.strip_prefix(b"\r\n").unwrap_or(remaining);
    }
}
