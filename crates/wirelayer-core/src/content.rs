use md5::Md5;
use sha2::{Digest, Sha256};

use crate::models::*;
use crate::store::FileCandidate;

/// Output of the content stage for one encoding record.
#[derive(Debug)]
pub struct DecodedContent {
    pub record: ContentRecord,
    pub file: Option<FileCandidate>,
}

/// Decode an encoding record's body into content. Returns `None` when there
/// is nothing to decode: empty bodies and encrypted payloads end the chain
/// at the encoding layer.
pub fn decode(encoding: &EncodingRecord) -> Option<DecodedContent> {
    if encoding.encryption_detected {
        return None;
    }
    let body = encoding.body();
    if body.is_empty() {
        return None;
    }

    let declared = declared_type(encoding);
    let sniffed = magic_mime(body);
    let content_type = sniffed
        .map(str::to_string)
        .or_else(|| declared.clone())
        .unwrap_or_else(|| guess_mime(body).to_string());

    let textual = sniffed.is_none() && (is_text_type(&content_type) || is_mostly_text(body));
    let (text, binary) = if textual {
        (Some(String::from_utf8_lossy(body).into_owned()), None)
    } else {
        (None, Some(body.to_vec()))
    };

    let content_hash = hex::encode(Sha256::digest(body));
    let id = ContentId(encoding.id.packet());

    let file = if is_file_artifact(encoding, sniffed, declared.as_deref()) {
        let md5 = hex::encode(Md5::digest(body));
        let name = format!("{}_{}.{}", encoding.encoding_type.label().to_lowercase(), &content_hash[..12], mime_to_extension(&content_type));
        Some(FileCandidate {
            mime_type: content_type.clone(),
            name,
            md5,
            data: body.to_vec(),
        })
    } else {
        None
    };

    tracing::debug!(
        content = %id,
        content_type = %content_type,
        bytes = body.len(),
        file = file.is_some(),
        "content decoded"
    );

    Some(DecodedContent {
        record: ContentRecord {
            id,
            encoding: encoding.id,
            timestamp: encoding.timestamp,
            content_type,
            text,
            binary,
            content_hash,
            size_bytes: body.len() as u64,
            is_extracted: false,
            file: None,
        },
        file,
    })
}

/// A body counts as a complete file when its magic bytes say so, or when an
/// HTTP message declared both its type and its length and delivered all of it.
fn is_file_artifact(encoding: &EncodingRecord, sniffed: Option<&str>, declared: Option<&str>) -> bool {
    if sniffed.is_some() {
        return true;
    }
    encoding.encoding_type == EncodingType::Http
        && encoding.body_complete
        && declared.is_some()
        && (encoding.header("content-length").is_some() || encoding.header("transfer-encoding").is_some())
}

fn declared_type(encoding: &EncodingRecord) -> Option<String> {
    match encoding.encoding_type {
        EncodingType::Http => encoding
            .header("content-type")
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_lowercase())
            .filter(|v| !v.is_empty()),
        EncodingType::Dns => Some("text/dns".to_string()),
        _ => None,
    }
}

fn magic_mime(data: &[u8]) -> Option<&'static str> {
    if data.len() >= 4 {
        match &data[..4] {
            [0x89, b'P', b'N', b'G'] => return Some("image/png"),
            [0xFF, 0xD8, 0xFF, _] => return Some("image/jpeg"),
            [b'G', b'I', b'F', b'8'] => return Some("image/gif"),
            [b'P', b'K', 0x03, 0x04] => return Some("application/zip"),
            [0x7F, b'E', b'L', b'F'] => return Some("application/x-elf"),
            [b'M', b'Z', _, _] => return Some("application/x-pe"),
            [0x25, b'P', b'D', b'F'] => return Some("application/pdf"),
            _ => {}
        }
    }
    if data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b {
        return Some("application/gzip");
    }
    None
}

fn guess_mime(data: &[u8]) -> &'static str {
    match magic_mime(data) {
        Some(mime) => mime,
        None if is_mostly_text(data) => "text/plain",
        None => "application/octet-stream",
    }
}

fn is_text_type(mime: &str) -> bool {
    mime.starts_with("text/")
        || mime.ends_with("json")
        || mime.ends_with("xml")
        || mime.ends_with("javascript")
        || mime == "application/x-www-form-urlencoded"
}

fn is_mostly_text(data: &[u8]) -> bool {
    if data.is_empty() {
        return false;
    }
    let printable = data
        .iter()
        .filter(|&&b| (0x20..0x7f).contains(&b) || b == b'\n' || b == b'\r' || b == b'\t')
        .count();
    (printable as f64 / data.len() as f64) > 0.85
}

fn mime_to_extension(mime: &str) -> &'static str {
    match mime {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "application/zip" => "zip",
        "application/gzip" => "gz",
        "application/pdf" => "pdf",
        "application/x-elf" => "elf",
        "application/x-pe" => "exe",
        "application/json" => "json",
        "text/html" => "html",
        "text/plain" => "txt",
        _ => "bin",
    }
}
