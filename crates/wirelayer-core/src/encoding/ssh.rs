use super::{find, Framing};

/// Identification banner plus, when present in the same segment, the
/// algorithm lists from KEXINIT. Whatever follows the banner is the body.
pub fn parse(payload: &[u8]) -> Framing {
    let mut framing = Framing {
        body_complete: true,
        ..Default::default()
    };

    let rest = if payload.starts_with(b"SSH-") {
        let (line, rest) = match find(payload, b"\n") {
            Some(end) => (&payload[..end], &payload[end + 1..]),
            None => {
                framing.errors.push("unterminated identification banner".to_string());
                framing.body_complete = false;
                (payload, &[][..])
            }
        };
        let banner = String::from_utf8_lossy(line).trim_end_matches('\r').to_string();
        let parts: Vec<&str> = banner.splitn(3, '-').collect();
        match parts.get(1) {
            Some(proto) if parts.len() == 3 => framing.version = Some(proto.to_string()),
            _ => framing.errors.push(format!("malformed identification banner: {}", banner)),
        }
        if let Some(software) = extract_ssh_version(&banner) {
            framing.headers.insert("software".into(), software);
        }
        if let Some((_, comments)) = banner.split_once(' ') {
            framing.headers.insert("comments".into(), comments.to_string());
        }
        framing.headers.insert("banner".into(), banner);
        rest
    } else {
        payload
    };

    if let Some(kex) = try_parse_kex_init(rest) {
        framing.headers.insert("message".into(), "kexinit".into());
        framing.headers.insert("kex_algorithms".into(), kex.kex_algorithms.join(","));
        framing.headers.insert("host_key_algorithms".into(), kex.host_key_algorithms.join(","));
        framing.headers.insert("ciphers".into(), kex.ciphers.join(","));
        framing.headers.insert("macs".into(), kex.macs.join(","));
    }

    framing.raw_body = rest.to_vec();
    framing
}

fn extract_ssh_version(banner: &str) -> Option<String> {
    let parts: Vec<&str> = banner.splitn(3, '-').collect();
    if parts.len() >= 3 {
        Some(parts[2].split_whitespace().next().unwrap_or(parts[2]).to_string())
    } else {
        None
    }
}

struct KexInit {
    kex_algorithms: Vec<String>,
    host_key_algorithms: Vec<String>,
    ciphers: Vec<String>,
    macs: Vec<String>,
}

/// Binary packet: length(4) + padding length(1) + msg type(1) + cookie(16).
fn try_parse_kex_init(data: &[u8]) -> Option<KexInit> {
    if data.len() < 22 || data[5] != 20 {
        return None;
    }
    let payload = &data[5..];
    let mut offset = 17;

    let kex_algorithms = read_name_list(payload, &mut offset)?;
    let host_key_algorithms = read_name_list(payload, &mut offset)?;
    let ciphers = read_name_list(payload, &mut offset)?;
    let _ciphers_server = read_name_list(payload, &mut offset)?;
    let macs = read_name_list(payload, &mut offset)?;

    Some(KexInit {
        kex_algorithms,
        host_key_algorithms,
        ciphers,
        macs,
    })
}

fn read_name_list(data: &[u8], offset: &mut usize) -> Option<Vec<String>> {
    if *offset + 4 > data.len() {
        return None;
    }
    let len = u32::from_be_bytes([data[*offset], data[*offset + 1], data[*offset + 2], data[*offset + 3]]) as usize;
    *offset += 4;
    if *offset + len > data.len() {
        return None;
    }
    let s = String::from_utf8_lossy(&data[*offset..*offset + len]);
    *offset += len;
    Some(s.split(',').map(|s| s.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name_list(s: &str) -> Vec<u8> {
        let mut out = (s.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(s.as_bytes());
        out
    }

    #[test]
    fn test_extract_ssh_version() {
        assert_eq!(extract_ssh_version("SSH-2.0-OpenSSH_8.9"), Some("OpenSSH_8.9".into()));
        assert_eq!(extract_ssh_version("SSH-2.0-libssh2_1.10.0"), Some("libssh2_1.10.0".into()));
    }

    #[test]
    fn test_banner_fields() {
        let framing = parse(b"SSH-2.0-OpenSSH_8.9p1 Ubuntu-3ubuntu0.1\r\n");
        assert_eq!(framing.version.as_deref(), Some("2.0"));
        assert_eq!(framing.headers["software"], "OpenSSH_8.9p1");
        assert_eq!(framing.headers["comments"], "Ubuntu-3ubuntu0.1");
        assert!(framing.raw_body.is_empty());
        assert!(framing.errors.is_empty());
    }

    #[test]
    fn test_kexinit_after_banner() {
        let mut msg = vec![20u8];
        msg.extend_from_slice(&[0u8; 16]);
        for list in ["curve25519-sha256", "ssh-ed25519", "aes128-ctr,3des-cbc", "aes128-ctr", "hmac-sha2-256"] {
            msg.extend_from_slice(&name_list(list));
        }
        let mut packet = ((msg.len() + 1) as u32).to_be_bytes().to_vec();
        packet.push(0);
        packet.extend_from_slice(&msg);

        let mut payload = b"SSH-2.0-Go\r\n".to_vec();
        payload.extend_from_slice(&packet);

        let framing = parse(&payload);
        assert_eq!(framing.headers["software"], "Go");
        assert_eq!(framing.headers["kex_algorithms"], "curve25519-sha256");
        assert_eq!(framing.headers["ciphers"], "aes128-ctr,3des-cbc");
        assert_eq!(framing.raw_body, packet);
    }
}
