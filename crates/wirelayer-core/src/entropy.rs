/// Bits per byte, 0.0 for an empty slice and 8.0 for a uniform byte histogram.
pub fn shannon_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }

    let mut histogram = [0u32; 256];
    data.iter().for_each(|&b| histogram[b as usize] += 1);

    let total = data.len() as f64;
    histogram
        .iter()
        .filter(|&&n| n > 0)
        .map(|&n| {
            let p = n as f64 / total;
            -p * p.log2()
        })
        .sum()
}

/// Short samples are never classified as encrypted: a few dozen bytes cannot
/// reach high entropy even when random.
pub fn looks_encrypted(entropy: f64, sample_len: usize, threshold: f64, min_sample: usize) -> bool {
    sample_len >= min_sample && entropy >= threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_bytes_have_no_entropy() {
        assert_eq!(shannon_entropy(&[0x41; 512]), 0.0);
        assert_eq!(shannon_entropy(&[]), 0.0);
    }

    #[test]
    fn test_http_header_is_not_encrypted() {
        let e = shannon_entropy(b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n");
        assert!(e > 3.0 && e < 5.5, "header entropy out of range: {}", e);
        assert!(!looks_encrypted(e, 64, 7.5, 64));
    }

    #[test]
    fn test_uniform_bytes_need_a_full_sample() {
        let data: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let e = shannon_entropy(&data);
        assert!(e > 7.99, "uniform bytes should be near 8 bits, got {}", e);
        assert!(looks_encrypted(e, data.len(), 7.5, 64));
        assert!(!looks_encrypted(e, 16, 7.5, 64));
    }
}
