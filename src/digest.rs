//! Payload digests (SHA-1, base32 encoded as archives record them).

use crate::error::ArchiveError;
use sha1::{Digest, Sha1};
use tracing::{info, warn};

/// The only hash scheme archives record payload digests with.
pub const DIGEST_PREFIX: &str = "sha1:";

const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Computes the SHA-1 digest of a payload in base32, matching
/// `WARC-Payload-Digest` values without their prefix.
pub fn sha1_base32(payload: &[u8]) -> String {
    let digest = Sha1::digest(payload);
    base32_encode(&digest)
}

/// Strips the scheme from a `WARC-Payload-Digest` header value.
///
/// Anything other than `sha1:` is rejected.
pub fn parse_payload_digest(value: &str) -> Result<String, ArchiveError> {
    value
        .strip_prefix(DIGEST_PREFIX)
        .map(str::to_string)
        .ok_or_else(|| {
            ArchiveError::Validation(format!(
                "expected digest '{}' to start with '{}'",
                value, DIGEST_PREFIX
            ))
        })
}

/// Normalizes a digest reported by a CDX server.
///
/// CDX rows normally carry the bare base32 value; a scheme-prefixed value is
/// accepted only with the `sha1:` scheme.
pub fn normalize_index_digest(value: &str) -> Result<Option<String>, ArchiveError> {
    let value = value.trim();
    if value.is_empty() || value == "-" {
        return Ok(None);
    }
    if value.contains(':') {
        return parse_payload_digest(value).map(Some);
    }
    Ok(Some(value.to_string()))
}

/// Checks a payload against a recorded digest.
///
/// Accepts base32 (32 chars) or hex (40 chars) SHA-1 values.
pub fn matches(expected: &str, payload: &[u8]) -> bool {
    let expected = expected.strip_prefix(DIGEST_PREFIX).unwrap_or(expected);
    if expected.len() == 40 {
        let computed = format!("{:x}", Sha1::digest(payload));
        computed.eq_ignore_ascii_case(expected)
    } else {
        sha1_base32(payload).eq_ignore_ascii_case(expected)
    }
}

/// Logs the outcome of comparing a fetched payload to its recorded digest.
///
/// # Returns
///
/// `true` if the payload matches, `false` otherwise.
pub(crate) fn verify_payload(label: &str, expected: &str, payload: &[u8]) -> bool {
    if matches(expected, payload) {
        info!("✅ Digest verified for {}", label);
        true
    } else {
        warn!(
            "❌ Digest mismatch for {}: expected {}, got {}",
            label,
            expected,
            sha1_base32(payload)
        );
        false
    }
}

fn base32_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() * 8).div_ceil(5));
    let mut buffer: u32 = 0;
    let mut bits = 0;

    for &byte in data {
        buffer = (buffer << 8) | byte as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    // SHA-1 output is 160 bits, so no padding is ever needed here.
    while out.len() % 8 != 0 {
        out.push('=');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base32_rfc4648_vectors() {
        assert_eq!(base32_encode(b""), "");
        assert_eq!(base32_encode(b"f"), "MY======");
        assert_eq!(base32_encode(b"fo"), "MZXQ====");
        assert_eq!(base32_encode(b"foobar"), "MZXW6YTBOI======");
    }

    #[test]
    fn test_sha1_base32_of_empty_payload() {
        // Well-known digest of the empty payload in WARC files.
        assert_eq!(sha1_base32(b""), "3I42H3S6NNFQ2MSVX7XZKYAYSCX5QBYJ");
    }

    #[test]
    fn test_parse_payload_digest() {
        assert_eq!(
            parse_payload_digest("sha1:3I42H3S6NNFQ2MSVX7XZKYAYSCX5QBYJ").unwrap(),
            "3I42H3S6NNFQ2MSVX7XZKYAYSCX5QBYJ"
        );
        let err = parse_payload_digest("md5:abcdef").unwrap_err();
        assert!(matches!(err, ArchiveError::Validation(_)));
        assert!(err.to_string().contains("md5:abcdef"));
    }

    #[test]
    fn test_normalize_index_digest() {
        assert_eq!(normalize_index_digest("-").unwrap(), None);
        assert_eq!(
            normalize_index_digest("ABC").unwrap(),
            Some("ABC".to_string())
        );
        assert_eq!(
            normalize_index_digest("sha1:ABC").unwrap(),
            Some("ABC".to_string())
        );
        assert!(normalize_index_digest("sha256:ABC").is_err());
    }

    #[test]
    fn test_matches_base32_and_hex() {
        let payload = b"hello world";
        let b32 = sha1_base32(payload);
        assert!(matches(&b32, payload));
        assert!(matches(&format!("sha1:{}", b32), payload));
        assert!(matches("2aae6c35c94fcfb415dbe95f408b9ce91ee846ed", payload));
        assert!(!matches(&b32, b"goodbye"));
    }
}
