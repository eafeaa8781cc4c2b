//! Content hashing shared by session and environment identity.

use sha2::{Digest, Sha256};

/// Separator fed between fields so `("ab", "c")` and `("a", "bc")` differ.
const FIELD_SEPARATOR: [u8; 1] = [0x1f];

/// SHA-256 over the given fields in order, rendered as lowercase hex.
pub fn sha256_hex<'a, I>(fields: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut h = Sha256::new();
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            h.update(FIELD_SEPARATOR);
        }
        h.update(field.as_bytes());
    }
    let digest: [u8; 32] = h.finalize().into();
    hex_encode(&digest)
}

/// Hex-encode bytes without any separator.
pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_encode_empty() {
        assert_eq!(hex_encode(&[]), "");
    }

    #[test]
    fn test_hex_encode_basic() {
        assert_eq!(hex_encode(&[0xab, 0xcd, 0x01]), "abcd01");
    }

    #[test]
    fn test_sha256_hex_is_stable() {
        let a = sha256_hex(["rev", "2026-01-01T00:00:00", "desc"]);
        let b = sha256_hex(["rev", "2026-01-01T00:00:00", "desc"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_sha256_hex_field_boundaries_matter() {
        assert_ne!(sha256_hex(["ab", "c"]), sha256_hex(["a", "bc"]));
    }

    #[test]
    fn test_sha256_hex_empty_input() {
        // SHA-256 of the empty string.
        assert_eq!(
            sha256_hex(std::iter::empty()),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
