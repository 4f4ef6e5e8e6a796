//! base64url + randomness helpers shared by every identifier the server mints.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use subtle::ConstantTimeEq;

/// RFC 4648 §5 base64url, no padding. Output matches `[A-Za-z0-9_-]+`.
pub fn base64url_encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn base64url_decode(input: &str) -> Option<Vec<u8>> {
    URL_SAFE_NO_PAD.decode(input).ok()
}

/// CSPRNG-backed opaque identifier: `n_bytes` of entropy, base64url-encoded.
///
/// Callers must pass at least 16 bytes (128 bits); smaller identifiers are a
/// programmer error.
pub fn random_string(n_bytes: usize) -> String {
    debug_assert!(n_bytes >= 12, "identifiers need >= 96 bits of entropy");

    let mut bytes = vec![0u8; n_bytes];
    getrandom::fill(&mut bytes).expect("getrandom failed");

    base64url_encode(&bytes)
}

/// Constant-time string equality for secret-bearing comparisons.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64url_matches_charset() {
        let encoded = base64url_encode(&[0xff, 0xee, 0x00, 0x10, 0x7f, 0x80]);
        assert!(
            encoded
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
        assert!(!encoded.contains('='));
    }

    #[test]
    fn base64url_roundtrip() {
        let bytes = [1u8, 2, 3, 4, 5, 6, 7];
        assert_eq!(base64url_decode(&base64url_encode(&bytes)).unwrap(), bytes);
    }

    #[test]
    fn random_string_has_expected_length_and_charset() {
        // 48 bytes -> 64 base64url chars, 12 bytes -> 16.
        assert_eq!(random_string(48).len(), 64);
        assert_eq!(random_string(12).len(), 16);

        let s = random_string(32);
        assert!(
            s.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
    }

    #[test]
    fn random_strings_do_not_collide() {
        let a = random_string(32);
        let b = random_string(32);
        assert_ne!(a, b);
    }

    #[test]
    fn constant_time_eq_semantics() {
        assert!(constant_time_eq("same", "same"));
        assert!(!constant_time_eq("same", "different"));
        assert!(!constant_time_eq("same", "sama"));
    }
}
