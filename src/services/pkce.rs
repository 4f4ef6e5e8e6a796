//! PKCE (RFC 7636), S256 only.
//!
//! The `plain` method is never accepted; it adds nothing over S256 and leaks
//! verifier length through variable-length comparison.

use sha2::{Digest, Sha256};

use crate::services::encoding::{base64url_encode, constant_time_eq, random_string};

/// Allowed verifier charset per RFC 7636 §4.1 ("unreserved" characters).
fn is_verifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '~' | '-')
}

/// `base64url(SHA256(verifier))`.
pub fn generate_code_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    base64url_encode(&digest)
}

/// 48 random bytes -> 64 base64url chars, comfortably inside [43, 128].
pub fn generate_code_verifier() -> String {
    random_string(48)
}

/// Verify a code verifier against the challenge committed at PAR time.
///
/// Rejects any method other than `S256`, verifiers outside [43, 128] chars,
/// and verifiers with characters outside the RFC charset. The final digest
/// comparison is constant-time.
pub fn verify_pkce(verifier: &str, challenge: &str, method: &str) -> bool {
    if method != "S256" {
        return false;
    }
    if verifier.len() < 43 || verifier.len() > 128 {
        return false;
    }
    if !verifier.chars().all(is_verifier_char) {
        return false;
    }

    constant_time_eq(&generate_code_challenge(verifier), challenge)
}
