//! DPoP proof validation (RFC 9449) - core logic.
//!
//! This module is intentionally "core-only": it performs no I/O. Replay
//! registration (`jti` storage) lives with the caller, which runs it through
//! the storage nonce primitive after this verification succeeds.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, jwk::Jwk};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::services::dpop::types::{DpopClaims, DpopPolicy, VerifiedDpop};
use crate::services::encoding::{base64url_decode, base64url_encode};

#[derive(Debug, thiserror::Error)]
pub enum DpopError {
    #[error("missing DPoP header")]
    MissingProof,
    #[error("invalid DPoP proof jwt")]
    InvalidJwt,
    #[error("invalid DPoP typ")]
    InvalidTyp,
    #[error("unsupported DPoP alg: {0}")]
    UnsupportedAlg(String),
    #[error("missing jwk in DPoP header")]
    MissingJwk,
    #[error("DPoP jwk must be a public key")]
    PrivateKeyMaterial,
    #[error("unsupported jwk for DPoP")]
    UnsupportedJwk,
    #[error("missing required claim: {0}")]
    MissingClaim(&'static str),
    #[error("htm mismatch")]
    MethodMismatch,
    #[error("htu mismatch")]
    UriMismatch,
    #[error("iat out of range")]
    InvalidIat,
    #[error("ath mismatch")]
    AthMismatch,
    #[error("nonce missing or stale")]
    NonceMismatch,
    #[error("DPoP proof replayed")]
    Replayed,
    #[error("replay check unavailable")]
    ReplayCheckFailed,
}

/// Verify a DPoP proof against the request it claims to cover.
///
/// - `method`, `request_uri`: the request target (we validate `htm`/`htu`;
///   `request_uri` is the canonical public URL of the endpoint).
/// - `access_token`: present on protected-resource calls; forces `ath`.
///
/// Replay protection is intentionally NOT implemented here; callers must
/// register `(jti, jkt)` through storage afterwards.
pub fn verify_proof(
    policy: &DpopPolicy,
    proof: &str,
    method: &str,
    request_uri: &str,
    access_token: Option<&str>,
    now: DateTime<Utc>,
) -> Result<VerifiedDpop, DpopError> {
    // 1) Raw JOSE header: typ / alg / embedded public JWK.
    let header = decode_raw_header(proof)?;

    let typ = header
        .get("typ")
        .and_then(Value::as_str)
        .ok_or(DpopError::InvalidTyp)?;
    if !typ.eq_ignore_ascii_case("dpop+jwt") {
        return Err(DpopError::InvalidTyp);
    }

    let alg = header
        .get("alg")
        .and_then(Value::as_str)
        .ok_or(DpopError::InvalidJwt)?
        .to_string();
    if !policy.allowed_algorithms.iter().any(|a| a == &alg) {
        return Err(DpopError::UnsupportedAlg(alg));
    }
    let algorithm =
        Algorithm::from_str(&alg).map_err(|_| DpopError::UnsupportedAlg(alg.clone()))?;

    let jwk_value = header.get("jwk").ok_or(DpopError::MissingJwk)?;
    reject_private_material(jwk_value)?;

    let jwk: Jwk =
        serde_json::from_value(jwk_value.clone()).map_err(|_| DpopError::UnsupportedJwk)?;
    if !key_matches_algorithm(&alg, &jwk) {
        return Err(DpopError::UnsupportedJwk);
    }

    // 2) Signature under the embedded key (EmbeddedJWK rule).
    let decoding_key = DecodingKey::from_jwk(&jwk).map_err(|e| {
        warn!(error = %e, "invalid DPoP jwk");
        DpopError::UnsupportedJwk
    })?;

    let mut validation = Validation::new(algorithm);
    // Proof freshness is iat/max-age based; exp and aud do not apply.
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.remove("exp");

    let token_data = decode::<DpopClaims>(proof, &decoding_key, &validation).map_err(|e| {
        warn!(error = %e, "invalid DPoP proof signature");
        DpopError::InvalidJwt
    })?;
    let claims = token_data.claims;

    // 3) iat window.
    let iat = claims.iat.ok_or(DpopError::MissingClaim("iat"))?;
    let now_ts = now.timestamp();
    let tolerance = policy.clock_tolerance_seconds;
    if iat > now_ts + tolerance {
        return Err(DpopError::InvalidIat);
    }
    if now_ts - iat > policy.max_proof_age_seconds + tolerance {
        return Err(DpopError::InvalidIat);
    }

    // 4) Required claims.
    let jti = claims.jti.ok_or(DpopError::MissingClaim("jti"))?;
    let htm = claims.htm.ok_or(DpopError::MissingClaim("htm"))?;
    let htu = claims.htu.ok_or(DpopError::MissingClaim("htu"))?;

    // 5) htm is case-sensitive per RFC 9110 method semantics.
    if htm != method {
        return Err(DpopError::MethodMismatch);
    }

    // 6) htu, compared after normalization on both sides.
    if normalize_htu(&htu)? != normalize_htu(request_uri)? {
        return Err(DpopError::UriMismatch);
    }

    // 7) Server nonce.
    if let Some(expected) = policy.expected_nonce.as_deref() {
        if claims.nonce.as_deref() != Some(expected) {
            return Err(DpopError::NonceMismatch);
        }
    }

    // 8) ath binds the proof to the presented access token, and only then.
    match (access_token, claims.ath.as_deref()) {
        (Some(token), Some(ath)) => {
            if ath != compute_ath(token) {
                return Err(DpopError::AthMismatch);
            }
        }
        (Some(_), None) => return Err(DpopError::MissingClaim("ath")),
        (None, Some(_)) => return Err(DpopError::AthMismatch),
        (None, None) => {}
    }

    let jkt = compute_jwk_thumbprint(&jwk)?;

    Ok(VerifiedDpop {
        htm,
        htu,
        jti,
        ath: claims.ath,
        jkt,
        jwk,
    })
}

pub fn compute_ath(access_token: &str) -> String {
    base64url_encode(&Sha256::digest(access_token.as_bytes()))
}

/// RFC 7638 thumbprint: SHA-256 over the canonical JSON of the key's
/// required members, in lexicographic order.
pub fn compute_jwk_thumbprint(jwk: &Jwk) -> Result<String, DpopError> {
    use jsonwebtoken::jwk::{AlgorithmParameters, EllipticCurve};

    let canonical = match &jwk.algorithm {
        AlgorithmParameters::EllipticCurve(params) => {
            let crv = match params.curve {
                EllipticCurve::P256 => "P-256",
                EllipticCurve::P384 => "P-384",
                EllipticCurve::P521 => "P-521",
                _ => return Err(DpopError::UnsupportedJwk),
            };
            format!(
                "{{\"crv\":\"{}\",\"kty\":\"EC\",\"x\":\"{}\",\"y\":\"{}\"}}",
                crv, params.x, params.y
            )
        }
        AlgorithmParameters::RSA(params) => {
            format!("{{\"e\":\"{}\",\"kty\":\"RSA\",\"n\":\"{}\"}}", params.e, params.n)
        }
        _ => return Err(DpopError::UnsupportedJwk),
    };

    Ok(base64url_encode(&Sha256::digest(canonical.as_bytes())))
}

fn decode_raw_header(proof: &str) -> Result<Value, DpopError> {
    let mut parts = proof.split('.');
    let header_b64 = parts.next().ok_or(DpopError::InvalidJwt)?;
    if parts.count() != 2 {
        return Err(DpopError::InvalidJwt);
    }

    let bytes = base64url_decode(header_b64).ok_or(DpopError::InvalidJwt)?;
    serde_json::from_slice(&bytes).map_err(|_| DpopError::InvalidJwt)
}

/// EmbeddedJWK rule: the header key must carry no private or symmetric
/// material. `jsonwebtoken`'s JWK type silently drops unknown members, so
/// this check runs on the raw JSON.
fn reject_private_material(jwk: &Value) -> Result<(), DpopError> {
    const PRIVATE_MEMBERS: [&str; 8] = ["d", "p", "q", "dp", "dq", "qi", "oth", "k"];

    let object = jwk.as_object().ok_or(DpopError::MissingJwk)?;
    if PRIVATE_MEMBERS.iter().any(|m| object.contains_key(*m)) {
        return Err(DpopError::PrivateKeyMaterial);
    }
    Ok(())
}

pub(crate) fn key_matches_algorithm(alg: &str, jwk: &Jwk) -> bool {
    use jsonwebtoken::jwk::{AlgorithmParameters, EllipticCurve};

    match &jwk.algorithm {
        AlgorithmParameters::EllipticCurve(params) => matches!(
            (alg, &params.curve),
            ("ES256", EllipticCurve::P256)
                | ("ES384", EllipticCurve::P384)
                | ("ES512", EllipticCurve::P521)
        ),
        AlgorithmParameters::RSA(_) => matches!(alg, "RS256" | "RS384" | "RS512"),
        _ => false,
    }
}

/// RFC 9449 §4.3 comparison form: lowercase scheme and host, drop default
/// ports, strip query and fragment. Only http(s) without userinfo is valid.
fn normalize_htu(raw: &str) -> Result<String, DpopError> {
    let url = url::Url::parse(raw).map_err(|_| DpopError::UriMismatch)?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(DpopError::UriMismatch);
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(DpopError::UriMismatch);
    }

    let scheme = url.scheme().to_ascii_lowercase();
    let host = url
        .host_str()
        .ok_or(DpopError::UriMismatch)?
        .to_ascii_lowercase();

    // `Url::port` already reports None for scheme-default ports.
    let mut out = format!("{}://{}", scheme, host);
    if let Some(port) = url.port() {
        out.push(':');
        out.push_str(&port.to_string());
    }
    out.push_str(url.path());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::services::dpop::test_support::{TestDpopKey, proof_claims};

    const TOKEN_URL: &str = "https://pds.example.com/oauth/token";

    fn policy() -> DpopPolicy {
        DpopPolicy::default()
    }

    #[test]
    fn valid_proof_passes_and_exposes_thumbprint() {
        let key = TestDpopKey::generate();
        let now = Utc::now();
        let proof = key.sign_proof(proof_claims("POST", TOKEN_URL, now.timestamp()));

        let verified = verify_proof(&policy(), &proof, "POST", TOKEN_URL, None, now).unwrap();

        assert_eq!(verified.htm, "POST");
        assert_eq!(verified.jkt, key.jkt());
        assert!(verified.ath.is_none());
    }

    #[test]
    fn typ_must_be_dpop_jwt() {
        let key = TestDpopKey::generate();
        let now = Utc::now();
        let proof = key.sign_proof_with_typ("JWT", proof_claims("POST", TOKEN_URL, now.timestamp()));

        assert!(matches!(
            verify_proof(&policy(), &proof, "POST", TOKEN_URL, None, now),
            Err(DpopError::InvalidTyp)
        ));
    }

    #[test]
    fn disallowed_algorithm_rejected() {
        let key = TestDpopKey::generate();
        let now = Utc::now();
        let proof = key.sign_proof(proof_claims("POST", TOKEN_URL, now.timestamp()));

        let restrictive = DpopPolicy {
            allowed_algorithms: vec!["ES384".to_string()],
            ..DpopPolicy::default()
        };

        assert!(matches!(
            verify_proof(&restrictive, &proof, "POST", TOKEN_URL, None, now),
            Err(DpopError::UnsupportedAlg(_))
        ));
    }

    #[test]
    fn jwk_with_private_member_rejected() {
        let key = TestDpopKey::generate();
        let now = Utc::now();
        let proof = key.sign_proof_with_private_jwk(proof_claims("POST", TOKEN_URL, now.timestamp()));

        assert!(matches!(
            verify_proof(&policy(), &proof, "POST", TOKEN_URL, None, now),
            Err(DpopError::PrivateKeyMaterial)
        ));
    }

    #[test]
    fn signature_must_match_embedded_key() {
        let signer = TestDpopKey::generate();
        let other = TestDpopKey::generate();
        let now = Utc::now();

        // Claims signed by one key, header advertising another.
        let proof = signer.sign_proof_with_jwk(
            other.public_jwk(),
            proof_claims("POST", TOKEN_URL, now.timestamp()),
        );

        assert!(matches!(
            verify_proof(&policy(), &proof, "POST", TOKEN_URL, None, now),
            Err(DpopError::InvalidJwt)
        ));
    }

    #[test]
    fn iat_window_is_enforced() {
        use crate::clock::{Clock, test::FixedClock};

        let key = TestDpopKey::generate();
        let clock = FixedClock::at(Utc::now());
        clock.advance(86_400);
        let now = clock.now();

        let stale = key.sign_proof(proof_claims("POST", TOKEN_URL, now.timestamp() - 120));
        assert!(matches!(
            verify_proof(&policy(), &stale, "POST", TOKEN_URL, None, now),
            Err(DpopError::InvalidIat)
        ));

        let future = key.sign_proof(proof_claims("POST", TOKEN_URL, now.timestamp() + 60));
        assert!(matches!(
            verify_proof(&policy(), &future, "POST", TOKEN_URL, None, now),
            Err(DpopError::InvalidIat)
        ));

        // Within the 10 s tolerance.
        let skewed = key.sign_proof(proof_claims("POST", TOKEN_URL, now.timestamp() + 5));
        assert!(verify_proof(&policy(), &skewed, "POST", TOKEN_URL, None, now).is_ok());
    }

    #[test]
    fn htm_is_case_sensitive() {
        let key = TestDpopKey::generate();
        let now = Utc::now();
        let proof = key.sign_proof(proof_claims("post", TOKEN_URL, now.timestamp()));

        assert!(matches!(
            verify_proof(&policy(), &proof, "POST", TOKEN_URL, None, now),
            Err(DpopError::MethodMismatch)
        ));
    }

    #[test]
    fn htu_normalization_accepts_equivalent_forms() {
        let key = TestDpopKey::generate();
        let now = Utc::now();

        // Default port, uppercase host, query and fragment all normalize away.
        let proof = key.sign_proof(proof_claims(
            "POST",
            "HTTPS://PDS.Example.com:443/oauth/token?x=1#frag",
            now.timestamp(),
        ));

        assert!(verify_proof(&policy(), &proof, "POST", TOKEN_URL, None, now).is_ok());
    }

    #[test]
    fn htu_mismatch_and_userinfo_rejected() {
        let key = TestDpopKey::generate();
        let now = Utc::now();

        let wrong_path = key.sign_proof(proof_claims(
            "POST",
            "https://pds.example.com/oauth/par",
            now.timestamp(),
        ));
        assert!(matches!(
            verify_proof(&policy(), &wrong_path, "POST", TOKEN_URL, None, now),
            Err(DpopError::UriMismatch)
        ));

        let userinfo = key.sign_proof(proof_claims(
            "POST",
            "https://alice@pds.example.com/oauth/token",
            now.timestamp(),
        ));
        assert!(matches!(
            verify_proof(&policy(), &userinfo, "POST", TOKEN_URL, None, now),
            Err(DpopError::UriMismatch)
        ));
    }

    #[test]
    fn expected_nonce_is_required_and_exact() {
        let key = TestDpopKey::generate();
        let now = Utc::now();

        let with_nonce = DpopPolicy {
            expected_nonce: Some("server-nonce".to_string()),
            ..DpopPolicy::default()
        };

        let missing = key.sign_proof(proof_claims("POST", TOKEN_URL, now.timestamp()));
        assert!(matches!(
            verify_proof(&with_nonce, &missing, "POST", TOKEN_URL, None, now),
            Err(DpopError::NonceMismatch)
        ));

        let mut claims = proof_claims("POST", TOKEN_URL, now.timestamp());
        claims["nonce"] = json!("server-nonce");
        let good = key.sign_proof(claims);
        assert!(verify_proof(&with_nonce, &good, "POST", TOKEN_URL, None, now).is_ok());
    }

    #[test]
    fn ath_required_with_access_token_and_forbidden_without() {
        let key = TestDpopKey::generate();
        let now = Utc::now();
        let access_token = "example.access.token";

        let without_ath = key.sign_proof(proof_claims("GET", TOKEN_URL, now.timestamp()));
        assert!(matches!(
            verify_proof(&policy(), &without_ath, "GET", TOKEN_URL, Some(access_token), now),
            Err(DpopError::MissingClaim("ath"))
        ));

        let mut claims = proof_claims("GET", TOKEN_URL, now.timestamp());
        claims["ath"] = json!(compute_ath(access_token));
        let with_ath = key.sign_proof(claims.clone());

        let verified =
            verify_proof(&policy(), &with_ath, "GET", TOKEN_URL, Some(access_token), now).unwrap();
        assert_eq!(verified.ath.as_deref(), Some(compute_ath(access_token).as_str()));

        // Unsolicited ath is as invalid as a missing one.
        assert!(matches!(
            verify_proof(&policy(), &with_ath, "GET", TOKEN_URL, None, now),
            Err(DpopError::AthMismatch)
        ));

        claims["ath"] = json!("not-the-hash");
        let wrong = key.sign_proof(claims);
        assert!(matches!(
            verify_proof(&policy(), &wrong, "GET", TOKEN_URL, Some(access_token), now),
            Err(DpopError::AthMismatch)
        ));
    }

    #[test]
    fn rfc7638_rsa_thumbprint_vector() {
        // RFC 7638 §3.1 example key and thumbprint.
        let jwk: Jwk = serde_json::from_value(json!({
            "kty": "RSA",
            "n": "0vx7agoebGcQSuuPiLJXZptN9nndrQmbXEps2aiAFbWhM78LhWx4cbbfAAtVT86zwu1RK7aPFFxuhDR1L6tSoc_BJECPebWKRXjBZCiFV4n3oknjhMstn64tZ_2W-5JsGY4Hc5n9yBXArwl93lqt7_RN5w6Cf0h4QyQ5v-65YGjQR0_FDW2QvzqY368QQMicAtaSqzs8KJZgnYb9c7d0zgdAZHzu6qMQvRL5hajrn1n91CbOpbISD08qNLyrdkt-bFTWhAI4vMQFh6WeZu0fM4lFd2NcRwr3XPksINHaQ-G_xBniIqbw0Ls1jF44-csFCur-kEgU8awapJzKnqDKgw",
            "e": "AQAB"
        }))
        .unwrap();

        assert_eq!(
            compute_jwk_thumbprint(&jwk).unwrap(),
            "NzbLsXh8uDCcd-6MNwXF4W_7noWXFZAfHkxZsRGC9Xs"
        );
    }
}
