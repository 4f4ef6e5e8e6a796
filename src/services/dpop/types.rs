use jsonwebtoken::jwk::Jwk;
use serde::Deserialize;

/// Verifier knobs. Kept separate from `Config` so the core logic stays
/// testable without an environment.
#[derive(Debug, Clone)]
pub struct DpopPolicy {
    /// JWS algorithm names accepted for proofs. Algorithms the JOSE backend
    /// cannot handle are rejected at verification time.
    pub allowed_algorithms: Vec<String>,
    /// Maximum acceptable age of a proof (now - iat), seconds.
    pub max_proof_age_seconds: i64,
    /// Allowed iat drift (clock skew), seconds.
    pub clock_tolerance_seconds: i64,
    /// When set, every proof must echo this nonce exactly.
    pub expected_nonce: Option<String>,
}

impl Default for DpopPolicy {
    fn default() -> Self {
        Self {
            allowed_algorithms: vec!["ES256".to_string()],
            max_proof_age_seconds: 60,
            clock_tolerance_seconds: 10,
            expected_nonce: None,
        }
    }
}

impl DpopPolicy {
    /// TTL for replay entries: a proof older than this fails the iat window
    /// anyway, so the cache only needs to cover the acceptance span.
    pub fn replay_ttl_seconds(&self) -> u64 {
        (self.max_proof_age_seconds + self.clock_tolerance_seconds).max(1) as u64
    }
}

/// DPoP proof claims (RFC 9449 §4.2).
#[derive(Debug, Deserialize)]
pub struct DpopClaims {
    #[serde(default)]
    pub htm: Option<String>,
    #[serde(default)]
    pub htu: Option<String>,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default)]
    pub jti: Option<String>,
    /// base64url(SHA-256(access_token)); required iff the call carries one.
    #[serde(default)]
    pub ath: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
}

/// Outcome of a successful verification. The `jkt` is what token issuance
/// binds into `cnf.jkt`.
#[derive(Debug, Clone)]
pub struct VerifiedDpop {
    pub htm: String,
    pub htu: String,
    pub jti: String,
    pub ath: Option<String>,
    pub jkt: String,
    pub jwk: Jwk,
}
