//! Access-token JWTs: ES256-signed `at+jwt` bound to a DPoP key thumbprint.
//!
//! Issuance and verification are split so the resource side never holds the
//! signing key.

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::OAuthError;

#[derive(Debug, Serialize)]
struct AccessTokenClaims {
    iss: String,
    aud: String,
    sub: String,
    client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
    cnf: CnfClaim,
    jti: String,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Serialize)]
struct CnfClaim {
    jkt: String,
}

/// Verified claims handed to resource middleware.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifiedAccessClaims {
    pub iss: String,
    pub sub: String,
    pub client_id: String,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub cnf: Option<VerifiedCnf>,
    pub jti: String,
    pub exp: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifiedCnf {
    #[serde(default)]
    pub jkt: Option<String>,
}

/// Signs access tokens with the server's ES256 key.
#[derive(Clone)]
pub struct AccessTokenIssuer {
    issuer: String,
    audience: String,
    ttl_seconds: u64,
    kid: String,
    encoding_key: EncodingKey,
}

impl std::fmt::Debug for AccessTokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of Debug output.
        f.debug_struct("AccessTokenIssuer")
            .field("issuer", &self.issuer)
            .field("kid", &self.kid)
            .field("ttl_seconds", &self.ttl_seconds)
            .finish()
    }
}

impl AccessTokenIssuer {
    /// `private_key_pem` must be a P-256 private key in PKCS#8 PEM form.
    pub fn new(
        private_key_pem: &str,
        kid: String,
        issuer: String,
        audience: String,
        ttl_seconds: u64,
    ) -> Result<Self, String> {
        let encoding_key = EncodingKey::from_ec_pem(private_key_pem.as_bytes()).map_err(|e| {
            warn!(error = %e, "failed to parse access JWT private key PEM (expected P-256 PKCS#8 PEM)");
            format!("invalid ES256 signing key: {e}")
        })?;

        Ok(Self {
            issuer,
            audience,
            ttl_seconds,
            kid,
            encoding_key,
        })
    }

    pub fn ttl_seconds(&self) -> u64 {
        self.ttl_seconds
    }

    pub fn issue(
        &self,
        sub: &str,
        client_id: &str,
        scope: Option<&str>,
        jkt: &str,
        jti: &str,
        now: DateTime<Utc>,
    ) -> Result<String, OAuthError> {
        let iat = now.timestamp();
        let claims = AccessTokenClaims {
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            sub: sub.to_string(),
            client_id: client_id.to_string(),
            scope: scope.map(str::to_string),
            cnf: CnfClaim {
                jkt: jkt.to_string(),
            },
            jti: jti.to_string(),
            iat,
            exp: iat + self.ttl_seconds as i64,
        };

        let mut header = Header::new(Algorithm::ES256);
        header.typ = Some("at+jwt".to_string());
        header.kid = Some(self.kid.clone());

        jsonwebtoken::encode(&header, &claims, &self.encoding_key).map_err(|e| {
            error!(error = %e, "failed to sign access token");
            OAuthError::InvalidRequest("token issuance failed".to_string())
        })
    }
}

/// Verifies access tokens on the resource side.
#[derive(Clone)]
pub struct AccessTokenVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl AccessTokenVerifier {
    pub fn new(
        public_key_pem: &str,
        issuer: &str,
        audience: &str,
        leeway_seconds: u64,
    ) -> Result<Self, String> {
        let decoding_key = DecodingKey::from_ec_pem(public_key_pem.as_bytes())
            .map_err(|e| format!("invalid ES256 public key pem: {e}"))?;

        let mut validation = Validation::new(Algorithm::ES256);
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[audience]);
        validation.leeway = leeway_seconds;

        Ok(Self {
            decoding_key,
            validation,
        })
    }

    pub fn verify(&self, token: &str) -> Result<VerifiedAccessClaims, jsonwebtoken::errors::Error> {
        let data = jsonwebtoken::decode::<VerifiedAccessClaims>(
            token,
            &self.decoding_key,
            &self.validation,
        )?;
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::dpop::test_support::TestDpopKey;

    const ISSUER: &str = "https://pds.example.com";

    fn pair() -> (AccessTokenIssuer, AccessTokenVerifier) {
        let key = TestDpopKey::generate();
        let issuer = AccessTokenIssuer::new(
            &key.private_pem(),
            "pds-key-1".to_string(),
            ISSUER.to_string(),
            ISSUER.to_string(),
            3600,
        )
        .unwrap();
        let verifier = AccessTokenVerifier::new(&key.public_pem(), ISSUER, ISSUER, 0).unwrap();
        (issuer, verifier)
    }

    #[test]
    fn issued_token_verifies_with_expected_claims() {
        let (issuer, verifier) = pair();
        let token = issuer
            .issue(
                "did:plc:alice",
                "https://app.example.com/meta.json",
                Some("atproto"),
                "thumbprint",
                "jti-1",
                Utc::now(),
            )
            .unwrap();

        let header = jsonwebtoken::decode_header(&token).unwrap();
        assert_eq!(header.typ.as_deref(), Some("at+jwt"));
        assert_eq!(header.kid.as_deref(), Some("pds-key-1"));

        let claims = verifier.verify(&token).unwrap();
        assert_eq!(claims.sub, "did:plc:alice");
        assert_eq!(claims.client_id, "https://app.example.com/meta.json");
        assert_eq!(claims.scope.as_deref(), Some("atproto"));
        assert_eq!(claims.jti, "jti-1");
        assert_eq!(claims.cnf.unwrap().jkt.as_deref(), Some("thumbprint"));
    }

    #[test]
    fn token_from_another_key_rejected() {
        let (_, verifier) = pair();
        let (other_issuer, _) = pair();

        let token = other_issuer
            .issue("did:plc:alice", "client", None, "jkt", "jti-2", Utc::now())
            .unwrap();

        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn expired_token_rejected() {
        let (issuer, verifier) = pair();
        let token = issuer
            .issue(
                "did:plc:alice",
                "client",
                None,
                "jkt",
                "jti-3",
                Utc::now() - chrono::Duration::hours(2),
            )
            .unwrap();

        assert!(verifier.verify(&token).is_err());
    }
}
