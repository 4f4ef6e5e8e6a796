//! Token-endpoint client authentication (RFC 7523 private_key_jwt, plus the
//! `none` method for public clients).
//!
//! Assertion requirements: `iss == sub == client_id`, `aud` contains this
//! server's token endpoint, `exp` in the future within a bounded lifetime,
//! `iat` inside a five-minute window, `jti` single-use.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::OAuthError;
use crate::services::clients::metadata::{ClientMetadata, TokenEndpointAuthMethod};
use crate::services::dpop::core::key_matches_algorithm;
use crate::services::encoding::base64url_decode;
use crate::storage::Storage;

pub const JWT_BEARER_ASSERTION_TYPE: &str =
    "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Asymmetric algorithms accepted for client assertions.
const ASSERTION_ALGORITHMS: [&str; 6] = ["ES256", "ES384", "ES512", "RS256", "RS384", "RS512"];

/// Maximum assertion lifetime / iat window, seconds.
const MAX_ASSERTION_LIFETIME_SECS: i64 = 300;

/// Client-authentication material carried in a token or PAR request body.
#[derive(Debug, Clone, Default)]
pub struct ClientAuthParams {
    pub client_assertion_type: Option<String>,
    pub client_assertion: Option<String>,
}

impl ClientAuthParams {
    fn is_empty(&self) -> bool {
        self.client_assertion_type.is_none() && self.client_assertion.is_none()
    }
}

#[derive(Debug, Deserialize)]
struct AssertionClaims {
    iss: String,
    sub: String,
    #[serde(default)]
    aud: Value,
    exp: i64,
    #[serde(default)]
    iat: Option<i64>,
    jti: String,
}

fn aud_contains(aud: &Value, expected: &str) -> bool {
    match aud {
        Value::String(s) => s == expected,
        Value::Array(items) => items.iter().any(|v| v.as_str() == Some(expected)),
        _ => false,
    }
}

#[derive(Clone)]
pub struct ClientAuthenticator {
    http: reqwest::Client,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    /// Absolute URL; client assertions must be addressed to it.
    token_endpoint: String,
}

impl ClientAuthenticator {
    pub fn new(
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        fetch_timeout: Duration,
        token_endpoint: String,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(fetch_timeout).build()?;

        Ok(Self {
            http,
            storage,
            clock,
            token_endpoint,
        })
    }

    /// Authenticate a request against the client's registered method.
    pub async fn authenticate(
        &self,
        metadata: &ClientMetadata,
        params: &ClientAuthParams,
    ) -> Result<(), OAuthError> {
        match metadata.auth_method() {
            TokenEndpointAuthMethod::None => {
                // Public clients must not send confidential-client material.
                if !params.is_empty() {
                    return Err(OAuthError::InvalidClient(
                        "public client must not send a client assertion".to_string(),
                    ));
                }
                Ok(())
            }
            TokenEndpointAuthMethod::PrivateKeyJwt => {
                self.verify_assertion(metadata, params).await
            }
        }
    }

    async fn verify_assertion(
        &self,
        metadata: &ClientMetadata,
        params: &ClientAuthParams,
    ) -> Result<(), OAuthError> {
        if params.client_assertion_type.as_deref() != Some(JWT_BEARER_ASSERTION_TYPE) {
            return Err(OAuthError::InvalidClient(
                "client_assertion_type must be the jwt-bearer URN".to_string(),
            ));
        }
        let assertion = params.client_assertion.as_deref().ok_or_else(|| {
            OAuthError::InvalidClient("client_assertion is required".to_string())
        })?;

        let (alg, kid) = assertion_header(assertion)?;
        if !ASSERTION_ALGORITHMS.contains(&alg.as_str()) {
            return Err(OAuthError::InvalidClient(format!(
                "unsupported client assertion alg: {alg}"
            )));
        }
        let algorithm = Algorithm::from_str(&alg).map_err(|_| {
            OAuthError::InvalidClient(format!("unsupported client assertion alg: {alg}"))
        })?;

        let keys = self.client_keys(metadata).await?;
        let jwk = select_key(&keys, kid.as_deref(), &alg).ok_or_else(|| {
            OAuthError::InvalidClient("no registered key matches the assertion".to_string())
        })?;
        let decoding_key = DecodingKey::from_jwk(jwk).map_err(|e| {
            warn!(client_id = %metadata.client_id, error = %e, "unusable client jwk");
            OAuthError::InvalidClient("client key is not usable".to_string())
        })?;

        let mut validation = Validation::new(algorithm);
        validation.set_audience(&[&self.token_endpoint]);
        validation.set_issuer(&[&metadata.client_id]);

        let token_data =
            jsonwebtoken::decode::<AssertionClaims>(assertion, &decoding_key, &validation)
                .map_err(|e| {
                    debug!(client_id = %metadata.client_id, error = %e, "client assertion rejected");
                    OAuthError::InvalidClient("client assertion verification failed".to_string())
                })?;
        let claims = token_data.claims;

        if claims.iss != metadata.client_id || claims.sub != metadata.client_id {
            return Err(OAuthError::InvalidClient(
                "assertion iss and sub must equal client_id".to_string(),
            ));
        }
        if !aud_contains(&claims.aud, &self.token_endpoint) {
            return Err(OAuthError::InvalidClient(
                "assertion audience must contain the token endpoint".to_string(),
            ));
        }

        let now = self.clock.now_timestamp();
        if claims.exp > now + MAX_ASSERTION_LIFETIME_SECS {
            return Err(OAuthError::InvalidClient(
                "assertion exp exceeds the allowed lifetime".to_string(),
            ));
        }
        let iat = claims.iat.ok_or_else(|| {
            OAuthError::InvalidClient("assertion iat is required".to_string())
        })?;
        if iat > now + 30 || now - iat > MAX_ASSERTION_LIFETIME_SECS {
            return Err(OAuthError::InvalidClient(
                "assertion iat outside the allowed window".to_string(),
            ));
        }

        // jti single-use inside the assertion's own validity window.
        let ttl = (claims.exp - now).clamp(1, MAX_ASSERTION_LIFETIME_SECS) as u64;
        let fresh = self
            .storage
            .check_and_save_nonce(
                &claims.jti,
                &format!("client-assertion:{}", metadata.client_id),
                Duration::from_secs(ttl),
            )
            .await
            .map_err(|e| {
                warn!(error = %e, "assertion replay check unavailable");
                OAuthError::InvalidClient("client authentication unavailable".to_string())
            })?;
        if !fresh {
            return Err(OAuthError::InvalidClient(
                "assertion jti already used".to_string(),
            ));
        }

        Ok(())
    }

    async fn client_keys(&self, metadata: &ClientMetadata) -> Result<JwkSet, OAuthError> {
        if let Some(jwks) = &metadata.jwks {
            return Ok(jwks.clone());
        }

        let Some(jwks_uri) = &metadata.jwks_uri else {
            // normalize_metadata guarantees one of the two for private_key_jwt.
            return Err(OAuthError::InvalidClient(
                "client has no registered keys".to_string(),
            ));
        };

        self.http
            .get(jwks_uri)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| {
                warn!(jwks_uri = %jwks_uri, error = %e, "jwks fetch failed");
                OAuthError::InvalidClient("client jwks unavailable".to_string())
            })?
            .json::<JwkSet>()
            .await
            .map_err(|_| OAuthError::InvalidClient("client jwks is not valid JSON".to_string()))
    }
}

/// Pull `alg` and `kid` from the unverified JOSE header; key selection needs
/// them before any signature check can run.
fn assertion_header(assertion: &str) -> Result<(String, Option<String>), OAuthError> {
    #[derive(Deserialize)]
    struct RawHeader {
        alg: String,
        #[serde(default)]
        kid: Option<String>,
    }

    let mut parts = assertion.split('.');
    let header_b64 = parts
        .next()
        .ok_or_else(|| OAuthError::InvalidClient("malformed client assertion".to_string()))?;
    if parts.count() != 2 {
        return Err(OAuthError::InvalidClient("malformed client assertion".to_string()));
    }

    let bytes = base64url_decode(header_b64)
        .ok_or_else(|| OAuthError::InvalidClient("malformed client assertion".to_string()))?;
    let header: RawHeader = serde_json::from_slice(&bytes)
        .map_err(|_| OAuthError::InvalidClient("malformed client assertion".to_string()))?;

    Ok((header.alg, header.kid))
}

/// Select by `kid` when the header names one, otherwise by algorithm family.
fn select_key<'a>(keys: &'a JwkSet, kid: Option<&str>, alg: &str) -> Option<&'a Jwk> {
    match kid {
        Some(kid) => keys
            .keys
            .iter()
            .find(|k| k.common.key_id.as_deref() == Some(kid)),
        None => keys.keys.iter().find(|k| key_matches_algorithm(alg, k)),
    }
}
