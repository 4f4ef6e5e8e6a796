//! The OAuth 2.1 state machine: PAR, authorize, token, refresh, revoke.
//!
//! Every handler below is a pure request/response transformation over the
//! injected `Storage` and `Clock`; the atomic primitives (PAR consumption,
//! code use, refresh rotation, nonce registration) are the only places where
//! concurrent requests interact.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::OAuthError;
use crate::services::clients::authenticator::{ClientAuthParams, ClientAuthenticator};
use crate::services::clients::resolver::ClientResolver;
use crate::services::consent::{ConsentDecision, ConsentProvider};
use crate::services::dpop::{self, DpopError, DpopPolicy, VerifiedDpop};
use crate::services::encoding::{base64url_decode, random_string};
use crate::services::pkce::verify_pkce;
use crate::services::tokens::AccessTokenIssuer;
use crate::storage::{
    AuthCodeRecord, CodeConsumption, ParRecord, RefreshRotation, Storage, StorageError,
    TokenRecord,
};

pub const REQUEST_URI_PREFIX: &str = "urn:ietf:params:oauth:request_uri:";

/// RFC 9126 recommends short-lived request URIs; atproto uses 90 seconds.
pub const PAR_TTL_SECONDS: i64 = 90;

const CODE_TTL_SECONDS: i64 = 60;

/// Pushed authorization request parameters, after form decoding.
#[derive(Debug, Clone)]
pub struct ParParams {
    pub client_id: String,
    pub redirect_uri: String,
    pub response_type: String,
    pub code_challenge: String,
    pub code_challenge_method: String,
    pub state: String,
    pub scope: Option<String>,
    pub login_hint: Option<String>,
    /// DPoP thumbprint the client wants the eventual tokens bound to.
    pub dpop_jkt: Option<String>,
    pub auth: ClientAuthParams,
}

#[derive(Debug, Clone)]
pub struct ParOutcome {
    pub request_uri: String,
    pub expires_in: i64,
}

#[derive(Debug, Clone)]
pub struct CodeExchangeParams {
    pub code: String,
    pub redirect_uri: String,
    pub code_verifier: String,
    pub client_id: String,
    pub auth: ClientAuthParams,
}

#[derive(Debug, Clone)]
pub struct RefreshParams {
    pub refresh_token: String,
    pub client_id: String,
    pub auth: ClientAuthParams,
}

/// Issued pair, ready for the token-endpoint response body.
#[derive(Debug, Clone)]
pub struct IssuedTokens {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: u64,
    pub refresh_token: String,
    pub scope: Option<String>,
    pub sub: String,
}

pub struct OAuthService {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    resolver: ClientResolver,
    authenticator: ClientAuthenticator,
    access_tokens: AccessTokenIssuer,
    dpop_policy: DpopPolicy,
    issuer: String,
    refresh_ttl_seconds: u64,
}

impl OAuthService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        resolver: ClientResolver,
        authenticator: ClientAuthenticator,
        access_tokens: AccessTokenIssuer,
        dpop_policy: DpopPolicy,
        issuer: String,
        refresh_ttl_seconds: u64,
    ) -> Self {
        Self {
            storage,
            clock,
            resolver,
            authenticator,
            access_tokens,
            dpop_policy,
            issuer,
            refresh_ttl_seconds,
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn token_endpoint(&self) -> String {
        format!("{}/oauth/token", self.issuer)
    }

    /// Nonce to advertise in `DPoP-Nonce` response headers, when configured.
    pub fn dpop_nonce(&self) -> Option<&str> {
        self.dpop_policy.expected_nonce.as_deref()
    }

    pub fn resolver(&self) -> &ClientResolver {
        &self.resolver
    }

    /// §PAR: validate, authenticate, persist, hand back a one-shot
    /// `request_uri` with a 90 second fuse.
    pub async fn pushed_authorization_request(
        &self,
        params: ParParams,
    ) -> Result<ParOutcome, OAuthError> {
        let metadata = self.resolver.resolve(&params.client_id).await?;

        if !metadata.redirect_uris.iter().any(|r| r == &params.redirect_uri) {
            return Err(OAuthError::InvalidRequest(
                "redirect_uri is not registered for this client".to_string(),
            ));
        }

        self.authenticator.authenticate(&metadata, &params.auth).await?;

        if params.response_type != "code" {
            return Err(OAuthError::UnsupportedResponseType);
        }
        if params.code_challenge_method != "S256" {
            return Err(OAuthError::InvalidRequest(
                "code_challenge_method must be S256".to_string(),
            ));
        }
        if params.code_challenge.is_empty() {
            return Err(OAuthError::InvalidRequest(
                "code_challenge is required".to_string(),
            ));
        }
        if params.state.is_empty() {
            return Err(OAuthError::InvalidRequest("state is required".to_string()));
        }

        let now = self.clock.now();
        let request_uri = format!("{}{}", REQUEST_URI_PREFIX, random_string(12));
        let record = ParRecord {
            client_id: params.client_id,
            redirect_uri: params.redirect_uri,
            response_type: params.response_type,
            code_challenge: params.code_challenge,
            code_challenge_method: params.code_challenge_method,
            state: params.state,
            scope: params.scope,
            login_hint: params.login_hint,
            dpop_jkt: params.dpop_jkt,
            expires_at: now + ChronoDuration::seconds(PAR_TTL_SECONDS),
        };

        self.storage
            .save_par(
                &request_uri,
                &record,
                Duration::from_secs(PAR_TTL_SECONDS as u64),
            )
            .await?;

        debug!(client_id = %record.client_id, "pushed authorization request stored");

        Ok(ParOutcome {
            request_uri,
            expires_in: PAR_TTL_SECONDS,
        })
    }

    /// §Authorize: consume the pushed request (one-shot), ask the host for
    /// consent, and produce the redirect URL for either outcome.
    pub async fn authorize(
        &self,
        client_id: &str,
        request_uri: &str,
        consent: &dyn ConsentProvider,
    ) -> Result<String, OAuthError> {
        let record = self
            .storage
            .consume_par(request_uri, client_id)
            .await?
            .ok_or_else(|| {
                OAuthError::InvalidRequest(
                    "unknown request_uri or client_id mismatch".to_string(),
                )
            })?;

        let now = self.clock.now();
        if record.expires_at <= now {
            return Err(OAuthError::InvalidRequest(
                "authorization request expired".to_string(),
            ));
        }

        let metadata = self.resolver.resolve(client_id).await?;

        match consent.decide(&metadata, &record).await {
            ConsentDecision::Approved { sub } => {
                let code = random_string(32);
                let code_record = AuthCodeRecord {
                    client_id: record.client_id.clone(),
                    redirect_uri: record.redirect_uri.clone(),
                    code_challenge: record.code_challenge.clone(),
                    scope: record.scope.clone(),
                    sub: sub.clone(),
                    dpop_jkt: record.dpop_jkt.clone(),
                    expires_at: now + ChronoDuration::seconds(CODE_TTL_SECONDS),
                    used: false,
                    family_id: None,
                };
                self.storage.save_auth_code(&code, &code_record).await?;

                info!(client_id = %record.client_id, sub = %sub, "authorization code issued");

                Ok(authorize_redirect(
                    &record.redirect_uri,
                    &[("code", &code), ("state", &record.state), ("iss", &self.issuer)],
                )?)
            }
            ConsentDecision::Denied => Ok(authorize_redirect(
                &record.redirect_uri,
                &[
                    ("error", "access_denied"),
                    ("state", &record.state),
                    ("iss", &self.issuer),
                ],
            )?),
        }
    }

    /// §Token, `grant_type=authorization_code`.
    pub async fn exchange_code(
        &self,
        params: CodeExchangeParams,
        dpop_proof: Option<&str>,
    ) -> Result<IssuedTokens, OAuthError> {
        let proof = self.verify_dpop(dpop_proof, "POST", &self.token_endpoint(), None).await?;

        // One-shot consumption up front: a code touched by a failed exchange
        // stays burned.
        let code_record = match self.storage.mark_code_used(&params.code).await? {
            CodeConsumption::Consumed(record) => record,
            CodeConsumption::AlreadyUsed(record) => {
                warn!(client_id = %record.client_id, "authorization code replayed");
                if let Some(family_id) = &record.family_id {
                    self.storage.revoke_family(family_id).await?;
                }
                return Err(OAuthError::InvalidGrant(
                    "authorization code already used".to_string(),
                ));
            }
            CodeConsumption::Missing => {
                return Err(OAuthError::InvalidGrant(
                    "unknown authorization code".to_string(),
                ));
            }
        };

        let now = self.clock.now();
        if code_record.expires_at <= now {
            return Err(OAuthError::InvalidGrant(
                "authorization code expired".to_string(),
            ));
        }
        if code_record.redirect_uri != params.redirect_uri {
            return Err(OAuthError::InvalidGrant(
                "redirect_uri does not match the authorization request".to_string(),
            ));
        }
        if code_record.client_id != params.client_id {
            return Err(OAuthError::InvalidGrant(
                "client_id does not match the authorization request".to_string(),
            ));
        }

        let metadata = self.resolver.resolve(&params.client_id).await?;
        self.authenticator.authenticate(&metadata, &params.auth).await?;

        if !verify_pkce(&params.code_verifier, &code_record.code_challenge, "S256") {
            return Err(OAuthError::InvalidGrant(
                "PKCE verification failed".to_string(),
            ));
        }

        if let Some(committed) = &code_record.dpop_jkt {
            if committed != &proof.jkt {
                return Err(OAuthError::InvalidGrant(
                    "DPoP key does not match the one committed at PAR time".to_string(),
                ));
            }
        }

        let pair = self.build_token_record(
            &code_record.sub,
            &code_record.client_id,
            code_record.scope.clone(),
            &proof.jkt,
            random_string(16),
            0,
        );
        let access_token = self.sign_access_token(&pair)?;

        self.storage.save_tokens(&pair).await?;

        // Link the consumed code to its family so a later replay of the code
        // can take the whole lineage down.
        let mut used_record = code_record;
        used_record.used = true;
        used_record.family_id = Some(pair.family_id.clone());
        self.storage.save_auth_code(&params.code, &used_record).await?;

        info!(client_id = %pair.client_id, sub = %pair.sub, "token pair issued");

        Ok(self.issued(pair, access_token))
    }

    /// §Token, `grant_type=refresh_token`.
    pub async fn refresh(
        &self,
        params: RefreshParams,
        dpop_proof: Option<&str>,
    ) -> Result<IssuedTokens, OAuthError> {
        let proof = self.verify_dpop(dpop_proof, "POST", &self.token_endpoint(), None).await?;

        let current = self
            .storage
            .get_token_by_refresh(&params.refresh_token)
            .await?
            .ok_or_else(|| OAuthError::InvalidGrant("unknown refresh token".to_string()))?;

        let now = self.clock.now();
        if current.revoked {
            return Err(OAuthError::InvalidGrant("refresh token revoked".to_string()));
        }
        if current.refresh_expires_at <= now {
            return Err(OAuthError::InvalidGrant("refresh token expired".to_string()));
        }

        if current.client_id != params.client_id {
            return Err(OAuthError::InvalidGrant(
                "client_id does not match this token family".to_string(),
            ));
        }
        let metadata = self.resolver.resolve(&params.client_id).await?;
        self.authenticator.authenticate(&metadata, &params.auth).await?;

        // cnf.jkt is immutable across the family.
        if proof.jkt != current.jkt {
            return Err(OAuthError::InvalidGrant(
                "DPoP key does not match this token family".to_string(),
            ));
        }

        let next = self.build_token_record(
            &current.sub,
            &current.client_id,
            current.scope.clone(),
            &current.jkt,
            current.family_id.clone(),
            current.generation + 1,
        );
        let access_token = self.sign_access_token(&next)?;

        match self.rotate_with_retry(&params.refresh_token, &next).await? {
            RefreshRotation::Rotated => {
                debug!(family_id = %next.family_id, generation = next.generation, "refresh token rotated");
                Ok(self.issued(next, access_token))
            }
            RefreshRotation::Replayed(old) => {
                warn!(family_id = %old.family_id, "refresh token replay; revoking family");
                self.storage.revoke_family(&old.family_id).await?;
                Err(OAuthError::InvalidGrant(
                    "refresh token has been rotated; family revoked".to_string(),
                ))
            }
            RefreshRotation::Missing => {
                Err(OAuthError::InvalidGrant("unknown refresh token".to_string()))
            }
        }
    }

    /// §Revoke: best-effort by access JWT or opaque refresh token; the whole
    /// family goes. Failures are deliberately swallowed.
    pub async fn revoke(&self, token: &str) {
        let record = match self.storage.get_token_by_refresh(token).await {
            Ok(Some(record)) => Some(record),
            Ok(None) => match unverified_jti(token) {
                Some(jti) => self.storage.get_token_by_access(&jti).await.ok().flatten(),
                None => None,
            },
            Err(e) => {
                warn!(error = %e, "revocation lookup failed");
                None
            }
        };

        if let Some(record) = record {
            if let Err(e) = self.storage.revoke_family(&record.family_id).await {
                warn!(error = %e, family_id = %record.family_id, "family revocation failed");
            } else {
                info!(family_id = %record.family_id, "token family revoked");
            }
        }
    }

    /// DPoP steps 1-10 (pure) plus step 11, the storage replay gate.
    async fn verify_dpop(
        &self,
        proof: Option<&str>,
        method: &str,
        request_uri: &str,
        access_token: Option<&str>,
    ) -> Result<VerifiedDpop, OAuthError> {
        let proof = proof.ok_or_else(|| self.map_dpop_error(DpopError::MissingProof))?;

        let verified = dpop::verify_proof(
            &self.dpop_policy,
            proof,
            method,
            request_uri,
            access_token,
            self.clock.now(),
        )
        .map_err(|e| self.map_dpop_error(e))?;

        let fresh = self
            .storage
            .check_and_save_nonce(
                &verified.jti,
                &verified.jkt,
                Duration::from_secs(self.dpop_policy.replay_ttl_seconds()),
            )
            .await
            .map_err(|e| {
                warn!(error = %e, "DPoP replay check unavailable");
                self.map_dpop_error(DpopError::ReplayCheckFailed)
            })?;

        if !fresh {
            return Err(self.map_dpop_error(DpopError::Replayed));
        }

        Ok(verified)
    }

    fn map_dpop_error(&self, e: DpopError) -> OAuthError {
        match e {
            DpopError::NonceMismatch => OAuthError::UseDpopNonce {
                nonce: self
                    .dpop_policy
                    .expected_nonce
                    .clone()
                    .unwrap_or_default(),
            },
            other => OAuthError::InvalidDpopProof(other.to_string()),
        }
    }

    fn build_token_record(
        &self,
        sub: &str,
        client_id: &str,
        scope: Option<String>,
        jkt: &str,
        family_id: String,
        generation: u32,
    ) -> TokenRecord {
        let now = self.clock.now();
        TokenRecord {
            access_jti: Uuid::new_v4().to_string(),
            refresh_token: random_string(32),
            sub: sub.to_string(),
            client_id: client_id.to_string(),
            scope,
            jkt: jkt.to_string(),
            family_id,
            generation,
            issued_at: now,
            access_expires_at: now
                + ChronoDuration::seconds(self.access_tokens.ttl_seconds() as i64),
            refresh_expires_at: now + ChronoDuration::seconds(self.refresh_ttl_seconds as i64),
            revoked: false,
        }
    }

    fn sign_access_token(&self, pair: &TokenRecord) -> Result<String, OAuthError> {
        self.access_tokens.issue(
            &pair.sub,
            &pair.client_id,
            pair.scope.as_deref(),
            &pair.jkt,
            &pair.access_jti,
            pair.issued_at,
        )
    }

    fn issued(&self, pair: TokenRecord, access_token: String) -> IssuedTokens {
        IssuedTokens {
            access_token,
            token_type: "DPoP",
            expires_in: self.access_tokens.ttl_seconds(),
            refresh_token: pair.refresh_token,
            scope: pair.scope,
            sub: pair.sub,
        }
    }

    /// One internal retry on a lost CAS race, then the failure surfaces.
    async fn rotate_with_retry(
        &self,
        old_refresh: &str,
        next: &TokenRecord,
    ) -> Result<RefreshRotation, OAuthError> {
        match self.storage.rotate_refresh(old_refresh, next).await {
            Err(StorageError::Conflict) => {
                debug!("refresh rotation conflict; retrying once");
                Ok(self.storage.rotate_refresh(old_refresh, next).await?)
            }
            other => Ok(other?),
        }
    }
}

/// Append response parameters to the registered redirect URI.
fn authorize_redirect(redirect_uri: &str, pairs: &[(&str, &str)]) -> Result<String, OAuthError> {
    let mut url = url::Url::parse(redirect_uri)
        .map_err(|_| OAuthError::InvalidRequest("stored redirect_uri is invalid".to_string()))?;

    for (key, value) in pairs {
        url.query_pairs_mut().append_pair(key, value);
    }

    Ok(url.to_string())
}

/// Claims-only peek at a JWT for revocation lookup. The storage hit that
/// follows is what actually authorizes the revocation.
fn unverified_jti(token: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct JtiOnly {
        jti: String,
    }

    let mut parts = token.split('.');
    let payload = parts.nth(1)?;
    if parts.count() != 1 {
        return None;
    }

    let bytes = base64url_decode(payload)?;
    serde_json::from_slice::<JtiOnly>(&bytes)
        .ok()
        .map(|c| c.jti)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_url_encodes_parameters() {
        let url = authorize_redirect(
            "https://app.example.com/callback",
            &[("code", "a b"), ("state", "x&y")],
        )
        .unwrap();

        assert!(url.starts_with("https://app.example.com/callback?"));
        assert!(url.contains("code=a+b"));
        assert!(url.contains("state=x%26y"));
    }

    #[test]
    fn unverified_jti_reads_well_formed_jwts_only() {
        use crate::services::encoding::base64url_encode;

        let payload = base64url_encode(br#"{"jti":"id-1"}"#);
        let token = format!("{}.{}.{}", "aGVhZGVy", payload, "c2ln");
        assert_eq!(unverified_jti(&token).as_deref(), Some("id-1"));

        assert!(unverified_jti("opaque-refresh-token").is_none());
        assert!(unverified_jti("a.b").is_none());
    }
}
