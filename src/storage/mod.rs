//! Durable state behind the authorization server.
//!
//! Every replay guarantee in the state machine (DPoP `jti`, one-shot PAR and
//! authorization codes, refresh rotation) reduces to one atomic primitive
//! here. Implementations must linearize those primitives per key; everything
//! else is plain read/write.

pub mod memory;
pub mod valkey;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::services::clients::metadata::ClientMetadata;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("storage encoding error: {0}")]
    Encoding(String),

    /// Lost a compare-and-swap race. Callers retry once, then give up.
    #[error("storage conflict")]
    Conflict,
}

impl From<redis::RedisError> for StorageError {
    fn from(e: redis::RedisError) -> Self {
        StorageError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Encoding(e.to_string())
    }
}

/// Parameters pushed ahead of authorization (RFC 9126), keyed by
/// `urn:ietf:params:oauth:request_uri:<id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParRecord {
    pub client_id: String,
    pub redirect_uri: String,
    pub response_type: String,
    pub code_challenge: String,
    pub code_challenge_method: String,
    pub state: String,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub login_hint: Option<String>,
    /// DPoP key thumbprint the client pre-committed for the eventual tokens.
    #[serde(default)]
    pub dpop_jkt: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// A user approval bound to one client, exchangeable exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthCodeRecord {
    pub client_id: String,
    pub redirect_uri: String,
    pub code_challenge: String,
    #[serde(default)]
    pub scope: Option<String>,
    /// Subject DID supplied by the host at consent time.
    pub sub: String,
    /// DPoP key thumbprint the client committed to at PAR time, if any.
    #[serde(default)]
    pub dpop_jkt: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    /// Token family issued from this code. Set on first exchange so a
    /// replayed exchange can revoke everything derived from it.
    #[serde(default)]
    pub family_id: Option<String>,
}

/// One issued access + refresh pair. Successive rotations share `family_id`
/// and increment `generation`; `jkt` never changes within a family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_jti: String,
    pub refresh_token: String,
    pub sub: String,
    pub client_id: String,
    #[serde(default)]
    pub scope: Option<String>,
    pub jkt: String,
    pub family_id: String,
    pub generation: u32,
    pub issued_at: DateTime<Utc>,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub revoked: bool,
}

#[derive(Debug)]
pub enum CodeConsumption {
    /// First consumption; the returned record was not yet marked used.
    Consumed(AuthCodeRecord),
    /// The code was already exchanged. Carries the stored record so the
    /// caller can revoke the family issued from it.
    AlreadyUsed(AuthCodeRecord),
    Missing,
}

#[derive(Debug)]
pub enum RefreshRotation {
    Rotated,
    /// The presented refresh token was already rotated away; the whole
    /// family must be revoked by the caller.
    Replayed(TokenRecord),
    Missing,
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_client(&self, client_id: &str) -> StorageResult<Option<ClientMetadata>>;
    async fn save_client(&self, client_id: &str, metadata: &ClientMetadata) -> StorageResult<()>;

    async fn save_par(
        &self,
        request_uri: &str,
        record: &ParRecord,
        ttl: Duration,
    ) -> StorageResult<()>;

    /// Atomic delete-on-read. Returns `None` when the record is absent or its
    /// stored `client_id` differs from the presented one; either way the
    /// record is gone afterwards (one-shot semantics).
    async fn consume_par(
        &self,
        request_uri: &str,
        client_id: &str,
    ) -> StorageResult<Option<ParRecord>>;

    async fn save_auth_code(&self, code: &str, record: &AuthCodeRecord) -> StorageResult<()>;

    /// Atomically flip the code's `used` flag. At most one caller ever
    /// observes `Consumed` for a given code.
    async fn mark_code_used(&self, code: &str) -> StorageResult<CodeConsumption>;

    async fn save_tokens(&self, pair: &TokenRecord) -> StorageResult<()>;
    async fn get_token_by_access(&self, access_jti: &str) -> StorageResult<Option<TokenRecord>>;
    async fn get_token_by_refresh(&self, refresh_token: &str)
    -> StorageResult<Option<TokenRecord>>;

    /// Compare-and-swap rotation: succeeds iff `old_refresh` still holds the
    /// family's current generation. `next` must carry the same family with
    /// the incremented generation.
    async fn rotate_refresh(
        &self,
        old_refresh: &str,
        next: &TokenRecord,
    ) -> StorageResult<RefreshRotation>;

    async fn revoke_token(&self, refresh_token: &str) -> StorageResult<()>;
    async fn revoke_family(&self, family_id: &str) -> StorageResult<()>;

    /// Replay filter for DPoP proofs and client assertion `jti`s.
    ///
    /// Returns `true` when `(jti, jkt)` was stored for the first time and
    /// `false` when it was already seen within `ttl`. Backend failures are
    /// errors so callers fail closed.
    async fn check_and_save_nonce(
        &self,
        jti: &str,
        jkt: &str,
        ttl: Duration,
    ) -> StorageResult<bool>;
}
