//! Valkey/Redis-backed storage (production single-region deployments).
//!
//! Replay-sensitive primitives map onto atomic server-side operations:
//! `SET NX EX` for nonces and code consumption, `GETDEL` for one-shot PAR
//! records, and a small Lua script for refresh rotation. Opaque refresh
//! tokens are stored only as SHA-256 hashes.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::services::clients::metadata::ClientMetadata;
use crate::services::encoding::base64url_encode;
use crate::storage::{
    AuthCodeRecord, CodeConsumption, ParRecord, RefreshRotation, Storage, StorageError,
    StorageResult, TokenRecord,
};

/// How long consumed authorization codes stay visible for replay detection.
const CODE_REPLAY_WINDOW_SECS: u64 = 24 * 3600;

const CLIENT_CACHE_SECS: u64 = 24 * 3600;

/// Family rotation CAS. KEYS: old token, family doc, new token, new access
/// index. ARGV: new record JSON, family doc JSON, ttl secs, new token hash.
/// Returns "missing", "rotated", or the stored record JSON on replay.
const ROTATE_SCRIPT: &str = r#"
local old = redis.call('GET', KEYS[1])
if not old then return 'missing' end
local rec = cjson.decode(old)
local current = rec['generation']
local fam_raw = redis.call('GET', KEYS[2])
if fam_raw then
  local fam = cjson.decode(fam_raw)
  if fam['revoked'] then return 'missing' end
  current = fam['current_generation']
end
if rec['generation'] < current then return old end
redis.call('SET', KEYS[2], ARGV[2], 'EX', ARGV[3])
redis.call('SET', KEYS[3], ARGV[1], 'EX', ARGV[3])
redis.call('SET', KEYS[4], ARGV[4], 'EX', ARGV[3])
return 'rotated'
"#;

#[derive(serde::Serialize, serde::Deserialize)]
struct FamilyDoc {
    current_generation: u32,
    revoked: bool,
}

#[derive(Clone)]
pub struct ValkeyStorage {
    manager: redis::aio::ConnectionManager,
    prefix: String,
}

impl ValkeyStorage {
    pub async fn new(url: &str) -> StorageResult<Self> {
        Self::new_with_prefix(url, "oauth").await
    }

    pub async fn new_with_prefix(url: &str, prefix: impl Into<String>) -> StorageResult<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;

        Ok(Self {
            manager,
            prefix: prefix.into(),
        })
    }

    fn key(&self, kind: &str, raw: &str) -> String {
        format!("{}:{}:{}", self.prefix, kind, raw)
    }

    fn refresh_hash(token: &str) -> String {
        base64url_encode(&Sha256::digest(token.as_bytes()))
    }

    fn token_ttl_secs(record: &TokenRecord) -> u64 {
        (record.refresh_expires_at - Utc::now()).num_seconds().max(1) as u64
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> StorageResult<Option<T>> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set_json<T: serde::Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl_secs: Option<u64>,
    ) -> StorageResult<()> {
        let mut conn = self.manager.clone();
        let raw = serde_json::to_string(value)?;

        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(raw);
        if let Some(ttl) = ttl_secs {
            cmd.arg("EX").arg(ttl.max(1));
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    /// Read a token record and fold in family-level revocation.
    async fn load_token(&self, refresh_hash: &str) -> StorageResult<Option<TokenRecord>> {
        let Some(mut record) = self
            .get_json::<TokenRecord>(&self.key("token", refresh_hash))
            .await?
        else {
            return Ok(None);
        };

        if let Some(family) = self
            .get_json::<FamilyDoc>(&self.key("family", &record.family_id))
            .await?
        {
            record.revoked = record.revoked || family.revoked;
        }

        Ok(Some(record))
    }

    async fn save_family(&self, family_id: &str, doc: &FamilyDoc, ttl_secs: u64) -> StorageResult<()> {
        self.set_json(&self.key("family", family_id), doc, Some(ttl_secs))
            .await
    }
}

#[async_trait]
impl Storage for ValkeyStorage {
    async fn get_client(&self, client_id: &str) -> StorageResult<Option<ClientMetadata>> {
        self.get_json(&self.key("client", client_id)).await
    }

    async fn save_client(&self, client_id: &str, metadata: &ClientMetadata) -> StorageResult<()> {
        self.set_json(&self.key("client", client_id), metadata, Some(CLIENT_CACHE_SECS))
            .await
    }

    async fn save_par(
        &self,
        request_uri: &str,
        record: &ParRecord,
        ttl: Duration,
    ) -> StorageResult<()> {
        self.set_json(&self.key("par", request_uri), record, Some(ttl.as_secs()))
            .await
    }

    async fn consume_par(
        &self,
        request_uri: &str,
        client_id: &str,
    ) -> StorageResult<Option<ParRecord>> {
        let mut conn = self.manager.clone();

        // GETDEL makes retrieval one-shot regardless of the outcome below.
        let raw: Option<String> = redis::cmd("GETDEL")
            .arg(self.key("par", request_uri))
            .query_async(&mut conn)
            .await?;

        let Some(raw) = raw else { return Ok(None) };
        let record: ParRecord = serde_json::from_str(&raw)?;

        if record.client_id != client_id {
            return Ok(None);
        }
        Ok(Some(record))
    }

    async fn save_auth_code(&self, code: &str, record: &AuthCodeRecord) -> StorageResult<()> {
        self.set_json(
            &self.key("code", code),
            record,
            Some(CODE_REPLAY_WINDOW_SECS),
        )
        .await
    }

    async fn mark_code_used(&self, code: &str) -> StorageResult<CodeConsumption> {
        let mut conn = self.manager.clone();

        let Some(record) = self
            .get_json::<AuthCodeRecord>(&self.key("code", code))
            .await?
        else {
            return Ok(CodeConsumption::Missing);
        };

        // SET NX is the used-flag: exactly one caller wins the marker.
        let fresh: Option<String> = redis::cmd("SET")
            .arg(self.key("code_used", code))
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(CODE_REPLAY_WINDOW_SECS)
            .query_async(&mut conn)
            .await?;

        if fresh.is_some() && !record.used {
            Ok(CodeConsumption::Consumed(record))
        } else {
            Ok(CodeConsumption::AlreadyUsed(record))
        }
    }

    async fn save_tokens(&self, pair: &TokenRecord) -> StorageResult<()> {
        let ttl = Self::token_ttl_secs(pair);
        let hash = Self::refresh_hash(&pair.refresh_token);

        self.set_json(&self.key("token", &hash), pair, Some(ttl)).await?;

        let mut conn = self.manager.clone();
        let _: () = redis::cmd("SET")
            .arg(self.key("access", &pair.access_jti))
            .arg(&hash)
            .arg("EX")
            .arg(ttl)
            .query_async(&mut conn)
            .await?;

        self.save_family(
            &pair.family_id,
            &FamilyDoc {
                current_generation: pair.generation,
                revoked: false,
            },
            ttl,
        )
        .await
    }

    async fn get_token_by_access(&self, access_jti: &str) -> StorageResult<Option<TokenRecord>> {
        let mut conn = self.manager.clone();
        let hash: Option<String> = redis::cmd("GET")
            .arg(self.key("access", access_jti))
            .query_async(&mut conn)
            .await?;

        match hash {
            Some(hash) => self.load_token(&hash).await,
            None => Ok(None),
        }
    }

    async fn get_token_by_refresh(
        &self,
        refresh_token: &str,
    ) -> StorageResult<Option<TokenRecord>> {
        self.load_token(&Self::refresh_hash(refresh_token)).await
    }

    async fn rotate_refresh(
        &self,
        old_refresh: &str,
        next: &TokenRecord,
    ) -> StorageResult<RefreshRotation> {
        let mut conn = self.manager.clone();

        let ttl = Self::token_ttl_secs(next);
        let next_hash = Self::refresh_hash(&next.refresh_token);
        let family_doc = serde_json::to_string(&FamilyDoc {
            current_generation: next.generation,
            revoked: false,
        })?;

        let outcome: String = redis::cmd("EVAL")
            .arg(ROTATE_SCRIPT)
            .arg(4)
            .arg(self.key("token", &Self::refresh_hash(old_refresh)))
            .arg(self.key("family", &next.family_id))
            .arg(self.key("token", &next_hash))
            .arg(self.key("access", &next.access_jti))
            .arg(serde_json::to_string(next)?)
            .arg(family_doc)
            .arg(ttl)
            .arg(&next_hash)
            .query_async(&mut conn)
            .await?;

        match outcome.as_str() {
            "rotated" => Ok(RefreshRotation::Rotated),
            "missing" => Ok(RefreshRotation::Missing),
            raw => {
                let old: TokenRecord = serde_json::from_str(raw)
                    .map_err(|e| StorageError::Encoding(e.to_string()))?;
                Ok(RefreshRotation::Replayed(old))
            }
        }
    }

    async fn revoke_token(&self, refresh_token: &str) -> StorageResult<()> {
        let hash = Self::refresh_hash(refresh_token);
        let Some(mut record) = self.get_json::<TokenRecord>(&self.key("token", &hash)).await?
        else {
            return Ok(());
        };

        record.revoked = true;
        let ttl = Self::token_ttl_secs(&record);
        self.set_json(&self.key("token", &hash), &record, Some(ttl)).await
    }

    async fn revoke_family(&self, family_id: &str) -> StorageResult<()> {
        // Revocation is observed through the family doc join on every token
        // read, so a single write covers all generations.
        let current = self
            .get_json::<FamilyDoc>(&self.key("family", family_id))
            .await?
            .map(|f| f.current_generation)
            .unwrap_or(0);

        self.save_family(
            family_id,
            &FamilyDoc {
                current_generation: current,
                revoked: true,
            },
            CODE_REPLAY_WINDOW_SECS,
        )
        .await
    }

    async fn check_and_save_nonce(
        &self,
        jti: &str,
        jkt: &str,
        ttl: Duration,
    ) -> StorageResult<bool> {
        let mut conn = self.manager.clone();

        // SET <key> "1" NX EX <ttl>: true when newly set, false on replay.
        let resp: Option<String> = redis::cmd("SET")
            .arg(self.key("replay", &format!("{jkt}:{jti}")))
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;

        Ok(resp.is_some())
    }
}
