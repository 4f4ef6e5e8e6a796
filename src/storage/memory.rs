//! In-process storage for tests and single-node development.
//!
//! All primitives are linearized by one mutex, which trivially satisfies the
//! atomicity contract. Never held across an await point.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::services::clients::metadata::ClientMetadata;
use crate::storage::{
    AuthCodeRecord, CodeConsumption, ParRecord, RefreshRotation, Storage, StorageResult,
    TokenRecord,
};

#[derive(Default)]
struct FamilyState {
    current_generation: u32,
    revoked: bool,
}

#[derive(Default)]
struct Inner {
    clients: HashMap<String, ClientMetadata>,
    pars: HashMap<String, ParRecord>,
    codes: HashMap<String, AuthCodeRecord>,
    /// Keyed by refresh token; old generations stay around so replays are
    /// detectable after rotation.
    tokens: HashMap<String, TokenRecord>,
    access_index: HashMap<String, String>,
    families: HashMap<String, FamilyState>,
    nonces: HashMap<(String, String), Instant>,
}

#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_client(&self, client_id: &str) -> StorageResult<Option<ClientMetadata>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.clients.get(client_id).cloned())
    }

    async fn save_client(&self, client_id: &str, metadata: &ClientMetadata) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .clients
            .insert(client_id.to_string(), metadata.clone());
        Ok(())
    }

    async fn save_par(
        &self,
        request_uri: &str,
        record: &ParRecord,
        _ttl: Duration,
    ) -> StorageResult<()> {
        // Expiry is enforced by the caller against `record.expires_at`.
        let mut inner = self.inner.lock().unwrap();
        inner.pars.insert(request_uri.to_string(), record.clone());
        Ok(())
    }

    async fn consume_par(
        &self,
        request_uri: &str,
        client_id: &str,
    ) -> StorageResult<Option<ParRecord>> {
        let mut inner = self.inner.lock().unwrap();
        match inner.pars.remove(request_uri) {
            Some(record) if record.client_id == client_id => Ok(Some(record)),
            _ => Ok(None),
        }
    }

    async fn save_auth_code(&self, code: &str, record: &AuthCodeRecord) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.codes.insert(code.to_string(), record.clone());
        Ok(())
    }

    async fn mark_code_used(&self, code: &str) -> StorageResult<CodeConsumption> {
        let mut inner = self.inner.lock().unwrap();
        match inner.codes.get_mut(code) {
            None => Ok(CodeConsumption::Missing),
            Some(record) if record.used => Ok(CodeConsumption::AlreadyUsed(record.clone())),
            Some(record) => {
                let snapshot = record.clone();
                record.used = true;
                Ok(CodeConsumption::Consumed(snapshot))
            }
        }
    }

    async fn save_tokens(&self, pair: &TokenRecord) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .access_index
            .insert(pair.access_jti.clone(), pair.refresh_token.clone());
        inner
            .families
            .entry(pair.family_id.clone())
            .or_insert_with(|| FamilyState {
                current_generation: pair.generation,
                revoked: false,
            });
        inner.tokens.insert(pair.refresh_token.clone(), pair.clone());
        Ok(())
    }

    async fn get_token_by_access(&self, access_jti: &str) -> StorageResult<Option<TokenRecord>> {
        let inner = self.inner.lock().unwrap();
        let Some(refresh) = inner.access_index.get(access_jti) else {
            return Ok(None);
        };
        Ok(inner.tokens.get(refresh).cloned())
    }

    async fn get_token_by_refresh(
        &self,
        refresh_token: &str,
    ) -> StorageResult<Option<TokenRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.tokens.get(refresh_token).cloned())
    }

    async fn rotate_refresh(
        &self,
        old_refresh: &str,
        next: &TokenRecord,
    ) -> StorageResult<RefreshRotation> {
        let mut inner = self.inner.lock().unwrap();

        let Some(old) = inner.tokens.get(old_refresh).cloned() else {
            return Ok(RefreshRotation::Missing);
        };

        let current_generation = inner
            .families
            .get(&old.family_id)
            .map(|f| f.current_generation)
            .unwrap_or(old.generation);

        if old.generation < current_generation {
            return Ok(RefreshRotation::Replayed(old));
        }

        if let Some(family) = inner.families.get_mut(&next.family_id) {
            family.current_generation = next.generation;
        }
        inner
            .access_index
            .insert(next.access_jti.clone(), next.refresh_token.clone());
        inner.tokens.insert(next.refresh_token.clone(), next.clone());

        Ok(RefreshRotation::Rotated)
    }

    async fn revoke_token(&self, refresh_token: &str) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.tokens.get_mut(refresh_token) {
            record.revoked = true;
        }
        Ok(())
    }

    async fn revoke_family(&self, family_id: &str) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(family) = inner.families.get_mut(family_id) {
            family.revoked = true;
        }
        for record in inner.tokens.values_mut() {
            if record.family_id == family_id {
                record.revoked = true;
            }
        }
        Ok(())
    }

    async fn check_and_save_nonce(
        &self,
        jti: &str,
        jkt: &str,
        ttl: Duration,
    ) -> StorageResult<bool> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();

        inner.nonces.retain(|_, deadline| *deadline > now);

        let key = (jti.to_string(), jkt.to_string());
        if inner.nonces.contains_key(&key) {
            return Ok(false);
        }
        inner.nonces.insert(key, now + ttl);
        Ok(true)
    }
}
