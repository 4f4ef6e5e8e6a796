//! Host consent seam.
//!
//! Rendering the approval page and authenticating the account holder belong
//! to the host application; the state machine only needs the outcome.

use async_trait::async_trait;

use crate::services::clients::metadata::ClientMetadata;
use crate::storage::ParRecord;

#[derive(Debug, Clone)]
pub enum ConsentDecision {
    /// The account holder approved the request; `sub` is their DID.
    Approved { sub: String },
    Denied,
}

#[async_trait]
pub trait ConsentProvider: Send + Sync {
    async fn decide(&self, client: &ClientMetadata, request: &ParRecord) -> ConsentDecision;
}

/// Fixed-outcome provider: approves every request as one configured subject,
/// or denies everything when none is set. Suitable for development and tests
/// only; real hosts drive a login + approval flow.
pub struct StaticConsent {
    sub: Option<String>,
}

impl StaticConsent {
    pub fn approve_as(sub: impl Into<String>) -> Self {
        Self {
            sub: Some(sub.into()),
        }
    }

    pub fn deny_all() -> Self {
        Self { sub: None }
    }
}

#[async_trait]
impl ConsentProvider for StaticConsent {
    async fn decide(&self, _client: &ClientMetadata, _request: &ParRecord) -> ConsentDecision {
        match &self.sub {
            Some(sub) => ConsentDecision::Approved { sub: sub.clone() },
            None => ConsentDecision::Denied,
        }
    }
}
