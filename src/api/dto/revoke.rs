use serde::{Deserialize, Serialize};

/// Form body for `POST /oauth/revoke`.
#[derive(Debug, Clone, Deserialize)]
pub struct RevokeRequest {
    pub token: Option<String>,
    /// Accepted and ignored; lookup tries both token kinds anyway.
    pub token_type_hint: Option<String>,
}

/// Revocation always answers 200 with an empty object.
#[derive(Debug, Clone, Serialize)]
pub struct RevokeResponse {}
