use serde::{Deserialize, Serialize};

/// Form body for `POST /oauth/par`.
///
/// Everything is optional at the serde layer; the handler reports missing
/// required parameters as `invalid_request` instead of a framework 422.
#[derive(Debug, Clone, Deserialize)]
pub struct ParRequest {
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub response_type: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub state: Option<String>,
    pub scope: Option<String>,
    pub login_hint: Option<String>,
    /// Thumbprint pre-commitment for the eventual DPoP-bound tokens.
    pub dpop_jkt: Option<String>,
    pub client_assertion_type: Option<String>,
    pub client_assertion: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParResponse {
    pub request_uri: String,
    pub expires_in: i64,
}
