pub mod authorize;
pub mod metadata;
pub mod par;
pub mod revoke;
pub mod token;

use axum::http::{HeaderValue, header::HeaderName};
use axum::response::Response;

use crate::error::OAuthError;
use crate::state::AppState;

/// Missing required form/query parameter -> `invalid_request`.
fn require(value: Option<String>, name: &str) -> Result<String, OAuthError> {
    value.ok_or_else(|| OAuthError::InvalidRequest(format!("{name} is required")))
}

/// Advertise the server DPoP nonce on success responses when configured, so
/// clients can bind their next proof without a 401 round-trip.
fn attach_dpop_nonce(state: &AppState, response: &mut Response) {
    if let Some(nonce) = state.oauth.dpop_nonce() {
        if let Ok(value) = HeaderValue::from_str(nonce) {
            response
                .headers_mut()
                .insert(HeaderName::from_static("dpop-nonce"), value);
        }
    }
}
