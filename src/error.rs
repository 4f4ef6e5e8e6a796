use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::HeaderName},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::storage::StorageError;

/// User-facing OAuth failure.
///
/// Every variant maps to a stable wire code per RFC 6749 / RFC 9449. The
/// message becomes `error_description` and must not contain secrets.
#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    InvalidClient(String),

    #[error("{0}")]
    InvalidGrant(String),

    #[error("unsupported grant_type")]
    UnsupportedGrantType,

    #[error("unsupported response_type")]
    UnsupportedResponseType,

    #[error("{0}")]
    InvalidDpopProof(String),

    /// The proof carried a missing or stale nonce. The response MUST carry a
    /// fresh `DPoP-Nonce` header so the client can retry.
    #[error("DPoP nonce required")]
    UseDpopNonce { nonce: String },
}

impl OAuthError {
    pub fn wire_code(&self) -> &'static str {
        match self {
            OAuthError::InvalidRequest(_) => "invalid_request",
            OAuthError::InvalidClient(_) => "invalid_client",
            OAuthError::InvalidGrant(_) => "invalid_grant",
            OAuthError::UnsupportedGrantType => "unsupported_grant_type",
            OAuthError::UnsupportedResponseType => "unsupported_response_type",
            OAuthError::InvalidDpopProof(_) => "invalid_dpop_proof",
            OAuthError::UseDpopNonce { .. } => "use_dpop_nonce",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            OAuthError::InvalidRequest(_)
            | OAuthError::InvalidGrant(_)
            | OAuthError::UnsupportedGrantType
            | OAuthError::UnsupportedResponseType => StatusCode::BAD_REQUEST,
            OAuthError::InvalidClient(_)
            | OAuthError::InvalidDpopProof(_)
            | OAuthError::UseDpopNonce { .. } => StatusCode::UNAUTHORIZED,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_description: Option<String>,
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.wire_code();

        let description = match &self {
            OAuthError::UnsupportedGrantType | OAuthError::UnsupportedResponseType => None,
            other => Some(other.to_string()),
        };

        let body = ErrorBody {
            error: code,
            error_description: description,
        };

        let mut response = (status, Json(body)).into_response();

        if let OAuthError::UseDpopNonce { nonce } = &self {
            if let Ok(value) = HeaderValue::from_str(nonce) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static("dpop-nonce"), value);
            }
        }

        response
    }
}

impl From<StorageError> for OAuthError {
    fn from(e: StorageError) -> Self {
        // Backend detail stays out of the wire body.
        tracing::error!(error = %e, "storage failure");
        OAuthError::InvalidRequest("temporarily unable to process request".to_string())
    }
}
