//! DPoP-bound access-token verification for protected routes.
//!
//! The XRPC router itself lives with the host; this layer is what it mounts
//! in front of protected endpoints. It checks the `Authorization: DPoP`
//! access token (signature, revocation, `cnf.jkt`) and the accompanying
//! DPoP proof (`htm`/`htu`/`ath`, replay), then hands the request an
//! `AuthCtx`.

use std::time::Duration;

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{Request, header},
    middleware::{self, Next},
    response::Response,
};
use tracing::warn;

use crate::error::OAuthError;
use crate::services::dpop::{self, DpopError};
use crate::state::AppState;

/// Request identity established by the middleware, retrievable by handlers
/// via `axum::Extension<AuthCtx>`.
#[derive(Debug, Clone)]
pub struct AuthCtx {
    pub did: String,
    pub client_id: String,
    pub scope: Option<String>,
    pub jkt: String,
}

/// Wrap `router` so every route requires a DPoP-bound access token.
pub fn apply(router: Router<AppState>, state: AppState) -> Router<AppState> {
    router.layer(middleware::from_fn_with_state(state, access_middleware))
}

async fn access_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, OAuthError> {
    let authorization = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| dpop_failure(&state, DpopError::MissingProof))?;

    // Sender-constrained tokens use the DPoP scheme, not Bearer.
    let token = authorization.strip_prefix("DPoP ").ok_or_else(|| {
        OAuthError::InvalidDpopProof("expected DPoP authorization scheme".to_string())
    })?;

    let claims = state.access_tokens.verify(token).map_err(|e| {
        warn!(error = %e, "access token verification failed");
        OAuthError::InvalidDpopProof("access token rejected".to_string())
    })?;

    // Stateless validity is not enough: the family may have been revoked.
    let record = state
        .storage
        .get_token_by_access(&claims.jti)
        .await?
        .ok_or_else(|| OAuthError::InvalidDpopProof("access token unknown".to_string()))?;
    if record.revoked {
        return Err(OAuthError::InvalidDpopProof("access token revoked".to_string()));
    }

    let expected_jkt = claims
        .cnf
        .as_ref()
        .and_then(|c| c.jkt.as_deref())
        .ok_or_else(|| OAuthError::InvalidDpopProof("access token is not DPoP-bound".to_string()))?;

    let proof = req
        .headers()
        .get("DPoP")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| dpop_failure(&state, DpopError::MissingProof))?;

    let request_url = format!("{}{}", state.public_url, req.uri().path());
    let verified = dpop::verify_proof(
        &state.dpop_policy,
        proof,
        req.method().as_str(),
        &request_url,
        Some(token),
        chrono::Utc::now(),
    )
    .map_err(|e| dpop_failure(&state, e))?;

    if verified.jkt != expected_jkt {
        return Err(OAuthError::InvalidDpopProof(
            "proof key does not match cnf.jkt".to_string(),
        ));
    }

    let fresh = state
        .storage
        .check_and_save_nonce(
            &verified.jti,
            &verified.jkt,
            Duration::from_secs(state.dpop_policy.replay_ttl_seconds()),
        )
        .await
        .map_err(|e| {
            warn!(error = %e, "DPoP replay check unavailable");
            dpop_failure(&state, DpopError::ReplayCheckFailed)
        })?;
    if !fresh {
        return Err(dpop_failure(&state, DpopError::Replayed));
    }

    let auth_ctx = AuthCtx {
        did: claims.sub,
        client_id: claims.client_id,
        scope: claims.scope,
        jkt: verified.jkt,
    };
    req.extensions_mut().insert(auth_ctx);

    Ok(next.run(req).await)
}

fn dpop_failure(state: &AppState, e: DpopError) -> OAuthError {
    match e {
        DpopError::NonceMismatch => OAuthError::UseDpopNonce {
            nonce: state
                .dpop_policy
                .expected_nonce
                .clone()
                .unwrap_or_default(),
        },
        other => OAuthError::InvalidDpopProof(other.to_string()),
    }
}
