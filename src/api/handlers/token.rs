use axum::Json;
use axum::extract::{Form, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};

use crate::api::dto::token::{TokenRequest, TokenResponse};
use crate::api::handlers::{attach_dpop_nonce, require};
use crate::error::OAuthError;
use crate::services::clients::ClientAuthParams;
use crate::services::oauth::{CodeExchangeParams, IssuedTokens, RefreshParams};
use crate::state::AppState;

pub async fn token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(req): Form<TokenRequest>,
) -> Result<Response, OAuthError> {
    let dpop_proof = headers.get("DPoP").and_then(|v| v.to_str().ok());

    let auth = ClientAuthParams {
        client_assertion_type: req.client_assertion_type,
        client_assertion: req.client_assertion,
    };

    let issued = match req.grant_type.as_deref() {
        Some("authorization_code") => {
            let params = CodeExchangeParams {
                code: require(req.code, "code")?,
                redirect_uri: require(req.redirect_uri, "redirect_uri")?,
                code_verifier: require(req.code_verifier, "code_verifier")?,
                client_id: require(req.client_id, "client_id")?,
                auth,
            };
            state.oauth.exchange_code(params, dpop_proof).await?
        }
        Some("refresh_token") => {
            let params = RefreshParams {
                refresh_token: require(req.refresh_token, "refresh_token")?,
                client_id: require(req.client_id, "client_id")?,
                auth,
            };
            state.oauth.refresh(params, dpop_proof).await?
        }
        _ => return Err(OAuthError::UnsupportedGrantType),
    };

    Ok(token_response(&state, issued))
}

fn token_response(state: &AppState, issued: IssuedTokens) -> Response {
    let mut response = Json(TokenResponse {
        access_token: issued.access_token,
        token_type: issued.token_type.to_string(),
        expires_in: issued.expires_in,
        refresh_token: issued.refresh_token,
        scope: issued.scope,
        sub: issued.sub,
    })
    .into_response();
    attach_dpop_nonce(state, &mut response);
    response
}
