use axum::Json;
use axum::extract::{Form, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::api::dto::par::{ParRequest, ParResponse};
use crate::api::handlers::{attach_dpop_nonce, require};
use crate::error::OAuthError;
use crate::services::clients::ClientAuthParams;
use crate::services::oauth::ParParams;
use crate::state::AppState;

pub async fn pushed_authorization_request(
    State(state): State<AppState>,
    Form(req): Form<ParRequest>,
) -> Result<Response, OAuthError> {
    let params = ParParams {
        client_id: require(req.client_id, "client_id")?,
        redirect_uri: require(req.redirect_uri, "redirect_uri")?,
        response_type: require(req.response_type, "response_type")?,
        code_challenge: require(req.code_challenge, "code_challenge")?,
        code_challenge_method: require(req.code_challenge_method, "code_challenge_method")?,
        state: require(req.state, "state")?,
        scope: req.scope,
        login_hint: req.login_hint,
        dpop_jkt: req.dpop_jkt,
        auth: ClientAuthParams {
            client_assertion_type: req.client_assertion_type,
            client_assertion: req.client_assertion,
        },
    };

    let outcome = state.oauth.pushed_authorization_request(params).await?;

    let mut response = (
        StatusCode::CREATED,
        Json(ParResponse {
            request_uri: outcome.request_uri,
            expires_in: outcome.expires_in,
        }),
    )
        .into_response();
    attach_dpop_nonce(&state, &mut response);

    Ok(response)
}
