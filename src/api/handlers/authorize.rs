use axum::extract::{Query, State};
use axum::http::{StatusCode, header::LOCATION};
use axum::response::{IntoResponse, Response};

use crate::api::dto::authorize::AuthorizeQuery;
use crate::api::handlers::require;
use crate::error::OAuthError;
use crate::state::AppState;

/// The host's consent hook decides the outcome; either way the response is a
/// 302 back to the client's registered redirect URI.
pub async fn authorize(
    State(state): State<AppState>,
    Query(query): Query<AuthorizeQuery>,
) -> Result<Response, OAuthError> {
    let client_id = require(query.client_id, "client_id")?;
    let request_uri = require(query.request_uri, "request_uri")?;

    let location = state
        .oauth
        .authorize(&client_id, &request_uri, state.consent.as_ref())
        .await?;

    Ok((StatusCode::FOUND, [(LOCATION, location)]).into_response())
}
