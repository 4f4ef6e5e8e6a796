use axum::Json;
use axum::extract::{Form, State};

use crate::api::dto::revoke::{RevokeRequest, RevokeResponse};
use crate::state::AppState;

/// Best-effort by design (RFC 7009): the caller learns nothing about whether
/// the token existed.
pub async fn revoke(
    State(state): State<AppState>,
    Form(req): Form<RevokeRequest>,
) -> Json<RevokeResponse> {
    if let Some(token) = req.token.as_deref() {
        state.oauth.revoke(token).await;
    }

    Json(RevokeResponse {})
}
