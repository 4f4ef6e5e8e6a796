use axum::Json;
use axum::extract::State;

use crate::api::dto::metadata::ServerMetadata;
use crate::state::AppState;

pub async fn server_metadata(State(state): State<AppState>) -> Json<ServerMetadata> {
    Json(ServerMetadata::new(
        state.oauth.issuer(),
        &state.dpop_policy.allowed_algorithms,
    ))
}
