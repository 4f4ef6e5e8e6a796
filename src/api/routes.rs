use axum::{
    Router,
    routing::{get, post},
};

use crate::api::handlers::{authorize, metadata, par, revoke, token};
use crate::state::AppState;

pub fn routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/oauth/par", post(par::pushed_authorization_request))
        .route("/oauth/authorize", get(authorize::authorize))
        .route("/oauth/token", post(token::token))
        .route("/oauth/revoke", post(revoke::revoke))
        .route(
            "/.well-known/oauth-authorization-server",
            get(metadata::server_metadata),
        )
        .with_state(state)
}
