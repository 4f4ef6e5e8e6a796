//! Transport middleware for the authorization endpoints.
//!
//! Every request this server accepts is tiny: urlencoded forms on
//! `/oauth/par`, `/oauth/token` and `/oauth/revoke`, bare query strings on
//! `/oauth/authorize` and the well-known document. The limits below are
//! sized to that traffic, and transport failures answer in the same
//! `{error, error_description}` shape as every other failure here.

use std::time::Duration;

use axum::Router;
use axum::error_handling::HandleErrorLayer;
use axum::http::header::HeaderName;
use axum::response::{IntoResponse, Response};
use tower::timeout::TimeoutLayer;
use tower::{BoxError, ServiceBuilder};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::error::OAuthError;

/// Largest body any endpoint accepts. The biggest legitimate form is a
/// token request carrying a `client_assertion` JWT; even with an RSA key
/// and a generous scope list that stays under 8 KiB, so 16 KiB is headroom,
/// not invitation.
const MAX_FORM_BYTES: usize = 16 * 1024;

/// Whole-request ceiling. PAR and token requests can resolve client
/// metadata on a cache miss: a 10 s fetch deadline plus one transport
/// retry, so the request deadline has to clear ~20 s of outbound I/O
/// before its own margin.
const REQUEST_DEADLINE: Duration = Duration::from_secs(25);

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Request-id generation/propagation, body cap, deadline, and access
/// tracing for the whole OAuth surface.
pub fn apply(router: Router) -> Router {
    let request_id_header = HeaderName::from_static(REQUEST_ID_HEADER);

    let layers = ServiceBuilder::new()
        // Convert layer errors into OAuth-shaped responses so the service
        // type stays `Infallible` and clients never see a bare status line.
        .layer(HandleErrorLayer::new(transport_error))
        .layer(SetRequestIdLayer::new(
            request_id_header.clone(),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(request_id_header))
        .layer(RequestBodyLimitLayer::new(MAX_FORM_BYTES))
        .layer(TimeoutLayer::new(REQUEST_DEADLINE))
        .layer(TraceLayer::new_for_http());

    router.layer(layers)
}

async fn transport_error(err: BoxError) -> Response {
    if err.is::<tower::timeout::error::Elapsed>() {
        return OAuthError::InvalidRequest("request timed out".to_string()).into_response();
    }

    tracing::error!(error = %err, "transport middleware failure");
    OAuthError::InvalidRequest("request could not be processed".to_string()).into_response()
}
