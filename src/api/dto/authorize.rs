use serde::Deserialize;

/// Query string for `GET /oauth/authorize`.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizeQuery {
    pub client_id: Option<String>,
    pub request_uri: Option<String>,
}
