use serde::Serialize;

/// Authorization-server metadata document (RFC 8414 +
/// `/.well-known/oauth-authorization-server` discovery as atproto uses it).
#[derive(Debug, Clone, Serialize)]
pub struct ServerMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub pushed_authorization_request_endpoint: String,
    pub revocation_endpoint: String,
    pub response_types_supported: Vec<&'static str>,
    pub grant_types_supported: Vec<&'static str>,
    pub code_challenge_methods_supported: Vec<&'static str>,
    pub token_endpoint_auth_methods_supported: Vec<&'static str>,
    pub token_endpoint_auth_signing_alg_values_supported: Vec<String>,
    pub dpop_signing_alg_values_supported: Vec<String>,
    pub scopes_supported: Vec<&'static str>,
    pub authorization_response_iss_parameter_supported: bool,
    pub require_pushed_authorization_requests: bool,
    pub client_id_metadata_document_supported: bool,
}

impl ServerMetadata {
    pub fn new(issuer: &str, dpop_algorithms: &[String]) -> Self {
        Self {
            issuer: issuer.to_string(),
            authorization_endpoint: format!("{issuer}/oauth/authorize"),
            token_endpoint: format!("{issuer}/oauth/token"),
            pushed_authorization_request_endpoint: format!("{issuer}/oauth/par"),
            revocation_endpoint: format!("{issuer}/oauth/revoke"),
            response_types_supported: vec!["code"],
            grant_types_supported: vec!["authorization_code", "refresh_token"],
            code_challenge_methods_supported: vec!["S256"],
            token_endpoint_auth_methods_supported: vec!["none", "private_key_jwt"],
            token_endpoint_auth_signing_alg_values_supported: vec![
                "ES256".to_string(),
                "ES384".to_string(),
                "ES512".to_string(),
                "RS256".to_string(),
                "RS384".to_string(),
                "RS512".to_string(),
            ],
            dpop_signing_alg_values_supported: dpop_algorithms.to_vec(),
            scopes_supported: vec!["atproto"],
            authorization_response_iss_parameter_supported: true,
            require_pushed_authorization_requests: true,
            client_id_metadata_document_supported: true,
        }
    }
}
