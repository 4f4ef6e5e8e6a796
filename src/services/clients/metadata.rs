//! OAuth client metadata (atproto client-metadata discovery documents).
//!
//! The document is the trust anchor for a client: its identity IS the URL or
//! DID it was fetched for, so `client_id` equality is checked byte-for-byte
//! by the resolver before anything here is persisted.

use chrono::{DateTime, Utc};
use jsonwebtoken::jwk::JwkSet;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenEndpointAuthMethod {
    None,
    PrivateKeyJwt,
}

/// The document shape served by clients. Unknown fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientMetadataDoc {
    pub client_id: String,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub client_uri: Option<String>,
    #[serde(default)]
    pub logo_uri: Option<String>,
    #[serde(default)]
    pub token_endpoint_auth_method: Option<String>,
    #[serde(default)]
    pub jwks: Option<JwkSet>,
    #[serde(default)]
    pub jwks_uri: Option<String>,
}

/// Normalized, cached form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMetadata {
    pub client_id: String,
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub client_uri: Option<String>,
    #[serde(default)]
    pub logo_uri: Option<String>,
    /// `None` only in cache entries written before this field existed; the
    /// resolver treats those as stale and refetches.
    #[serde(default)]
    pub token_endpoint_auth_method: Option<TokenEndpointAuthMethod>,
    #[serde(default)]
    pub jwks: Option<JwkSet>,
    #[serde(default)]
    pub jwks_uri: Option<String>,
    pub cached_at: DateTime<Utc>,
}

impl ClientMetadata {
    pub fn auth_method(&self) -> TokenEndpointAuthMethod {
        self.token_endpoint_auth_method
            .unwrap_or(TokenEndpointAuthMethod::None)
    }
}

/// Schema validation + normalization of a fetched document.
///
/// `client_id` equality with the requested id is the caller's job; this
/// checks internal consistency only.
pub fn normalize_metadata(
    doc: ClientMetadataDoc,
    now: DateTime<Utc>,
) -> Result<ClientMetadata, String> {
    if doc.redirect_uris.is_empty() {
        return Err("redirect_uris must be a non-empty array".to_string());
    }

    let method = match doc.token_endpoint_auth_method.as_deref() {
        // atproto default for absent method is a public client.
        None | Some("none") => TokenEndpointAuthMethod::None,
        Some("private_key_jwt") => TokenEndpointAuthMethod::PrivateKeyJwt,
        Some(other) => {
            return Err(format!("unsupported token_endpoint_auth_method: {other}"));
        }
    };

    if method == TokenEndpointAuthMethod::PrivateKeyJwt {
        match (&doc.jwks, &doc.jwks_uri) {
            (Some(_), None) | (None, Some(_)) => {}
            _ => {
                return Err(
                    "private_key_jwt requires exactly one of jwks or jwks_uri".to_string(),
                );
            }
        }
    }

    Ok(ClientMetadata {
        client_id: doc.client_id,
        redirect_uris: doc.redirect_uris,
        client_name: doc.client_name,
        client_uri: doc.client_uri,
        logo_uri: doc.logo_uri,
        token_endpoint_auth_method: Some(method),
        jwks: doc.jwks,
        jwks_uri: doc.jwks_uri,
        cached_at: now,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(value: serde_json::Value) -> ClientMetadataDoc {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn minimal_public_client_normalizes() {
        let metadata = normalize_metadata(
            doc(json!({
                "client_id": "https://app.example.com/client-metadata.json",
                "redirect_uris": ["https://app.example.com/callback"],
                "unknown_extension": {"ignored": true},
            })),
            Utc::now(),
        )
        .unwrap();

        assert_eq!(metadata.auth_method(), TokenEndpointAuthMethod::None);
        assert_eq!(metadata.redirect_uris.len(), 1);
    }

    #[test]
    fn empty_redirect_uris_rejected() {
        let result = normalize_metadata(
            doc(json!({
                "client_id": "https://app.example.com/client-metadata.json",
                "redirect_uris": [],
            })),
            Utc::now(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn private_key_jwt_requires_exactly_one_key_source() {
        let neither = doc(json!({
            "client_id": "https://app.example.com/client-metadata.json",
            "redirect_uris": ["https://app.example.com/callback"],
            "token_endpoint_auth_method": "private_key_jwt",
        }));
        assert!(normalize_metadata(neither, Utc::now()).is_err());

        let both = doc(json!({
            "client_id": "https://app.example.com/client-metadata.json",
            "redirect_uris": ["https://app.example.com/callback"],
            "token_endpoint_auth_method": "private_key_jwt",
            "jwks": {"keys": []},
            "jwks_uri": "https://app.example.com/jwks.json",
        }));
        assert!(normalize_metadata(both, Utc::now()).is_err());

        let jwks_only = doc(json!({
            "client_id": "https://app.example.com/client-metadata.json",
            "redirect_uris": ["https://app.example.com/callback"],
            "token_endpoint_auth_method": "private_key_jwt",
            "jwks": {"keys": []},
        }));
        let metadata = normalize_metadata(jwks_only, Utc::now()).unwrap();
        assert_eq!(metadata.auth_method(), TokenEndpointAuthMethod::PrivateKeyJwt);
    }

    #[test]
    fn unknown_auth_method_rejected() {
        let result = normalize_metadata(
            doc(json!({
                "client_id": "https://app.example.com/client-metadata.json",
                "redirect_uris": ["https://app.example.com/callback"],
                "token_endpoint_auth_method": "client_secret_basic",
            })),
            Utc::now(),
        );
        assert!(result.is_err());
    }
}
