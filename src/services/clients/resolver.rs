//! Client metadata discovery: fetch-on-demand with a Storage-backed cache.
//!
//! The client_id is either the HTTPS URL of the metadata document itself or
//! a `did:web` that maps onto a well-known location. Whatever the route, the
//! fetched document must claim exactly the id it was fetched for.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use reqwest::header::ACCEPT;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::OAuthError;
use crate::services::clients::metadata::{ClientMetadata, ClientMetadataDoc, normalize_metadata};
use crate::storage::Storage;

const WELL_KNOWN_SUFFIX: &str = ".well-known/oauth-client-metadata";

#[derive(Clone)]
pub struct ClientResolver {
    http: reqwest::Client,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    cache_ttl: ChronoDuration,
    /// Development-only opt-in: also accept `http://localhost` /
    /// `http://127.0.0.1` client ids. Production deployments pass false and
    /// get the strict https-URL-or-DID rule.
    allow_loopback_clients: bool,
}

impl ClientResolver {
    pub fn new(
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        fetch_timeout: Duration,
        cache_ttl_seconds: i64,
        allow_loopback_clients: bool,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(fetch_timeout).build()?;

        Ok(Self {
            http,
            storage,
            clock,
            cache_ttl: ChronoDuration::seconds(cache_ttl_seconds),
            allow_loopback_clients,
        })
    }

    /// Resolve `client_id` to validated metadata, consulting the cache first.
    pub async fn resolve(&self, client_id: &str) -> Result<ClientMetadata, OAuthError> {
        if !is_valid_client_id(client_id, self.allow_loopback_clients) {
            return Err(OAuthError::InvalidClient(
                "client_id must be an https URL or a DID".to_string(),
            ));
        }

        let now = self.clock.now();

        if let Some(cached) = self.storage.get_client(client_id).await? {
            // Entries without an auth method predate the field and must be
            // refetched even when otherwise fresh.
            if cached.token_endpoint_auth_method.is_some()
                && now - cached.cached_at < self.cache_ttl
            {
                return Ok(cached);
            }
            debug!(client_id = %client_id, "client metadata cache stale");
        }

        let url = metadata_url(client_id)?;
        let doc = self.fetch_document(&url).await?;

        if doc.client_id != client_id {
            return Err(OAuthError::InvalidClient(
                "metadata client_id does not match requested client_id".to_string(),
            ));
        }

        let metadata = normalize_metadata(doc, now).map_err(OAuthError::InvalidClient)?;
        self.storage.save_client(client_id, &metadata).await?;

        Ok(metadata)
    }

    /// Exact-match check of `uri` against the client's registered redirects.
    /// Any resolution failure is simply "not valid".
    pub async fn validate_redirect_uri(&self, client_id: &str, uri: &str) -> bool {
        match self.resolve(client_id).await {
            Ok(metadata) => metadata.redirect_uris.iter().any(|r| r == uri),
            Err(_) => false,
        }
    }

    async fn fetch_document(&self, url: &str) -> Result<ClientMetadataDoc, OAuthError> {
        // One retry, transport failures only; HTTP error statuses are final.
        for attempt in 0..2 {
            match self
                .http
                .get(url)
                .header(ACCEPT, "application/json")
                .send()
                .await
            {
                Ok(response) => {
                    if !response.status().is_success() {
                        warn!(url = %url, status = %response.status(), "client metadata fetch failed");
                        return Err(OAuthError::InvalidClient(
                            "client metadata document unavailable".to_string(),
                        ));
                    }
                    return response.json::<ClientMetadataDoc>().await.map_err(|e| {
                        warn!(url = %url, error = %e, "client metadata not valid JSON");
                        OAuthError::InvalidClient("client metadata is not valid JSON".to_string())
                    });
                }
                Err(e) => {
                    warn!(url = %url, attempt, error = %e, "client metadata fetch error");
                }
            }
        }

        Err(OAuthError::InvalidClient(
            "client metadata fetch failed".to_string(),
        ))
    }
}

/// An https URL or a syntactically valid DID. Loopback http URLs pass only
/// when the resolver was built with the development opt-in.
fn is_valid_client_id(client_id: &str, allow_loopback: bool) -> bool {
    if client_id.starts_with("did:") {
        return is_valid_did(client_id);
    }
    is_https_url(client_id) || (allow_loopback && is_loopback_url(client_id))
}

fn is_https_url(raw: &str) -> bool {
    url::Url::parse(raw)
        .map(|u| u.scheme() == "https" && u.host_str().is_some())
        .unwrap_or(false)
}

fn is_loopback_url(raw: &str) -> bool {
    url::Url::parse(raw)
        .map(|u| {
            u.scheme() == "http"
                && matches!(u.host_str(), Some("localhost") | Some("127.0.0.1"))
        })
        .unwrap_or(false)
}

fn is_valid_did(raw: &str) -> bool {
    let mut parts = raw.splitn(3, ':');
    let (Some("did"), Some(method), Some(id)) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    !method.is_empty()
        && method.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        && !id.is_empty()
}

/// Where to fetch the metadata document for this client_id.
fn metadata_url(client_id: &str) -> Result<String, OAuthError> {
    if !client_id.starts_with("did:") {
        // URL clients: the id is the document location.
        return Ok(client_id.to_string());
    }

    let Some(rest) = client_id.strip_prefix("did:web:") else {
        return Err(OAuthError::InvalidClient(
            "only did:web clients are resolvable".to_string(),
        ));
    };

    let mut segments = rest.split(':');
    let host_raw = segments.next().filter(|h| !h.is_empty()).ok_or_else(|| {
        OAuthError::InvalidClient("did:web is missing a host".to_string())
    })?;

    let host = urlencoding::decode(host_raw)
        .map_err(|_| OAuthError::InvalidClient("did:web host is not valid".to_string()))?;

    let mut path = String::new();
    for segment in segments {
        if segment.is_empty() {
            return Err(OAuthError::InvalidClient(
                "did:web has an empty path segment".to_string(),
            ));
        }
        let decoded = urlencoding::decode(segment)
            .map_err(|_| OAuthError::InvalidClient("did:web path is not valid".to_string()))?;
        path.push_str(&decoded);
        path.push('/');
    }

    Ok(format!("https://{host}/{path}{WELL_KNOWN_SUFFIX}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_forms() {
        assert!(is_valid_client_id("https://app.example.com/client-metadata.json", false));
        assert!(is_valid_client_id("did:web:app.example.com", false));
        assert!(is_valid_client_id("did:plc:ewvi7nxzyoun6zhxrhs64oiz", false));

        assert!(!is_valid_client_id("http://app.example.com/meta.json", false));
        assert!(!is_valid_client_id("ftp://app.example.com", false));
        assert!(!is_valid_client_id("did:WEB:app.example.com", false));
        assert!(!is_valid_client_id("did:web:", false));
        assert!(!is_valid_client_id("not-a-client", false));
    }

    #[test]
    fn loopback_client_ids_need_the_dev_opt_in() {
        let loopback = "http://127.0.0.1:8080/client-metadata.json";
        assert!(is_valid_client_id(loopback, true));
        assert!(!is_valid_client_id(loopback, false));

        assert!(is_valid_client_id("http://localhost/client-metadata.json", true));
        assert!(!is_valid_client_id("http://localhost/client-metadata.json", false));

        // The opt-in never widens beyond loopback hosts.
        assert!(!is_valid_client_id("http://app.example.com/meta.json", true));
    }

    #[test]
    fn url_clients_resolve_to_themselves() {
        assert_eq!(
            metadata_url("https://app.example.com/oauth/client-metadata.json").unwrap(),
            "https://app.example.com/oauth/client-metadata.json"
        );
    }

    #[test]
    fn did_web_maps_to_well_known() {
        assert_eq!(
            metadata_url("did:web:client.example.com").unwrap(),
            "https://client.example.com/.well-known/oauth-client-metadata"
        );
        assert_eq!(
            metadata_url("did:web:client.example.com:apps:mail").unwrap(),
            "https://client.example.com/apps/mail/.well-known/oauth-client-metadata"
        );
        // Percent-encoded host (e.g. a port).
        assert_eq!(
            metadata_url("did:web:localhost%3A8443").unwrap(),
            "https://localhost:8443/.well-known/oauth-client-metadata"
        );
    }

    #[test]
    fn non_web_dids_are_unresolvable() {
        assert!(metadata_url("did:plc:ewvi7nxzyoun6zhxrhs64oiz").is_err());
    }
}
