//! Shared fixtures for the integration suites: an in-process app state over
//! memory storage, and a p256-backed DPoP key that mints real proofs.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use p256::ecdsa::{Signature, SigningKey, signature::Signer};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use pds_oauth::clock::{Clock, SystemClock};
use pds_oauth::services::clients::metadata::{ClientMetadataDoc, normalize_metadata};
use pds_oauth::services::clients::{ClientAuthenticator, ClientMetadata, ClientResolver};
use pds_oauth::services::consent::StaticConsent;
use pds_oauth::services::dpop::DpopPolicy;
use pds_oauth::services::oauth::OAuthService;
use pds_oauth::services::tokens::{AccessTokenIssuer, AccessTokenVerifier};
use pds_oauth::state::AppState;
use pds_oauth::storage::Storage;
use pds_oauth::storage::memory::MemoryStorage;

pub const ISSUER: &str = "https://pds.example.com";
pub const CLIENT_ID: &str = "https://app.example.com/client-metadata.json";
pub const REDIRECT_URI: &str = "https://app.example.com/callback";
pub const SUB: &str = "did:plc:ewvi7nxzyoun6zhxrhs64oiz";

fn base64url(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

pub struct TestKey {
    secret: p256::SecretKey,
    signing_key: SigningKey,
    x: String,
    y: String,
}

impl TestKey {
    pub fn generate() -> Self {
        let secret = p256::SecretKey::random(&mut rand::rngs::OsRng);
        let signing_key = SigningKey::from(&secret);
        let point = secret.public_key().to_encoded_point(false);

        Self {
            signing_key,
            x: base64url(point.x().expect("uncompressed point")),
            y: base64url(point.y().expect("uncompressed point")),
            secret,
        }
    }

    pub fn private_pem(&self) -> String {
        self.secret
            .to_pkcs8_pem(LineEnding::LF)
            .expect("pkcs8 encoding")
            .to_string()
    }

    pub fn public_pem(&self) -> String {
        self.secret
            .public_key()
            .to_public_key_pem(LineEnding::LF)
            .expect("spki encoding")
    }

    pub fn public_jwk(&self) -> Value {
        json!({ "kty": "EC", "crv": "P-256", "x": self.x, "y": self.y })
    }

    pub fn jkt(&self) -> String {
        let canonical = format!(
            "{{\"crv\":\"P-256\",\"kty\":\"EC\",\"x\":\"{}\",\"y\":\"{}\"}}",
            self.x, self.y
        );
        base64url(&Sha256::digest(canonical.as_bytes()))
    }

    /// DPoP proof over (htm, htu), optionally bound to an access token.
    pub fn proof(&self, htm: &str, htu: &str, access_token: Option<&str>) -> String {
        let mut claims = json!({
            "jti": base64url(&rand::random::<[u8; 12]>()),
            "htm": htm,
            "htu": htu,
            "iat": Utc::now().timestamp(),
        });
        if let Some(token) = access_token {
            claims["ath"] = json!(base64url(&Sha256::digest(token.as_bytes())));
        }

        let header = json!({ "typ": "dpop+jwt", "alg": "ES256", "jwk": self.public_jwk() });
        let input = format!(
            "{}.{}",
            base64url(header.to_string().as_bytes()),
            base64url(claims.to_string().as_bytes())
        );
        let signature: Signature = self.signing_key.sign(input.as_bytes());
        format!("{}.{}", input, base64url(&signature.to_bytes()))
    }
}

pub fn public_client_metadata() -> ClientMetadata {
    let doc: ClientMetadataDoc = serde_json::from_value(json!({
        "client_id": CLIENT_ID,
        "redirect_uris": [REDIRECT_URI],
        "client_name": "Example App",
        "token_endpoint_auth_method": "none",
    }))
    .unwrap();
    normalize_metadata(doc, Utc::now()).unwrap()
}

/// AppState over memory storage, auto-approving consent as `SUB`.
pub async fn test_state() -> AppState {
    test_state_with(DpopPolicy::default()).await
}

pub async fn test_state_with(dpop_policy: DpopPolicy) -> AppState {
    let storage: Arc<MemoryStorage> = Arc::new(MemoryStorage::new());
    storage
        .save_client(CLIENT_ID, &public_client_metadata())
        .await
        .unwrap();

    let storage: Arc<dyn Storage> = storage;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let server_key = TestKey::generate();

    let resolver = ClientResolver::new(
        storage.clone(),
        clock.clone(),
        Duration::from_secs(2),
        3600,
        true,
    )
    .unwrap();
    let authenticator = ClientAuthenticator::new(
        storage.clone(),
        clock.clone(),
        Duration::from_secs(2),
        format!("{ISSUER}/oauth/token"),
    )
    .unwrap();

    let access_tokens = AccessTokenIssuer::new(
        &server_key.private_pem(),
        "pds-es256-1".to_string(),
        ISSUER.to_string(),
        ISSUER.to_string(),
        3600,
    )
    .unwrap();
    let verifier =
        AccessTokenVerifier::new(&server_key.public_pem(), ISSUER, ISSUER, 10).unwrap();

    let oauth = Arc::new(OAuthService::new(
        storage.clone(),
        clock,
        resolver,
        authenticator,
        access_tokens,
        dpop_policy.clone(),
        ISSUER.to_string(),
        2_592_000,
    ));

    AppState {
        oauth,
        consent: Arc::new(StaticConsent::approve_as(SUB)),
        access_tokens: Arc::new(verifier),
        storage,
        dpop_policy,
        public_url: ISSUER.to_string(),
    }
}

/// `application/x-www-form-urlencoded` body from key/value pairs.
pub fn form_body(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}
