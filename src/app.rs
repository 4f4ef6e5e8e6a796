use std::sync::Arc;
use std::time::Duration;
use std::{panic, process};

use axum::Router;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::middleware;
use crate::services::clients::{ClientAuthenticator, ClientResolver};
use crate::services::consent::{ConsentProvider, StaticConsent};
use crate::services::dpop::DpopPolicy;
use crate::services::oauth::OAuthService;
use crate::services::tokens::{AccessTokenIssuer, AccessTokenVerifier};
use crate::state::AppState;
use crate::storage::memory::MemoryStorage;
use crate::storage::valkey::ValkeyStorage;
use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error("signing key: {0}")]
    SigningKey(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    HttpClient(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn init_tracing() {
    // Prefer RUST_LOG if set; otherwise use a sensible default.
    // Ex:
    // RUST_LOG=info,pds_oauth=debug,tower_http=debug cargo run
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tower_http=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn init_panic_hook(abort_on_panic: bool) {
    // Keep the default hook as a fallback (prints to stderr with location/payload).
    let default_hook = panic::take_hook();

    panic::set_hook(Box::new(move |info| {
        // Always surface panics via tracing so they don't get lost
        // (stderr can be hidden depending on how the process is launched).
        tracing::error!(?info, "panic");

        // In development, fail fast: crash the whole process so we notice
        // immediately. In production, defer to the default behavior and let
        // the server keep running.
        if abort_on_panic {
            process::abort();
        } else {
            default_hook(info);
        }
    }))
}

pub async fn run() -> Result<(), StartupError> {
    init_tracing();
    let config = Config::from_env()?;

    let abort_on_panic = !config.app_env.is_production();
    init_panic_hook(abort_on_panic);

    tracing::info!(
        "starting authorization server in {:?} mode on {}",
        config.app_env,
        config.addr
    );

    let state = build_state(&config).await?;
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

pub async fn build_state(config: &Config) -> Result<AppState, StartupError> {
    let storage: Arc<dyn Storage> = match &config.valkey_url {
        Some(url) => {
            tracing::info!("using Valkey-backed storage");
            Arc::new(ValkeyStorage::new(url).await?)
        }
        None => {
            tracing::warn!("no VALKEY_URL configured; state is in-process only");
            Arc::new(MemoryStorage::new())
        }
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let fetch_timeout = Duration::from_secs(config.client_fetch_timeout_seconds);
    // Loopback http client ids are a development convenience, gated exactly
    // like the dev consent provider below.
    let resolver = ClientResolver::new(
        storage.clone(),
        clock.clone(),
        fetch_timeout,
        config.client_cache_ttl_seconds,
        !config.app_env.is_production(),
    )?;
    let authenticator = ClientAuthenticator::new(
        storage.clone(),
        clock.clone(),
        fetch_timeout,
        format!("{}/oauth/token", config.public_url),
    )?;

    let access_tokens = AccessTokenIssuer::new(
        &config.access_jwt_private_key_pem,
        config.access_jwt_kid.clone(),
        config.public_url.clone(),
        config.public_url.clone(),
        config.access_token_ttl_seconds,
    )
    .map_err(StartupError::SigningKey)?;

    let verifier = AccessTokenVerifier::new(
        &config.access_jwt_public_key_pem,
        &config.public_url,
        &config.public_url,
        config.access_token_leeway_seconds,
    )
    .map_err(StartupError::SigningKey)?;

    let dpop_policy = DpopPolicy {
        allowed_algorithms: config.dpop_algorithms.clone(),
        expected_nonce: config.dpop_nonce.clone(),
        ..DpopPolicy::default()
    };

    let oauth = Arc::new(OAuthService::new(
        storage.clone(),
        clock,
        resolver,
        authenticator,
        access_tokens,
        dpop_policy.clone(),
        config.public_url.clone(),
        config.refresh_token_ttl_seconds,
    ));

    let consent: Arc<dyn ConsentProvider> = match &config.dev_consent_sub {
        Some(sub) if !config.app_env.is_production() => {
            tracing::warn!(sub = %sub, "DEV_CONSENT_SUB set; auto-approving all authorization requests");
            Arc::new(StaticConsent::approve_as(sub.clone()))
        }
        _ => Arc::new(StaticConsent::deny_all()),
    };

    Ok(AppState {
        oauth,
        consent,
        access_tokens: Arc::new(verifier),
        storage,
        dpop_policy,
        public_url: config.public_url.clone(),
    })
}

pub fn build_router(state: AppState) -> Router {
    let router = api::routes(state.clone()).with_state(state);
    middleware::http::apply(router)
}
