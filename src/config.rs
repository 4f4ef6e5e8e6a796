use std::net::SocketAddr;
use std::str::FromStr;
use std::{env, fmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnv {
    Development,
    Production,
}

impl AppEnv {
    pub fn from_env() -> Self {
        match std::env::var("APP_ENV")
            .unwrap_or_else(|_| "development".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "production" | "prod" => Self::Production,
            _ => Self::Development,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing(key) => write!(f, "missing configuration: {}", key),
            ConfigError::Invalid(key) => write!(f, "invalid configuration: {}", key),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Clone, Debug)]
pub struct Config {
    pub addr: SocketAddr,
    pub app_env: AppEnv,
    /// Public base URL of this PDS. Forms the token `iss`/`aud` and the
    /// canonical `htu` for proofs. No trailing slash.
    pub public_url: String,
    // The PDS signs access tokens with this ES256 key pair.
    pub access_jwt_private_key_pem: String,
    pub access_jwt_public_key_pem: String,
    pub access_jwt_kid: String,
    // Token lifetimes (seconds)
    pub access_token_ttl_seconds: u64,
    pub refresh_token_ttl_seconds: u64,
    pub access_token_leeway_seconds: u64,
    // Client metadata discovery
    pub client_cache_ttl_seconds: i64,
    pub client_fetch_timeout_seconds: u64,
    // DPoP
    pub dpop_algorithms: Vec<String>,
    pub dpop_nonce: Option<String>,
    /// When set, durable state goes to Valkey; otherwise in-process memory.
    pub valkey_url: Option<String>,
    /// Development only: auto-approve authorization requests as this DID.
    pub dev_consent_sub: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let port: u16 = std::env::var("PDS_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3000);

        let addr: SocketAddr = SocketAddr::from_str(&format!("0.0.0.0:{}", port))
            .map_err(|_| ConfigError::Invalid("PDS_PORT"))?;

        let app_env = AppEnv::from_env();

        let public_url = env::var("PDS_PUBLIC_URL")
            .map_err(|_| ConfigError::Missing("PDS_PUBLIC_URL"))?
            .trim_end_matches('/')
            .to_string();

        let access_jwt_private_key_pem = env::var("ACCESS_JWT_PRIVATE_KEY_PEM")
            .map_err(|_| ConfigError::Missing("ACCESS_JWT_PRIVATE_KEY_PEM"))?
            .replace("\\n", "\n");
        let access_jwt_public_key_pem = env::var("ACCESS_JWT_PUBLIC_KEY_PEM")
            .map_err(|_| ConfigError::Missing("ACCESS_JWT_PUBLIC_KEY_PEM"))?
            .replace("\\n", "\n");
        let access_jwt_kid =
            env::var("ACCESS_JWT_KID").unwrap_or_else(|_| "pds-es256-1".to_string());

        let access_token_ttl_seconds = env::var("ACCESS_TOKEN_TTL_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3600); // 1 h
        let refresh_token_ttl_seconds = env::var("REFRESH_TOKEN_TTL_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(2_592_000); // 30 days
        let access_token_leeway_seconds = env::var("ACCESS_TOKEN_LEEWAY_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let client_cache_ttl_seconds = env::var("CLIENT_CACHE_TTL_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3600); // 1 h
        let client_fetch_timeout_seconds = env::var("CLIENT_FETCH_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let dpop_algorithms: Vec<String> = env::var("DPOP_ALGORITHMS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_else(|_| vec!["ES256".to_string()]);
        if dpop_algorithms.is_empty() {
            return Err(ConfigError::Invalid("DPOP_ALGORITHMS"));
        }

        let dpop_nonce = env::var("DPOP_NONCE").ok().filter(|s| !s.is_empty());
        let valkey_url = env::var("VALKEY_URL").ok().filter(|s| !s.is_empty());
        let dev_consent_sub = env::var("DEV_CONSENT_SUB").ok().filter(|s| !s.is_empty());

        Ok(Config {
            addr,
            app_env,
            public_url,
            access_jwt_private_key_pem,
            access_jwt_public_key_pem,
            access_jwt_kid,
            access_token_ttl_seconds,
            refresh_token_ttl_seconds,
            access_token_leeway_seconds,
            client_cache_ttl_seconds,
            client_fetch_timeout_seconds,
            dpop_algorithms,
            dpop_nonce,
            valkey_url,
            dev_consent_sub,
        })
    }
}
