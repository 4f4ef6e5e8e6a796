pub mod clients;
pub mod consent;
pub mod dpop;
pub mod encoding;
pub mod oauth;
pub mod pkce;
pub mod tokens;
