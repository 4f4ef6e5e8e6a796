pub mod access_jwt;

pub use access_jwt::{AccessTokenIssuer, AccessTokenVerifier, VerifiedAccessClaims};
