//! Proof-minting helpers for DPoP tests.
//!
//! Signs compact JWS structures directly with p256 so tests can tamper with
//! the JOSE header in ways a well-behaved JOSE library would refuse.

use p256::ecdsa::{Signature, SigningKey, signature::Signer};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::services::encoding::{base64url_encode, random_string};

pub struct TestDpopKey {
    secret: p256::SecretKey,
    signing_key: SigningKey,
    x: String,
    y: String,
}

impl TestDpopKey {
    pub fn generate() -> Self {
        let secret = p256::SecretKey::random(&mut rand::rngs::OsRng);
        let signing_key = SigningKey::from(&secret);

        let point = secret.public_key().to_encoded_point(false);
        let x = base64url_encode(point.x().expect("uncompressed point"));
        let y = base64url_encode(point.y().expect("uncompressed point"));

        Self {
            secret,
            signing_key,
            x,
            y,
        }
    }

    /// PKCS#8 private key PEM; doubles as the server signing key in tests.
    pub fn private_pem(&self) -> String {
        self.secret
            .to_pkcs8_pem(LineEnding::LF)
            .expect("pkcs8 encoding")
            .to_string()
    }

    /// SPKI public key PEM for the verification side.
    pub fn public_pem(&self) -> String {
        self.secret
            .public_key()
            .to_public_key_pem(LineEnding::LF)
            .expect("spki encoding")
    }

    pub fn public_jwk(&self) -> Value {
        json!({ "kty": "EC", "crv": "P-256", "x": self.x, "y": self.y })
    }

    /// RFC 7638 thumbprint of the public key.
    pub fn jkt(&self) -> String {
        let canonical = format!(
            "{{\"crv\":\"P-256\",\"kty\":\"EC\",\"x\":\"{}\",\"y\":\"{}\"}}",
            self.x, self.y
        );
        base64url_encode(&Sha256::digest(canonical.as_bytes()))
    }

    pub fn sign_proof(&self, claims: Value) -> String {
        self.sign_raw(self.header("dpop+jwt", self.public_jwk()), claims)
    }

    pub fn sign_proof_with_typ(&self, typ: &str, claims: Value) -> String {
        self.sign_raw(self.header(typ, self.public_jwk()), claims)
    }

    pub fn sign_proof_with_jwk(&self, jwk: Value, claims: Value) -> String {
        self.sign_raw(self.header("dpop+jwt", jwk), claims)
    }

    pub fn sign_proof_with_private_jwk(&self, claims: Value) -> String {
        let mut jwk = self.public_jwk();
        jwk["d"] = json!(base64url_encode(&self.secret.to_bytes()));
        self.sign_raw(self.header("dpop+jwt", jwk), claims)
    }

    /// Arbitrary signed JWT (client assertions, tampered access tokens).
    pub fn sign_jwt(&self, header: Value, claims: Value) -> String {
        self.sign_raw(header, claims)
    }

    fn header(&self, typ: &str, jwk: Value) -> Value {
        json!({ "typ": typ, "alg": "ES256", "jwk": jwk })
    }

    fn sign_raw(&self, header: Value, claims: Value) -> String {
        let input = format!(
            "{}.{}",
            base64url_encode(header.to_string().as_bytes()),
            base64url_encode(claims.to_string().as_bytes())
        );

        let signature: Signature = self.signing_key.sign(input.as_bytes());
        format!("{}.{}", input, base64url_encode(&signature.to_bytes()))
    }
}

pub fn proof_claims(htm: &str, htu: &str, iat: i64) -> Value {
    json!({
        "jti": random_string(12),
        "htm": htm,
        "htu": htu,
        "iat": iat,
    })
}
