//! Token signing keys.
//!
//! A single active key signs every bearer token. HMAC keys are shared secrets;
//! RSA keys additionally publish their public half as a JWK for discovery.

use crate::config::SigningConfig;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use utoipa::ToSchema;

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("token signature is invalid")]
    InvalidSignature,
    #[error("token has expired")]
    Expired,
    #[error("token is malformed")]
    Malformed,
    #[error("signing key error: {0}")]
    Key(String),
}

/// Claims carried by every bearer token this provider issues.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    pub iss: String,
    pub aud: String,
    pub client_id: String,
    pub scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    /// Set by [`TokenSigner::sign`].
    #[serde(default)]
    pub iat: i64,
    /// Set by [`TokenSigner::sign`].
    #[serde(default)]
    pub exp: i64,
    #[serde(default)]
    pub jti: String,
}

impl TokenClaims {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scope.split_whitespace().any(|s| s == scope)
    }

    /// Seconds until `exp`, never negative.
    pub fn remaining_lifetime(&self, now: OffsetDateTime) -> i64 {
        (self.exp - now.unix_timestamp()).max(0)
    }
}

/// Public RSA key in JWK form.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct Jwk {
    pub kty: String,
    pub n: String,
    pub e: String,
    pub alg: String,
    #[serde(rename = "use")]
    pub use_: String,
    pub kid: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

/// Signs and verifies bearer tokens with the single active key.
pub trait TokenSigner: Send + Sync {
    fn algorithm(&self) -> Algorithm;

    /// Sign `claims`, stamping `iat`, `exp = iat + ttl` and a fresh `jti`.
    fn sign(&self, claims: TokenClaims, ttl: time::Duration) -> Result<String, SigningError>;

    /// Verify signature, expiry and issuer.
    fn verify(&self, token: &str) -> Result<TokenClaims, SigningError>;

    /// Public key for discovery; `None` for symmetric keys.
    fn jwk(&self) -> Option<Jwk> {
        None
    }
}

/// Shared JWT plumbing for both key kinds.
struct JwtKeys {
    algorithm: Algorithm,
    kid: Option<String>,
    issuer: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl JwtKeys {
    fn sign(&self, mut claims: TokenClaims, ttl: time::Duration) -> Result<String, SigningError> {
        let now = OffsetDateTime::now_utc();
        claims.iat = now.unix_timestamp();
        claims.exp = (now + ttl).unix_timestamp();
        claims.jti = uuid::Uuid::new_v4().to_string();

        let mut header = Header::new(self.algorithm);
        header.kid = self.kid.clone();
        encode(&header, &claims, &self.encoding).map_err(|e| SigningError::Key(e.to_string()))
    }

    fn verify(&self, token: &str) -> Result<TokenClaims, SigningError> {
        let mut validation = Validation::new(self.algorithm);
        validation.leeway = 0;
        validation.validate_aud = false;
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        decode::<TokenClaims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => SigningError::Expired,
                ErrorKind::InvalidSignature
                | ErrorKind::InvalidAlgorithm
                | ErrorKind::InvalidIssuer => SigningError::InvalidSignature,
                _ => SigningError::Malformed,
            })
    }
}

/// HS256 with a shared secret.
pub struct HmacSigner {
    keys: JwtKeys,
}

impl HmacSigner {
    pub fn new(secret: &[u8], issuer: impl Into<String>) -> Self {
        Self {
            keys: JwtKeys {
                algorithm: Algorithm::HS256,
                kid: None,
                issuer: issuer.into(),
                encoding: EncodingKey::from_secret(secret),
                decoding: DecodingKey::from_secret(secret),
            },
        }
    }
}

impl TokenSigner for HmacSigner {
    fn algorithm(&self) -> Algorithm {
        Algorithm::HS256
    }

    fn sign(&self, claims: TokenClaims, ttl: time::Duration) -> Result<String, SigningError> {
        self.keys.sign(claims, ttl)
    }

    fn verify(&self, token: &str) -> Result<TokenClaims, SigningError> {
        self.keys.verify(token)
    }
}

/// RS256 with a PEM keypair.
pub struct RsaSigner {
    keys: JwtKeys,
    jwk: Jwk,
}

impl RsaSigner {
    /// Build from PEM strings. Each may also be given base64-encoded, the way
    /// keys are usually passed through environment variables.
    pub fn from_pem(
        private_pem: &str,
        public_pem: &str,
        kid: impl Into<String>,
        issuer: impl Into<String>,
    ) -> Result<Self, SigningError> {
        let kid = kid.into();
        let private_pem = pem_text(private_pem)?;
        let public_pem = pem_text(public_pem)?;

        let encoding = EncodingKey::from_rsa_pem(private_pem.as_bytes())
            .map_err(|e| SigningError::Key(e.to_string()))?;
        let decoding = DecodingKey::from_rsa_pem(public_pem.as_bytes())
            .map_err(|e| SigningError::Key(e.to_string()))?;

        // Parse public key to extract n and e; accept SPKI and PKCS#1 encodings
        let public_key = RsaPublicKey::from_public_key_pem(&public_pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(&public_pem))
            .map_err(|e| SigningError::Key(e.to_string()))?;

        let jwk = Jwk {
            kty: "RSA".to_string(),
            n: URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be()),
            e: URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be()),
            alg: "RS256".to_string(),
            use_: "sig".to_string(),
            kid: kid.clone(),
        };

        Ok(Self {
            keys: JwtKeys {
                algorithm: Algorithm::RS256,
                kid: Some(kid),
                issuer: issuer.into(),
                encoding,
                decoding,
            },
            jwk,
        })
    }
}

impl TokenSigner for RsaSigner {
    fn algorithm(&self) -> Algorithm {
        Algorithm::RS256
    }

    fn sign(&self, claims: TokenClaims, ttl: time::Duration) -> Result<String, SigningError> {
        self.keys.sign(claims, ttl)
    }

    fn verify(&self, token: &str) -> Result<TokenClaims, SigningError> {
        self.keys.verify(token)
    }

    fn jwk(&self) -> Option<Jwk> {
        Some(self.jwk.clone())
    }
}

fn pem_text(value: &str) -> Result<String, SigningError> {
    let trimmed = value.trim();
    if trimmed.starts_with("-----BEGIN") {
        return Ok(trimmed.to_string());
    }
    let decoded = STANDARD
        .decode(trimmed)
        .map_err(|e| SigningError::Key(format!("key is neither PEM nor base64: {e}")))?;
    String::from_utf8(decoded).map_err(|e| SigningError::Key(e.to_string()))
}

/// Build the configured signer.
pub fn signer_from_config(
    config: &SigningConfig,
    issuer: &str,
) -> Result<Arc<dyn TokenSigner>, SigningError> {
    Ok(match config {
        SigningConfig::Hmac { secret } => Arc::new(HmacSigner::new(secret.as_bytes(), issuer)),
        SigningConfig::Rsa {
            private_key,
            public_key,
            key_id,
        } => Arc::new(RsaSigner::from_pem(
            private_key,
            public_key,
            key_id.clone(),
            issuer,
        )?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ISSUER: &str = "https://id.example.com";

    fn claims() -> TokenClaims {
        TokenClaims {
            sub: "u1".into(),
            iss: ISSUER.into(),
            aud: "client-a".into(),
            client_id: "client-a".into(),
            scope: "openid email".into(),
            email: Some("a@x.com".into()),
            name: None,
            picture: None,
            iat: 0,
            exp: 0,
            jti: String::new(),
        }
    }

    fn hmac() -> HmacSigner {
        HmacSigner::new(b"0123456789abcdef0123456789abcdef", ISSUER)
    }

    #[test]
    fn hmac_round_trip_stamps_times() {
        let signer = hmac();
        let token = signer.sign(claims(), time::Duration::hours(1)).unwrap();
        let decoded = signer.verify(&token).unwrap();
        assert_eq!(decoded.sub, "u1");
        assert_eq!(decoded.email.as_deref(), Some("a@x.com"));
        assert_eq!(decoded.exp - decoded.iat, 3600);
        assert!(!decoded.jti.is_empty());
        assert!(signer.jwk().is_none());
    }

    #[test]
    fn expired_token_is_typed() {
        let signer = hmac();
        let token = signer.sign(claims(), time::Duration::seconds(-30)).unwrap();
        assert!(matches!(signer.verify(&token), Err(SigningError::Expired)));
    }

    #[test]
    fn foreign_key_is_invalid_signature() {
        let token = hmac().sign(claims(), time::Duration::hours(1)).unwrap();
        let other = HmacSigner::new(b"ffffffffffffffffffffffffffffffff", ISSUER);
        assert!(matches!(
            other.verify(&token),
            Err(SigningError::InvalidSignature)
        ));
    }

    #[test]
    fn wrong_issuer_is_rejected() {
        let token = hmac().sign(claims(), time::Duration::hours(1)).unwrap();
        let other = HmacSigner::new(b"0123456789abcdef0123456789abcdef", "https://evil");
        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            hmac().verify("not-a-jwt"),
            Err(SigningError::Malformed)
        ));
    }

    #[test]
    fn non_pem_non_base64_key_is_rejected() {
        assert!(matches!(
            RsaSigner::from_pem("%%%", "%%%", "k", ISSUER),
            Err(SigningError::Key(_))
        ));
    }

    #[test]
    fn scope_lookup_is_token_based() {
        let c = claims();
        assert!(c.has_scope("email"));
        assert!(!c.has_scope("profile"));
        assert!(!c.has_scope("mail"));
    }
}
