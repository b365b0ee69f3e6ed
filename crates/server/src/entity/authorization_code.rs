//! OAuth2 authorization code entity - single-use codes bound to a precomputed token.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "oauth2_authorization_code")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub code: String,
    pub client_id: String,
    pub redirect_uri: String,
    /// PKCE S256 challenge, as sent by the client
    pub code_challenge: String,
    pub scope: String,
    /// Signed bearer token handed out when the code is exchanged
    #[sea_orm(column_type = "Text")]
    pub bound_token: String,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Check if this authorization code has expired
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc())
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at <= now
    }

    /// Verify a PKCE code verifier against the stored S256 challenge
    pub fn verify_pkce(&self, code_verifier: &str) -> bool {
        let computed = s256_challenge(code_verifier);
        computed.as_bytes().ct_eq(self.code_challenge.as_bytes()).into()
    }
}

/// `base64url(SHA-256(verifier))` without padding.
pub fn s256_challenge(code_verifier: &str) -> String {
    use base64::Engine;
    use sha2::{Digest, Sha256};
    let hash = Sha256::digest(code_verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(hash)
}
