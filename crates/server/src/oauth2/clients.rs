//! Client authentication for the token endpoint.
//!
//! Two strategies share the [`ClientAuthenticator`] interface:
//! - [`RegistryClientAuthenticator`] looks clients up in the `oauth2_client` table.
//! - [`DerivedClientAuthenticator`] accepts any client whose secret equals
//!   `hex(HMAC-SHA256(server_secret, client_id))`.
//!
//! Secrets are always compared in constant time.

use crate::entity::oauth2_client;
use async_trait::async_trait;
use axum::http::HeaderMap;
use base64::Engine;
use hmac::{Hmac, Mac};
use sea_orm::{DatabaseConnection, DbErr, EntityTrait};
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum ClientAuthError {
    #[error("client_id is missing")]
    MissingClientId,
    #[error("client_secret is missing")]
    MissingClientSecret,
    #[error("client authentication failed")]
    InvalidClient,
    #[error("storage error: {0}")]
    Storage(#[from] DbErr),
}

/// Client identity as presented on a request.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

/// Pick client credentials from an HTTP Basic header, falling back to the body.
pub fn extract_client_credentials(
    headers: &HeaderMap,
    body_client_id: Option<&str>,
    body_client_secret: Option<&str>,
) -> ClientCredentials {
    // Try Basic auth first
    if let Some(auth) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split_once(' '))
        .and_then(|(scheme, rest)| scheme.eq_ignore_ascii_case("Basic").then_some(rest))
        && let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(auth.trim())
        && let Ok(creds) = String::from_utf8(decoded)
        && let Some((id, secret)) = creds.split_once(':')
    {
        // RFC 6749 2.3.1: both halves are form-urlencoded before joining
        return ClientCredentials {
            client_id: Some(form_decode(id)),
            client_secret: Some(form_decode(secret)),
        };
    }

    // Fall back to form body
    ClientCredentials {
        client_id: body_client_id.filter(|s| !s.is_empty()).map(String::from),
        client_secret: body_client_secret.filter(|s| !s.is_empty()).map(String::from),
    }
}

fn form_decode(value: &str) -> String {
    urlencoding::decode(value)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| value.to_string())
}

#[async_trait]
pub trait ClientAuthenticator: Send + Sync {
    /// Check `secret` against the expected secret for `client_id`.
    async fn authenticate(&self, client_id: &str, secret: &str) -> Result<(), ClientAuthError>;

    /// Whether `redirect_uri` may be used by `client_id` at the authorize endpoint.
    async fn redirect_allowed(
        &self,
        client_id: &str,
        redirect_uri: &str,
    ) -> Result<bool, ClientAuthError>;

    /// Authenticate presented credentials, resolving missing fields first.
    async fn authenticate_credentials(
        &self,
        credentials: &ClientCredentials,
    ) -> Result<String, ClientAuthError> {
        let client_id = credentials
            .client_id
            .as_deref()
            .ok_or(ClientAuthError::MissingClientId)?;
        let secret = credentials
            .client_secret
            .as_deref()
            .ok_or(ClientAuthError::MissingClientSecret)?;
        self.authenticate(client_id, secret).await?;
        Ok(client_id.to_string())
    }
}

fn secrets_match(expected: &str, presented: &str) -> bool {
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}

/// Database-backed client registry.
#[derive(Clone)]
pub struct RegistryClientAuthenticator {
    db: Arc<DatabaseConnection>,
}

impl RegistryClientAuthenticator {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    async fn client(&self, client_id: &str) -> Result<Option<oauth2_client::Model>, DbErr> {
        oauth2_client::Entity::find_by_id(client_id)
            .one(self.db.as_ref())
            .await
    }
}

#[async_trait]
impl ClientAuthenticator for RegistryClientAuthenticator {
    async fn authenticate(&self, client_id: &str, secret: &str) -> Result<(), ClientAuthError> {
        let client = self
            .client(client_id)
            .await?
            .ok_or(ClientAuthError::InvalidClient)?;
        if secrets_match(&client.secret, secret) {
            Ok(())
        } else {
            Err(ClientAuthError::InvalidClient)
        }
    }

    async fn redirect_allowed(
        &self,
        client_id: &str,
        redirect_uri: &str,
    ) -> Result<bool, ClientAuthError> {
        Ok(self
            .client(client_id)
            .await?
            .is_some_and(|c| c.is_redirect_uri_allowed(redirect_uri)))
    }
}

/// Stateless clients whose secret is derived from the server secret.
#[derive(Clone)]
pub struct DerivedClientAuthenticator {
    server_secret: Arc<[u8]>,
}

impl DerivedClientAuthenticator {
    pub fn new(server_secret: &[u8]) -> Self {
        Self {
            server_secret: Arc::from(server_secret),
        }
    }

    /// The secret a client must present; handed to client operators out of band.
    pub fn derive_secret(&self, client_id: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.server_secret)
            .expect("HMAC accepts keys of any length");
        mac.update(client_id.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

#[async_trait]
impl ClientAuthenticator for DerivedClientAuthenticator {
    async fn authenticate(&self, client_id: &str, secret: &str) -> Result<(), ClientAuthError> {
        if secrets_match(&self.derive_secret(client_id), secret) {
            Ok(())
        } else {
            Err(ClientAuthError::InvalidClient)
        }
    }

    async fn redirect_allowed(&self, _: &str, _: &str) -> Result<bool, ClientAuthError> {
        Ok(true)
    }
}
