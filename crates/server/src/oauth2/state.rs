//! OAuth2 state management.
//!
//! Provides the state shared by the authorization server endpoints. Everything
//! in it is built once at startup and never mutated afterwards; the code store
//! is the only component with cross-request state.

use crate::config::{AppConfig, ClientAuthConfig, CodeStoreConfig, SessionStrategy, TokenField};
use crate::oauth2::clients::{
    ClientAuthenticator, DerivedClientAuthenticator, RegistryClientAuthenticator,
};
use crate::oauth2::codes::{CodeStore, DbCodeStore, MemoryCodeStore};
use crate::oauth2::keys::{SigningError, TokenSigner, signer_from_config};
use crate::oauth2::session::{
    DbSessionProvider, DbUserDirectory, JwtSessionProvider, SessionProvider, UserDirectory,
};
use regex::Regex;
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use thiserror::Error;

/// Scope used when an authorize request names none.
pub const DEFAULT_SCOPE: &str = "openid email profile";

#[derive(Debug, Error)]
pub enum StateError {
    #[error(transparent)]
    Signing(#[from] SigningError),
    #[error("invalid redirect_uri pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Protocol settings derived from configuration.
#[derive(Clone, Debug)]
pub struct OAuth2Settings {
    /// Base URL for the OAuth2 server (used for issuer in tokens)
    pub issuer_url: String,
    /// Bearer token lifetime
    pub token_lifetime: time::Duration,
    /// Authorization code lifetime
    pub code_lifetime: time::Duration,
    pub redirect_uri_pattern: Option<Regex>,
    pub signin_url: String,
    pub token_field: TokenField,
    pub revalidate_userinfo: bool,
}

impl OAuth2Settings {
    pub fn new(issuer_url: impl Into<String>) -> Self {
        Self {
            issuer_url: issuer_url.into().trim_end_matches('/').to_string(),
            token_lifetime: time::Duration::days(30),
            code_lifetime: time::Duration::minutes(10),
            redirect_uri_pattern: None,
            signin_url: "/api/auth/signin".to_string(),
            token_field: TokenField::AccessToken,
            revalidate_userinfo: false,
        }
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.issuer_url, path)
    }
}

/// OAuth2 state containing all components needed for the authorization server.
#[derive(Clone)]
pub struct OAuth2State {
    pub settings: Arc<OAuth2Settings>,
    pub signer: Arc<dyn TokenSigner>,
    pub codes: Arc<dyn CodeStore>,
    pub clients: Arc<dyn ClientAuthenticator>,
    pub sessions: Arc<dyn SessionProvider>,
    pub users: Arc<dyn UserDirectory>,
}

impl OAuth2State {
    /// Wire up the configured strategies over one database connection.
    pub fn from_config(
        config: &AppConfig,
        db: Arc<DatabaseConnection>,
    ) -> Result<Self, StateError> {
        let oauth2 = &config.oauth2;
        let mut settings = OAuth2Settings::new(oauth2.issuer_url.clone());
        settings.token_lifetime = time::Duration::seconds(oauth2.token_lifetime);
        settings.code_lifetime = time::Duration::seconds(oauth2.code_lifetime);
        settings.redirect_uri_pattern = oauth2
            .redirect_uri_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()?;
        settings.signin_url = oauth2.signin_url.clone();
        settings.token_field = oauth2.token_field;
        settings.revalidate_userinfo = oauth2.revalidate_userinfo;

        let signer = signer_from_config(&oauth2.signing, &settings.issuer_url)?;

        let clients: Arc<dyn ClientAuthenticator> = match &oauth2.client_auth {
            ClientAuthConfig::Registry => Arc::new(RegistryClientAuthenticator::new(db.clone())),
            ClientAuthConfig::Derived { secret } => {
                Arc::new(DerivedClientAuthenticator::new(secret.as_bytes()))
            }
        };

        let codes: Arc<dyn CodeStore> = match oauth2.code_store {
            CodeStoreConfig::Database => Arc::new(DbCodeStore::new(db.clone())),
            CodeStoreConfig::Memory => Arc::new(MemoryCodeStore::new()),
        };

        let sessions: Arc<dyn SessionProvider> = match &config.session.strategy {
            SessionStrategy::Database => Arc::new(DbSessionProvider::new(
                db.clone(),
                config.session.cookie_name.clone(),
            )),
            SessionStrategy::Jwt { secret } => Arc::new(JwtSessionProvider::new(
                config.session.cookie_name.clone(),
                secret.as_bytes(),
            )),
        };

        Ok(Self {
            settings: Arc::new(settings),
            signer,
            codes,
            clients,
            sessions,
            users: Arc::new(DbUserDirectory::new(db)),
        })
    }

    /// Check a redirect URI against the configured allow-list pattern.
    pub fn redirect_uri_permitted(&self, redirect_uri: &str) -> bool {
        self.settings
            .redirect_uri_pattern
            .as_ref()
            .is_none_or(|re| re.is_match(redirect_uri))
    }
}
