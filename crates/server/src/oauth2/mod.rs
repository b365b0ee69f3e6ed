//! OAuth2 Authorization Server module.
//!
//! Turns an existing first-party browser session into OAuth2 tokens for
//! third-party clients. The bearer token is signed when the user is sent back
//! from the authorization endpoint and bound to a one-time code; the token
//! endpoint only releases it after the client proves possession of the PKCE
//! verifier.
//!
//! ## Supported Flows
//!
//! - Authorization Code with PKCE (S256 only)
//!
//! ## Endpoints
//!
//! - `GET /oauth2/authorize` - Authorization endpoint
//! - `POST /oauth2/token` - Token endpoint
//! - `GET /oauth2/userinfo` - OpenID Connect UserInfo
//! - `GET /.well-known/openid-configuration` - OpenID Connect Discovery
//! - `GET /.well-known/jwks.json` - Public signing key (RSA only)

pub mod clients;
pub mod codes;
pub mod endpoints;
pub mod keys;
pub mod session;
pub mod state;

pub use clients::{ClientAuthenticator, DerivedClientAuthenticator, RegistryClientAuthenticator};
pub use codes::{CodeStore, DbCodeStore, MemoryCodeStore};
pub use endpoints::{router, well_known_router};
pub use keys::{HmacSigner, RsaSigner, TokenClaims, TokenSigner};
pub use session::{Session, SessionProvider, UserDirectory};
pub use state::{OAuth2Settings, OAuth2State};

/// OpenAPI tag for OAuth2 endpoints
pub const OAUTH2_TAG: &str = "OAuth2";

/// Spawn the periodic purge of expired authorization codes.
pub fn spawn_code_purge_task(
    codes: std::sync::Arc<dyn CodeStore>,
    every: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            match codes.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => tracing::debug!(purged, "purged expired authorization codes"),
                Err(e) => tracing::warn!(error = %e, "failed to purge authorization codes"),
            }
        }
    })
}
