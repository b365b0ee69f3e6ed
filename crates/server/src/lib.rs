//! An OAuth2 / OpenID Connect bridge for an existing session-based login.
//!
//! Third-party clients run the authorization code flow with PKCE against this
//! service; users sign in through the first-party site as usual and the
//! resulting session is exchanged for a signed bearer token.

use std::sync::Arc;

use sea_orm::DatabaseConnection;

use crate::config::AppConfig;

pub mod api;
pub mod config;
pub mod entity;
pub mod error;
pub mod oauth2;

#[derive(Clone, Debug)]
pub struct AppResources {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<AppConfig>,
}
