//! First-party session lookup and the user directory.
//!
//! Sign-in itself happens elsewhere; this module only answers "who is the
//! current browser session for, if anyone" and "what does the directory
//! currently know about this subject".

use crate::entity::{session, user};
use async_trait::async_trait;
use axum::http::HeaderMap;
use axum_extra::extract::CookieJar;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use sea_orm::{DatabaseConnection, DbErr, EntityTrait};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("storage error: {0}")]
    Storage(#[from] DbErr),
}

/// An authenticated first-party session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    /// Stable user id; never the email or username.
    pub subject: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub picture: Option<String>,
}

/// Profile data held by the user directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserProfile {
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub picture: Option<String>,
}

impl From<user::Model> for UserProfile {
    fn from(u: user::Model) -> Self {
        Self {
            id: u.id,
            name: u.name,
            email: u.email,
            picture: u.image,
        }
    }
}

impl From<UserProfile> for Session {
    fn from(p: UserProfile) -> Self {
        Self {
            subject: p.id,
            email: p.email,
            name: p.name,
            picture: p.picture,
        }
    }
}

#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// The valid session attached to the request, if any. Invalid or expired
    /// sessions are `Ok(None)`; only infrastructure failures are errors.
    async fn current_session(&self, headers: &HeaderMap) -> Result<Option<Session>, SessionError>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_user(&self, subject: &str) -> Result<Option<UserProfile>, SessionError>;
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    CookieJar::from_headers(headers)
        .get(name)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Deserialize)]
struct SessionClaims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    picture: Option<String>,
}

/// Session carried in an HS256-signed JWT cookie.
pub struct JwtSessionProvider {
    cookie_name: String,
    key: DecodingKey,
}

impl JwtSessionProvider {
    pub fn new(cookie_name: impl Into<String>, secret: &[u8]) -> Self {
        Self {
            cookie_name: cookie_name.into(),
            key: DecodingKey::from_secret(secret),
        }
    }
}

#[async_trait]
impl SessionProvider for JwtSessionProvider {
    async fn current_session(&self, headers: &HeaderMap) -> Result<Option<Session>, SessionError> {
        let Some(token) = cookie_value(headers, &self.cookie_name) else {
            return Ok(None);
        };
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_aud = false;

        match decode::<SessionClaims>(&token, &self.key, &validation) {
            Ok(data) if !data.claims.sub.is_empty() => Ok(Some(Session {
                subject: data.claims.sub,
                email: data.claims.email,
                name: data.claims.name,
                picture: data.claims.picture,
            })),
            Ok(_) => Ok(None),
            Err(e) => {
                tracing::debug!(error = %e, "ignoring invalid session cookie");
                Ok(None)
            }
        }
    }
}

/// Session token looked up in the `session` table.
#[derive(Clone)]
pub struct DbSessionProvider {
    db: Arc<DatabaseConnection>,
    cookie_name: String,
}

impl DbSessionProvider {
    pub fn new(db: Arc<DatabaseConnection>, cookie_name: impl Into<String>) -> Self {
        Self {
            db,
            cookie_name: cookie_name.into(),
        }
    }
}

#[async_trait]
impl SessionProvider for DbSessionProvider {
    async fn current_session(&self, headers: &HeaderMap) -> Result<Option<Session>, SessionError> {
        let Some(token) = cookie_value(headers, &self.cookie_name) else {
            return Ok(None);
        };
        let found = session::Entity::find_by_id(token)
            .find_also_related(user::Entity)
            .one(self.db.as_ref())
            .await?;

        Ok(match found {
            Some((s, Some(u))) if s.expires > OffsetDateTime::now_utc() => {
                Some(UserProfile::from(u).into())
            }
            _ => None,
        })
    }
}

/// SeaORM-backed user directory.
#[derive(Clone)]
pub struct DbUserDirectory {
    db: Arc<DatabaseConnection>,
}

impl DbUserDirectory {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserDirectory for DbUserDirectory {
    async fn find_user(&self, subject: &str) -> Result<Option<UserProfile>, SessionError> {
        Ok(user::Entity::find_by_id(subject)
            .one(self.db.as_ref())
            .await?
            .map(UserProfile::from))
    }
}
