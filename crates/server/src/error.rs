//! Protocol-level errors and their HTTP rendering.
//!
//! Every handler in this crate returns its failures as an [`OAuthError`], which
//! renders as `{"error": ..., "error_description": ...}` with the status code
//! OAuth2 prescribes for it.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unsupported response type")]
    UnsupportedResponseType,
    #[error("unsupported grant type")]
    UnsupportedGrantType,
    #[error("invalid client")]
    InvalidClient,
    /// Covers unknown, expired and consumed codes as well as redirect and
    /// PKCE mismatches. Rendered without a description.
    #[error("invalid grant")]
    InvalidGrant,
    #[error("invalid token: {0}")]
    InvalidToken(&'static str),
    #[error("not found: {0}")]
    NotFound(&'static str),
    #[error("method not allowed")]
    MethodNotAllowed,
    /// Internal failure; the message is logged but never sent to the client.
    #[error("server error: {0}")]
    ServerError(String),
}

/// JSON body of every error response.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl OAuthError {
    pub fn invalid_request(description: impl Into<String>) -> Self {
        Self::InvalidRequest(description.into())
    }

    pub fn server_error(description: impl std::fmt::Display) -> Self {
        Self::ServerError(description.to_string())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            OAuthError::InvalidRequest(_)
            | OAuthError::UnsupportedResponseType
            | OAuthError::UnsupportedGrantType
            | OAuthError::InvalidClient
            | OAuthError::InvalidGrant => StatusCode::BAD_REQUEST,
            OAuthError::InvalidToken(_) => StatusCode::UNAUTHORIZED,
            OAuthError::NotFound(_) => StatusCode::NOT_FOUND,
            OAuthError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            OAuthError::ServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The OAuth2 `error` code.
    pub fn code(&self) -> &'static str {
        match self {
            OAuthError::InvalidRequest(_) => "invalid_request",
            OAuthError::UnsupportedResponseType => "unsupported_response_type",
            OAuthError::UnsupportedGrantType => "unsupported_grant_type",
            OAuthError::InvalidClient => "invalid_client",
            OAuthError::InvalidGrant => "invalid_grant",
            OAuthError::InvalidToken(_) => "invalid_token",
            OAuthError::NotFound(_) => "not_found",
            OAuthError::MethodNotAllowed => "method_not_allowed",
            OAuthError::ServerError(_) => "server_error",
        }
    }

    fn description(&self) -> Option<String> {
        match self {
            OAuthError::InvalidRequest(d) => Some(d.clone()),
            OAuthError::InvalidToken(d) | OAuthError::NotFound(d) => Some((*d).to_string()),
            _ => None,
        }
    }

    pub fn to_body(&self) -> ErrorResponse {
        ErrorResponse {
            error: self.code().to_string(),
            error_description: self.description(),
        }
    }
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        if let OAuthError::ServerError(detail) = &self {
            tracing::error!(error = %detail, "request failed with server error");
        }
        let mut response = (self.status(), Json(self.to_body())).into_response();
        if matches!(self, OAuthError::InvalidToken(_)) {
            response.headers_mut().insert(
                axum::http::header::WWW_AUTHENTICATE,
                axum::http::HeaderValue::from_static("Bearer"),
            );
        }
        response
    }
}
