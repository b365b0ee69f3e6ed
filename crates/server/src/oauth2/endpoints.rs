//! OAuth2 HTTP endpoints.
//!
//! Implements the authorization server endpoints:
//! - Authorization endpoint (binds the current session to a one-time code)
//! - Token endpoint (exchanges code + PKCE verifier for the bound token)
//! - UserInfo (OpenID Connect)
//! - Discovery document and JWKS

use crate::config::TokenField;
use crate::error::{ErrorResponse, OAuthError};
use crate::oauth2::clients::{ClientAuthError, extract_client_credentials};
use crate::oauth2::codes::{AuthorizationCode, CodeStoreError, generate_code};
use crate::oauth2::keys::{Jwks, TokenClaims};
use crate::oauth2::session::Session;
use crate::oauth2::state::{DEFAULT_SCOPE, OAuth2Settings, OAuth2State};
use crate::oauth2::OAUTH2_TAG;
use axum::{
    Form, Json,
    extract::{FromRequest, OriginalUri, Query, Request, State, rejection::QueryRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use utoipa::ToSchema;
use utoipa_axum::{router::OpenApiRouter, routes};

/// Creates the OAuth2 router, mounted under `/oauth2`.
pub fn router(state: OAuth2State) -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(authorize))
        .routes(routes!(token))
        .routes(routes!(userinfo))
        .with_state(state)
}

/// Creates the `/.well-known` discovery router, mounted at the root.
pub fn well_known_router(state: OAuth2State) -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(openid_configuration))
        .routes(routes!(jwks))
        .with_state(state)
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// OAuth2 authorization request parameters.
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct AuthorizeRequest {
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    /// Must be "code"
    pub response_type: Option<String>,
    /// Opaque value echoed back unmodified
    pub state: Option<String>,
    pub code_challenge: Option<String>,
    /// Must be "S256" (case-insensitive)
    pub code_challenge_method: Option<String>,
    /// Space-separated scopes; defaults to `openid email profile`
    pub scope: Option<String>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct TokenRequest {
    pub grant_type: Option<String>,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub code_verifier: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TokenResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    pub token_type: String,
    /// Seconds until the returned token expires
    pub expires_in: i64,
    pub scope: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UserInfoResponse {
    pub sub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    pub scope: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct OpenIdConfiguration {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,
    pub response_types_supported: Vec<String>,
    pub grant_types_supported: Vec<String>,
    pub subject_types_supported: Vec<String>,
    pub id_token_signing_alg_values_supported: Vec<String>,
    pub scopes_supported: Vec<String>,
    pub claims_supported: Vec<String>,
    pub token_endpoint_auth_methods_supported: Vec<String>,
    pub code_challenge_methods_supported: Vec<String>,
}

/// Result of an authorization request.
#[derive(Debug)]
pub enum AuthorizeOutcome {
    /// No session yet: send the user to sign in, then back to the same request.
    Redirect(String),
    /// The request itself is unacceptable.
    JsonError(OAuthError),
    /// A code was issued: send the user back to the client.
    Success(String),
}

impl IntoResponse for AuthorizeOutcome {
    fn into_response(self) -> Response {
        match self {
            AuthorizeOutcome::Redirect(location) | AuthorizeOutcome::Success(location) => {
                found(&location)
            }
            AuthorizeOutcome::JsonError(err) => err.into_response(),
        }
    }
}

fn found(location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => (StatusCode::FOUND, [(header::LOCATION, value)]).into_response(),
        Err(_) => OAuthError::invalid_request("redirect target is not a valid header value")
            .into_response(),
    }
}

/// Token request body, accepted as either form or JSON.
pub struct TokenForm(pub TokenRequest);

impl<S> FromRequest<S> for TokenForm
where
    S: Send + Sync,
{
    type Rejection = OAuthError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_json = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/json"));

        if is_json {
            let Json(params) = Json::<TokenRequest>::from_request(req, state)
                .await
                .map_err(|e| OAuthError::invalid_request(e.body_text()))?;
            Ok(Self(params))
        } else {
            let Form(params) = Form::<TokenRequest>::from_request(req, state)
                .await
                .map_err(|e| OAuthError::invalid_request(e.body_text()))?;
            Ok(Self(params))
        }
    }
}

// =============================================================================
// Endpoints
// =============================================================================

/// OAuth2 Authorization endpoint.
///
/// Binds the caller's first-party session to a one-time code. The bearer token
/// is signed here and stored alongside the code, so the token endpoint only
/// has to hand it out.
#[tracing::instrument(skip_all)]
#[utoipa::path(
    get,
    path = "/authorize",
    tag = OAUTH2_TAG,
    operation_id = "OAuth2 Authorize",
    summary = "Issue an authorization code for the current session",
    description = "Validates the authorization request and, if the browser carries a valid session, \
                   redirects back to `redirect_uri` with a one-time `code` and the original `state`.\n\n\
                   Without a session the user is redirected to the sign-in page with the original \
                   request URL as `callbackUrl`.\n\n\
                   **PKCE:** `code_challenge` and `code_challenge_method=S256` are mandatory; `plain` \
                   is not supported.",
    params(
        ("client_id" = String, Query, description = "The client identifier."),
        ("redirect_uri" = String, Query, description = "Where to send the code. Must match the configured pattern and, for registered clients, a registered URI."),
        ("response_type" = String, Query, description = "Must be `code`."),
        ("state" = Option<String>, Query, description = "Opaque value returned unchanged in the redirect."),
        ("code_challenge" = String, Query, description = "Base64url-encoded SHA-256 of the code_verifier."),
        ("code_challenge_method" = String, Query, description = "Must be `S256`."),
        ("scope" = Option<String>, Query, description = "Space-separated scopes. Defaults to `openid email profile`."),
    ),
    responses(
        (status = 302, description = "Redirect to the client with a code, or to the sign-in page"),
        (status = 400, description = "Invalid authorization request", body = ErrorResponse),
    )
)]
pub async fn authorize(
    State(state): State<OAuth2State>,
    OriginalUri(original_uri): OriginalUri,
    headers: HeaderMap,
    params: Result<Query<AuthorizeRequest>, QueryRejection>,
) -> AuthorizeOutcome {
    let params = match params {
        Ok(Query(p)) => p,
        Err(e) => return AuthorizeOutcome::JsonError(OAuthError::invalid_request(e.body_text())),
    };
    let callback = original_uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| original_uri.path().to_string());

    match process_authorize(&state, &params, &headers, &callback).await {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::info!(
                client_id = params.client_id.as_deref().unwrap_or_default(),
                error = %err,
                "authorization request rejected"
            );
            AuthorizeOutcome::JsonError(err)
        }
    }
}

async fn process_authorize(
    state: &OAuth2State,
    params: &AuthorizeRequest,
    headers: &HeaderMap,
    callback: &str,
) -> Result<AuthorizeOutcome, OAuthError> {
    let client_id = required(&params.client_id, "client_id")?;
    let redirect_uri = required(&params.redirect_uri, "redirect_uri")?;
    let response_type = required(&params.response_type, "response_type")?;
    let code_challenge = required(&params.code_challenge, "code_challenge")?.trim();
    let method = required(&params.code_challenge_method, "code_challenge_method")?;

    if response_type != "code" {
        return Err(OAuthError::UnsupportedResponseType);
    }
    if !method.eq_ignore_ascii_case("S256") {
        return Err(OAuthError::invalid_request(
            "Only PKCE code_challenge_method S256 is supported",
        ));
    }
    if !state.redirect_uri_permitted(redirect_uri) {
        return Err(OAuthError::invalid_request("redirect_uri is not permitted"));
    }
    let mut redirect_url = url::Url::parse(redirect_uri)
        .map_err(|_| OAuthError::invalid_request("redirect_uri must be an absolute URL"))?;
    let allowed = state
        .clients
        .redirect_allowed(client_id, redirect_uri)
        .await
        .map_err(OAuthError::server_error)?;
    if !allowed {
        return Err(OAuthError::invalid_request(
            "redirect_uri is not registered for this client",
        ));
    }

    tracing::info!(client_id, redirect_uri, "authorization request");

    let Some(session) = state
        .sessions
        .current_session(headers)
        .await
        .map_err(OAuthError::server_error)?
    else {
        return Ok(AuthorizeOutcome::Redirect(signin_location(
            &state.settings.signin_url,
            callback,
        )));
    };

    let scope = params
        .scope
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_SCOPE);
    let claims = claims_for_session(&state.settings, client_id, scope, &session);
    let bound_token = state
        .signer
        .sign(claims, state.settings.token_lifetime)
        .map_err(OAuthError::server_error)?;

    let code = generate_code().map_err(OAuthError::server_error)?;
    let now = OffsetDateTime::now_utc();
    let record = AuthorizationCode {
        code: code.clone(),
        client_id: client_id.to_string(),
        redirect_uri: redirect_uri.to_string(),
        code_challenge: code_challenge.to_string(),
        scope: scope.to_string(),
        bound_token,
        created_at: now,
        expires_at: now + state.settings.code_lifetime,
    };
    state
        .codes
        .put(record)
        .await
        .map_err(OAuthError::server_error)?;

    redirect_url.query_pairs_mut().append_pair("code", &code);
    if let Some(s) = &params.state {
        redirect_url.query_pairs_mut().append_pair("state", s);
    }

    tracing::info!(client_id, subject = %session.subject, "authorization code issued");
    Ok(AuthorizeOutcome::Success(redirect_url.into()))
}

/// OAuth2 Token endpoint.
#[tracing::instrument(skip_all)]
#[utoipa::path(
    post,
    path = "/token",
    tag = OAUTH2_TAG,
    operation_id = "OAuth2 Token",
    summary = "Exchange an authorization code for the bound token",
    description = "Exchanges a one-time authorization code plus its PKCE `code_verifier` for the \
                   token signed at authorization time. The code is consumed whether or not the \
                   exchange succeeds.\n\n\
                   **Client authentication:** HTTP Basic or `client_id`/`client_secret` in the body.\n\n\
                   All code, redirect and PKCE failures return the same `invalid_grant` error.",
    request_body(
        content = TokenRequest,
        content_type = "application/x-www-form-urlencoded",
        description = "Token request parameters (JSON is accepted as well)"
    ),
    responses(
        (status = 200, description = "Token issued", body = TokenResponse),
        (status = 400, description = "invalid_request, invalid_client, unsupported_grant_type or invalid_grant", body = ErrorResponse),
        (status = 405, description = "Method other than POST", body = ErrorResponse),
    )
)]
pub async fn token(
    State(state): State<OAuth2State>,
    headers: HeaderMap,
    form: Result<TokenForm, OAuthError>,
) -> Result<Json<TokenResponse>, OAuthError> {
    let TokenForm(params) = form?;

    let credentials = extract_client_credentials(
        &headers,
        params.client_id.as_deref(),
        params.client_secret.as_deref(),
    );
    let client_id = state
        .clients
        .authenticate_credentials(&credentials)
        .await
        .map_err(|e| match e {
            ClientAuthError::Storage(db) => OAuthError::server_error(db),
            other => {
                tracing::info!(
                    client_id = credentials.client_id.as_deref().unwrap_or_default(),
                    reason = %other,
                    "client authentication failed"
                );
                OAuthError::InvalidClient
            }
        })?;

    let grant_type = required(&params.grant_type, "grant_type")?;
    let code = required(&params.code, "code")?;
    let redirect_uri = required(&params.redirect_uri, "redirect_uri")?;
    let code_verifier = required(&params.code_verifier, "code_verifier")?;

    if grant_type != "authorization_code" {
        return Err(OAuthError::UnsupportedGrantType);
    }

    let record = match state.codes.find_and_delete(code).await {
        Ok(record) => record,
        Err(CodeStoreError::Storage(e)) => return Err(OAuthError::server_error(e)),
        Err(_) => return Err(reject_grant(&client_id, "code not found, expired or used")),
    };
    if record.client_id != client_id {
        return Err(reject_grant(&client_id, "code was issued to another client"));
    }
    if record.redirect_uri != redirect_uri {
        return Err(reject_grant(&client_id, "redirect_uri mismatch"));
    }
    if !record.verify_pkce(code_verifier) {
        return Err(reject_grant(&client_id, "PKCE code_verifier mismatch"));
    }

    let claims = state.signer.verify(&record.bound_token).map_err(|e| {
        tracing::warn!(client_id = %client_id, error = %e, "bound token failed verification");
        OAuthError::InvalidGrant
    })?;
    let expires_in = claims.remaining_lifetime(OffsetDateTime::now_utc());

    let (access_token, id_token) = match state.settings.token_field {
        TokenField::AccessToken => (Some(record.bound_token), None),
        TokenField::IdToken => (None, Some(record.bound_token)),
        TokenField::Both => (Some(record.bound_token.clone()), Some(record.bound_token)),
    };

    tracing::info!(client_id = %client_id, subject = %claims.sub, "authorization code exchanged");
    Ok(Json(TokenResponse {
        access_token,
        id_token,
        token_type: "Bearer".to_string(),
        expires_in,
        scope: record.scope,
    }))
}

/// OpenID Connect UserInfo endpoint.
#[tracing::instrument(skip_all)]
#[utoipa::path(
    get,
    path = "/userinfo",
    tag = OAUTH2_TAG,
    operation_id = "OpenID Connect UserInfo",
    summary = "Get the token subject's profile",
    description = "Returns claims about the token's subject, filtered by the token's scope:\n\
                   - `email`: `email`\n\
                   - `profile`: `name`, `picture`\n\n\
                   When live revalidation is enabled, claims come from the user directory instead \
                   of the token.",
    security(
        ("bearer_auth" = [])
    ),
    responses(
        (status = 200, description = "User profile information", body = UserInfoResponse),
        (status = 401, description = "Missing, invalid or expired bearer token", body = ErrorResponse),
        (status = 404, description = "Subject no longer exists", body = ErrorResponse),
    )
)]
pub async fn userinfo(
    State(state): State<OAuth2State>,
    headers: HeaderMap,
) -> Result<Json<UserInfoResponse>, OAuthError> {
    let access_token = bearer_token(&headers).ok_or(OAuthError::InvalidToken(
        "Missing or invalid Authorization header",
    ))?;

    let claims = state.signer.verify(access_token).map_err(|e| {
        tracing::debug!(error = %e, "rejected bearer token");
        OAuthError::InvalidToken("Invalid or expired token")
    })?;
    if claims.sub.is_empty() {
        return Err(OAuthError::InvalidToken("Invalid token (missing sub)"));
    }

    let (name, email, picture) = if state.settings.revalidate_userinfo {
        let user = state
            .users
            .find_user(&claims.sub)
            .await
            .map_err(OAuthError::server_error)?
            .ok_or(OAuthError::NotFound("User not found"))?;
        (user.name, user.email, user.picture)
    } else {
        (claims.name.clone(), claims.email.clone(), claims.picture.clone())
    };

    let profile = claims.has_scope("profile");
    Ok(Json(UserInfoResponse {
        email: email.filter(|_| claims.has_scope("email")),
        name: name.filter(|_| profile),
        picture: picture.filter(|_| profile),
        sub: claims.sub,
        scope: claims.scope,
    }))
}

/// OpenID Connect Discovery document.
#[tracing::instrument(skip(state))]
#[utoipa::path(
    get,
    path = "/.well-known/openid-configuration",
    tag = OAUTH2_TAG,
    operation_id = "OpenID Connect Discovery",
    summary = "OpenID Connect Discovery document",
    description = "Returns the provider metadata: endpoint URLs, supported response and grant \
                   types, scopes, claims and PKCE methods. `jwks_uri` is only present when tokens \
                   are signed with an asymmetric key.",
    responses(
        (status = 200, description = "OpenID Connect configuration document", body = OpenIdConfiguration),
    )
)]
pub async fn openid_configuration(State(state): State<OAuth2State>) -> Json<OpenIdConfiguration> {
    let settings = &state.settings;
    let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();

    Json(OpenIdConfiguration {
        issuer: settings.issuer_url.clone(),
        authorization_endpoint: settings.endpoint("/oauth2/authorize"),
        token_endpoint: settings.endpoint("/oauth2/token"),
        userinfo_endpoint: settings.endpoint("/oauth2/userinfo"),
        jwks_uri: state.signer.jwk().map(|_| settings.endpoint("/.well-known/jwks.json")),
        response_types_supported: strings(&["code"]),
        grant_types_supported: strings(&["authorization_code"]),
        subject_types_supported: strings(&["public"]),
        id_token_signing_alg_values_supported: vec![format!("{:?}", state.signer.algorithm())],
        scopes_supported: strings(&["openid", "profile", "email"]),
        claims_supported: strings(&["sub", "name", "email", "picture"]),
        token_endpoint_auth_methods_supported: strings(&[
            "client_secret_basic",
            "client_secret_post",
        ]),
        code_challenge_methods_supported: strings(&["S256"]),
    })
}

/// JSON Web Key Set for verifying issued tokens.
#[tracing::instrument(skip(state))]
#[utoipa::path(
    get,
    path = "/.well-known/jwks.json",
    tag = OAUTH2_TAG,
    operation_id = "JWKS",
    summary = "Public signing keys",
    responses(
        (status = 200, description = "Key set with the active RSA key", body = Jwks),
        (status = 404, description = "Tokens are signed with a shared secret; no public key exists", body = ErrorResponse),
    )
)]
pub async fn jwks(State(state): State<OAuth2State>) -> Result<Json<Jwks>, OAuthError> {
    let jwk = state
        .signer
        .jwk()
        .ok_or(OAuthError::NotFound("No public signing key is published"))?;
    Ok(Json(Jwks { keys: vec![jwk] }))
}

/// Fallback for a known path hit with an unsupported method.
pub async fn method_not_allowed() -> OAuthError {
    OAuthError::MethodNotAllowed
}

// =============================================================================
// Helper Functions
// =============================================================================

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, OAuthError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| OAuthError::invalid_request(format!("{name} is required")))
}

fn reject_grant(client_id: &str, reason: &'static str) -> OAuthError {
    tracing::info!(client_id, reason, "token exchange rejected");
    OAuthError::InvalidGrant
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("Bearer") && !token.is_empty()).then_some(token)
}

fn signin_location(signin_url: &str, callback: &str) -> String {
    let separator = if signin_url.contains('?') { '&' } else { '?' };
    format!(
        "{signin_url}{separator}callbackUrl={}",
        urlencoding::encode(callback)
    )
}

/// Claims for a token bound to `session`, gated by `scope`.
pub fn claims_for_session(
    settings: &OAuth2Settings,
    client_id: &str,
    scope: &str,
    session: &Session,
) -> TokenClaims {
    let has = |wanted: &str| scope.split_whitespace().any(|s| s == wanted);
    let profile = has("profile");
    TokenClaims {
        sub: session.subject.clone(),
        iss: settings.issuer_url.clone(),
        aud: client_id.to_string(),
        client_id: client_id.to_string(),
        scope: scope.to_string(),
        email: session.email.clone().filter(|_| has("email")),
        name: session.name.clone().filter(|_| profile),
        picture: session.picture.clone().filter(|_| profile),
        iat: 0,
        exp: 0,
        jti: String::new(),
    }
}
