//! OAuth2 endpoint tests.
//!
//! Drives the full router: authorize with a first-party session, exchange the
//! code at the token endpoint, then read the profile from userinfo.

use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum_test::{TestResponse, TestServer};
use base64::Engine;
use config::{Config, File, FileFormat};
use oidc_bridge::{
    AppResources,
    api::build_router,
    config::{AppConfig, TokenField},
    entity::{authorization_code, oauth2_client, session, user},
    oauth2::{OAuth2State, keys::TokenClaims},
};
use sea_orm::{
    ActiveModelTrait, ConnectionTrait, Database, DatabaseConnection, DbBackend, EntityTrait,
    Set, Statement,
};
use serde_json::{Value, json};
use std::future::IntoFuture;
use std::sync::Arc;
use time::OffsetDateTime;

const CLIENT_ID: &str = "client-a";
const CLIENT_SECRET: &str = "client-a-secret";
const REDIRECT_URI: &str = "https://app.example.com/callback";
/// RFC 7636 appendix B verifier
const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
const CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";
const SESSION_COOKIE: &str = "session_token=sess-u1";

const TEST_CONFIG: &str = r#"
database_url: "sqlite::memory:"
oauth2:
  issuer_url: "https://id.example.com/"
  token_lifetime: 3600
  redirect_uri_pattern: "^https://app\\.example\\.com/"
  signing:
    kind: hmac
    secret: "0123456789abcdef0123456789abcdef"
"#;

/// Create a test database with the identity and OAuth2 tables
async fn create_oauth2_test_db() -> DatabaseConnection {
    let db = Database::connect("sqlite::memory:").await.expect("connect");

    for ddl in [
        r#"CREATE TABLE "user" (
            id TEXT PRIMARY KEY,
            name TEXT NULL,
            email TEXT NULL,
            image TEXT NULL
        );"#,
        r#"CREATE TABLE session (
            session_token TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            expires TEXT NOT NULL
        );"#,
        r#"CREATE TABLE oauth2_client (
            id TEXT PRIMARY KEY,
            secret TEXT NOT NULL,
            name TEXT NOT NULL,
            redirect_uris TEXT NOT NULL,
            created_at TEXT NOT NULL
        );"#,
        r#"CREATE TABLE oauth2_authorization_code (
            code TEXT PRIMARY KEY,
            client_id TEXT NOT NULL,
            redirect_uri TEXT NOT NULL,
            code_challenge TEXT NOT NULL,
            scope TEXT NOT NULL,
            bound_token TEXT NOT NULL,
            created_at TEXT NOT NULL,
            expires_at TEXT NOT NULL
        );"#,
    ] {
        db.execute(Statement::from_string(DbBackend::Sqlite, ddl))
            .await
            .expect("create table");
    }

    let now = OffsetDateTime::now_utc();

    user::ActiveModel {
        id: Set("u1".into()),
        name: Set(Some("Ada".into())),
        email: Set(Some("a@x.com".into())),
        image: Set(Some("https://img.example.com/u1.png".into())),
    }
    .insert(&db)
    .await
    .expect("insert user");

    session::ActiveModel {
        session_token: Set("sess-u1".into()),
        user_id: Set("u1".into()),
        expires: Set(now + time::Duration::days(1)),
    }
    .insert(&db)
    .await
    .expect("insert session");

    session::ActiveModel {
        session_token: Set("sess-expired".into()),
        user_id: Set("u1".into()),
        expires: Set(now - time::Duration::minutes(1)),
    }
    .insert(&db)
    .await
    .expect("insert expired session");

    oauth2_client::ActiveModel {
        id: Set(CLIENT_ID.into()),
        secret: Set(CLIENT_SECRET.into()),
        name: Set("Client A".into()),
        redirect_uris: Set(format!(r#"["{REDIRECT_URI}"]"#)),
        created_at: Set(now),
    }
    .insert(&db)
    .await
    .expect("insert client");

    db
}

fn create_test_config(yaml: &str) -> AppConfig {
    let config: AppConfig = Config::builder()
        .add_source(File::from_str(yaml, FileFormat::Yaml))
        .build()
        .expect("build config")
        .try_deserialize()
        .expect("deserialize config");
    config.validate().expect("valid config");
    config
}

struct TestApp {
    server: TestServer,
    db: Arc<DatabaseConnection>,
    state: OAuth2State,
}

async fn create_test_app_with(yaml: &str, tweak: impl FnOnce(&mut OAuth2State)) -> TestApp {
    let db = Arc::new(create_oauth2_test_db().await);
    let config = Arc::new(create_test_config(yaml));
    let mut state = OAuth2State::from_config(&config, db.clone()).expect("oauth2 state");
    tweak(&mut state);

    let resources = AppResources {
        db: db.clone(),
        config,
    };
    let server = TestServer::new(build_router(resources, state.clone())).expect("create test server");
    TestApp { server, db, state }
}

async fn create_test_app() -> TestApp {
    create_test_app_with(TEST_CONFIG, |_| {}).await
}

fn authorize_params(scope: Option<&'static str>) -> Vec<(&'static str, &'static str)> {
    let mut params = vec![
        ("client_id", CLIENT_ID),
        ("redirect_uri", REDIRECT_URI),
        ("response_type", "code"),
        ("state", "xyz"),
        ("code_challenge", CHALLENGE),
        ("code_challenge_method", "S256"),
    ];
    if let Some(scope) = scope {
        params.push(("scope", scope));
    }
    params
}

fn cookie(value: &'static str) -> (HeaderName, HeaderValue) {
    (header::COOKIE, HeaderValue::from_static(value))
}

fn basic_auth(id: &str, secret: &str) -> HeaderValue {
    let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{id}:{secret}"));
    HeaderValue::from_str(&format!("Basic {encoded}")).unwrap()
}

fn location(response: &TestResponse) -> url::Url {
    let value = response.header("location");
    url::Url::parse(value.to_str().unwrap()).expect("absolute location")
}

fn query_value(url: &url::Url, key: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

/// Run the authorize step with a valid session and return the issued code.
async fn issue_code(server: &TestServer, scope: Option<&'static str>) -> String {
    let (name, value) = cookie(SESSION_COOKIE);
    let response = server
        .get("/oauth2/authorize")
        .add_query_params(authorize_params(scope))
        .add_header(name, value)
        .await;
    response.assert_status(StatusCode::FOUND);
    let url = location(&response);
    query_value(&url, "code").expect("code in redirect")
}

fn token_form(code: &str, verifier: &str, redirect_uri: &str) -> Vec<(&'static str, String)> {
    vec![
        ("grant_type", "authorization_code".to_string()),
        ("code", code.to_string()),
        ("redirect_uri", redirect_uri.to_string()),
        ("code_verifier", verifier.to_string()),
    ]
}

async fn exchange(server: &TestServer, code: &str) -> TestResponse {
    server
        .post("/oauth2/token")
        .add_header(header::AUTHORIZATION, basic_auth(CLIENT_ID, CLIENT_SECRET))
        .form(&token_form(code, VERIFIER, REDIRECT_URI))
        .await
}

fn assert_oauth_error(response: &TestResponse, status: StatusCode, error: &str) {
    response.assert_status(status);
    let body: Value = response.json();
    assert_eq!(body["error"], error, "unexpected body: {body}");
}

// =============================================================================
// Authorization Endpoint Tests
// =============================================================================

#[tokio::test]
async fn test_authorize_without_session_redirects_to_signin() {
    let app = create_test_app().await;

    let response = app
        .server
        .get("/oauth2/authorize")
        .add_query_params(authorize_params(None))
        .await;

    response.assert_status(StatusCode::FOUND);
    let target = response.header("location");
    let target = target.to_str().unwrap();
    let encoded = target
        .strip_prefix("/api/auth/signin?callbackUrl=")
        .expect("sign-in redirect");
    let callback = urlencoding::decode(encoded).unwrap();
    assert!(callback.starts_with("/oauth2/authorize?"), "{callback}");
    assert!(callback.contains("client_id=client-a"));
    assert!(callback.contains("state=xyz"));
    assert!(callback.contains(CHALLENGE));
}

#[tokio::test]
async fn test_authorize_with_expired_session_redirects_to_signin() {
    let app = create_test_app().await;
    let (name, value) = cookie("session_token=sess-expired");

    let response = app
        .server
        .get("/oauth2/authorize")
        .add_query_params(authorize_params(None))
        .add_header(name, value)
        .await;

    response.assert_status(StatusCode::FOUND);
    assert!(
        response
            .header("location")
            .to_str()
            .unwrap()
            .starts_with("/api/auth/signin?callbackUrl=")
    );
}

#[tokio::test]
async fn test_authorize_issues_single_code_bound_to_challenge() {
    let app = create_test_app().await;
    let (name, value) = cookie(SESSION_COOKIE);

    let response = app
        .server
        .get("/oauth2/authorize")
        .add_query_params(authorize_params(None))
        .add_header(name, value)
        .await;

    response.assert_status(StatusCode::FOUND);
    let url = location(&response);
    assert_eq!(url.origin().ascii_serialization(), "https://app.example.com");
    assert_eq!(url.path(), "/callback");
    assert_eq!(query_value(&url, "state").as_deref(), Some("xyz"));
    let code = query_value(&url, "code").expect("code");
    assert_eq!(code.len(), 64);
    assert!(code.chars().all(|c| c.is_ascii_hexdigit()));

    let stored = authorization_code::Entity::find()
        .all(app.db.as_ref())
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].code, code);
    assert_eq!(stored[0].scope, "openid email profile");
    assert!(stored[0].verify_pkce(VERIFIER));
    assert!(!stored[0].verify_pkce("another-verifier"));
}

#[tokio::test]
async fn test_authorize_omits_state_when_not_supplied() {
    let app = create_test_app().await;
    let (name, value) = cookie(SESSION_COOKIE);
    let params: Vec<_> = authorize_params(None)
        .into_iter()
        .filter(|(k, _)| *k != "state")
        .collect();

    let response = app
        .server
        .get("/oauth2/authorize")
        .add_query_params(params)
        .add_header(name, value)
        .await;

    response.assert_status(StatusCode::FOUND);
    let url = location(&response);
    assert!(query_value(&url, "code").is_some());
    assert!(query_value(&url, "state").is_none());
}

#[tokio::test]
async fn test_authorize_rejects_non_s256_methods() {
    let app = create_test_app().await;

    for method in ["plain", "S512", ""] {
        let params: Vec<_> = authorize_params(None)
            .into_iter()
            .map(|(k, v)| if k == "code_challenge_method" { (k, method) } else { (k, v) })
            .collect();
        let response = app
            .server
            .get("/oauth2/authorize")
            .add_query_params(params)
            .await;
        assert_oauth_error(&response, StatusCode::BAD_REQUEST, "invalid_request");
    }
}

#[tokio::test]
async fn test_authorize_accepts_lowercase_s256() {
    let app = create_test_app().await;
    let (name, value) = cookie(SESSION_COOKIE);
    let params: Vec<_> = authorize_params(None)
        .into_iter()
        .map(|(k, v)| if k == "code_challenge_method" { (k, "s256") } else { (k, v) })
        .collect();

    let response = app
        .server
        .get("/oauth2/authorize")
        .add_query_params(params)
        .add_header(name, value)
        .await;

    response.assert_status(StatusCode::FOUND);
    assert!(query_value(&location(&response), "code").is_some());
}

#[tokio::test]
async fn test_authorize_missing_parameter_is_invalid_request() {
    let app = create_test_app().await;

    for missing in [
        "client_id",
        "redirect_uri",
        "response_type",
        "code_challenge",
        "code_challenge_method",
    ] {
        let params: Vec<_> = authorize_params(None)
            .into_iter()
            .filter(|(k, _)| *k != missing)
            .collect();
        let response = app
            .server
            .get("/oauth2/authorize")
            .add_query_params(params)
            .await;
        assert_oauth_error(&response, StatusCode::BAD_REQUEST, "invalid_request");
    }
}

#[tokio::test]
async fn test_authorize_invalid_response_type() {
    let app = create_test_app().await;
    let params: Vec<_> = authorize_params(None)
        .into_iter()
        .map(|(k, v)| if k == "response_type" { (k, "token") } else { (k, v) })
        .collect();

    let response = app
        .server
        .get("/oauth2/authorize")
        .add_query_params(params)
        .await;

    assert_oauth_error(
        &response,
        StatusCode::BAD_REQUEST,
        "unsupported_response_type",
    );
}

#[tokio::test]
async fn test_authorize_rejects_redirect_outside_pattern() {
    let app = create_test_app().await;
    let (name, value) = cookie(SESSION_COOKIE);
    let params: Vec<_> = authorize_params(None)
        .into_iter()
        .map(|(k, v)| {
            if k == "redirect_uri" {
                (k, "https://evil.example.net/callback")
            } else {
                (k, v)
            }
        })
        .collect();

    let response = app
        .server
        .get("/oauth2/authorize")
        .add_query_params(params)
        .add_header(name, value)
        .await;

    assert_oauth_error(&response, StatusCode::BAD_REQUEST, "invalid_request");
}

#[tokio::test]
async fn test_authorize_rejects_unregistered_redirect() {
    let app = create_test_app().await;
    let (name, value) = cookie(SESSION_COOKIE);
    let params: Vec<_> = authorize_params(None)
        .into_iter()
        .map(|(k, v)| {
            if k == "redirect_uri" {
                (k, "https://app.example.com/other")
            } else {
                (k, v)
            }
        })
        .collect();

    let response = app
        .server
        .get("/oauth2/authorize")
        .add_query_params(params)
        .add_header(name, value)
        .await;

    assert_oauth_error(&response, StatusCode::BAD_REQUEST, "invalid_request");
    let stored = authorization_code::Entity::find()
        .all(app.db.as_ref())
        .await
        .unwrap();
    assert!(stored.is_empty());
}

// =============================================================================
// Token Endpoint Tests
// =============================================================================

#[tokio::test]
async fn test_full_flow_with_email_scope() {
    let app = create_test_app().await;
    let code = issue_code(&app.server, Some("openid email")).await;

    let response = exchange(&app.server, &code).await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["token_type"], "Bearer");
    assert_eq!(body["scope"], "openid email");
    assert!(body.get("id_token").is_none());
    let expires_in = body["expires_in"].as_i64().unwrap();
    assert!((3590..=3600).contains(&expires_in), "{expires_in}");

    let token = body["access_token"].as_str().unwrap().to_string();
    let claims: TokenClaims = app.state.signer.verify(&token).unwrap();
    assert_eq!(claims.sub, "u1");
    assert_eq!(claims.email.as_deref(), Some("a@x.com"));
    assert!(claims.name.is_none());
    assert!(claims.picture.is_none());
    assert_eq!(claims.iss, "https://id.example.com");
    assert_eq!(claims.aud, CLIENT_ID);

    let userinfo = app
        .server
        .get("/oauth2/userinfo")
        .add_header(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        )
        .await;
    userinfo.assert_status_ok();
    userinfo.assert_json(&json!({
        "sub": "u1",
        "email": "a@x.com",
        "scope": "openid email"
    }));
}

#[tokio::test]
async fn test_default_scope_includes_profile_claims() {
    let app = create_test_app().await;
    let code = issue_code(&app.server, None).await;

    let body: Value = exchange(&app.server, &code).await.json();
    let token = body["access_token"].as_str().unwrap();

    let userinfo: Value = app
        .server
        .get("/oauth2/userinfo")
        .add_header(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        )
        .await
        .json();
    assert_eq!(userinfo["sub"], "u1");
    assert_eq!(userinfo["name"], "Ada");
    assert_eq!(userinfo["email"], "a@x.com");
    assert_eq!(userinfo["picture"], "https://img.example.com/u1.png");
    assert_eq!(userinfo["scope"], "openid email profile");
}

#[tokio::test]
async fn test_code_cannot_be_replayed() {
    let app = create_test_app().await;
    let code = issue_code(&app.server, None).await;

    exchange(&app.server, &code).await.assert_status_ok();
    let replay = exchange(&app.server, &code).await;
    assert_oauth_error(&replay, StatusCode::BAD_REQUEST, "invalid_grant");
}

#[tokio::test]
async fn test_concurrent_exchanges_succeed_at_most_once() {
    let app = create_test_app().await;
    let code = issue_code(&app.server, None).await;

    let requests = (0..8).map(|_| {
        app.server
            .post("/oauth2/token")
            .add_header(header::AUTHORIZATION, basic_auth(CLIENT_ID, CLIENT_SECRET))
            .form(&token_form(&code, VERIFIER, REDIRECT_URI))
            .into_future()
    });
    let responses = futures::future::join_all(requests).await;

    let successes = responses
        .iter()
        .filter(|r| r.status_code() == StatusCode::OK)
        .count();
    assert_eq!(successes, 1);
    for response in responses.iter().filter(|r| r.status_code() != StatusCode::OK) {
        assert_oauth_error(response, StatusCode::BAD_REQUEST, "invalid_grant");
    }
}

#[tokio::test]
async fn test_expired_code_is_invalid_grant() {
    let app = create_test_app_with(TEST_CONFIG, |state| {
        let mut settings = (*state.settings).clone();
        settings.code_lifetime = time::Duration::seconds(-1);
        state.settings = Arc::new(settings);
    })
    .await;
    let code = issue_code(&app.server, None).await;

    let response = exchange(&app.server, &code).await;
    assert_oauth_error(&response, StatusCode::BAD_REQUEST, "invalid_grant");
}

#[tokio::test]
async fn test_wrong_verifier_is_bare_invalid_grant() {
    let app = create_test_app().await;
    let code = issue_code(&app.server, None).await;

    let response = app
        .server
        .post("/oauth2/token")
        .add_header(header::AUTHORIZATION, basic_auth(CLIENT_ID, CLIENT_SECRET))
        .form(&token_form(&code, "not-the-verifier", REDIRECT_URI))
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
    response.assert_json(&json!({ "error": "invalid_grant" }));

    // The failed attempt consumed the code
    let retry = exchange(&app.server, &code).await;
    assert_oauth_error(&retry, StatusCode::BAD_REQUEST, "invalid_grant");
}

#[tokio::test]
async fn test_redirect_uri_mismatch_is_invalid_grant() {
    let app = create_test_app().await;
    let code = issue_code(&app.server, None).await;

    let response = app
        .server
        .post("/oauth2/token")
        .add_header(header::AUTHORIZATION, basic_auth(CLIENT_ID, CLIENT_SECRET))
        .form(&token_form(&code, VERIFIER, "https://app.example.com/callback/"))
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
    response.assert_json(&json!({ "error": "invalid_grant" }));
}

#[tokio::test]
async fn test_code_issued_to_other_client_is_invalid_grant() {
    let app = create_test_app().await;
    oauth2_client::ActiveModel {
        id: Set("client-b".into()),
        secret: Set("client-b-secret".into()),
        name: Set("Client B".into()),
        redirect_uris: Set("[]".into()),
        created_at: Set(OffsetDateTime::now_utc()),
    }
    .insert(app.db.as_ref())
    .await
    .unwrap();
    let code = issue_code(&app.server, None).await;

    let response = app
        .server
        .post("/oauth2/token")
        .add_header(header::AUTHORIZATION, basic_auth("client-b", "client-b-secret"))
        .form(&token_form(&code, VERIFIER, REDIRECT_URI))
        .await;

    assert_oauth_error(&response, StatusCode::BAD_REQUEST, "invalid_grant");
}

#[tokio::test]
async fn test_client_secret_post_with_json_body() {
    let app = create_test_app().await;
    let code = issue_code(&app.server, None).await;

    let response = app
        .server
        .post("/oauth2/token")
        .json(&json!({
            "grant_type": "authorization_code",
            "code": code,
            "redirect_uri": REDIRECT_URI,
            "code_verifier": VERIFIER,
            "client_id": CLIENT_ID,
            "client_secret": CLIENT_SECRET,
        }))
        .await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert!(body["access_token"].is_string());
}

#[tokio::test]
async fn test_bad_client_credentials_are_invalid_client() {
    let app = create_test_app().await;
    let code = issue_code(&app.server, None).await;

    let wrong_secret = app
        .server
        .post("/oauth2/token")
        .add_header(header::AUTHORIZATION, basic_auth(CLIENT_ID, "guess"))
        .form(&token_form(&code, VERIFIER, REDIRECT_URI))
        .await;
    assert_oauth_error(&wrong_secret, StatusCode::BAD_REQUEST, "invalid_client");

    let no_credentials = app
        .server
        .post("/oauth2/token")
        .form(&token_form(&code, VERIFIER, REDIRECT_URI))
        .await;
    assert_oauth_error(&no_credentials, StatusCode::BAD_REQUEST, "invalid_client");

    let unknown_client = app
        .server
        .post("/oauth2/token")
        .add_header(header::AUTHORIZATION, basic_auth("nobody", "x"))
        .form(&token_form(&code, VERIFIER, REDIRECT_URI))
        .await;
    assert_oauth_error(&unknown_client, StatusCode::BAD_REQUEST, "invalid_client");

    // Client authentication failures never touch the code
    exchange(&app.server, &code).await.assert_status_ok();
}

#[tokio::test]
async fn test_token_missing_fields_and_grant_type() {
    let app = create_test_app().await;

    let missing_verifier = app
        .server
        .post("/oauth2/token")
        .add_header(header::AUTHORIZATION, basic_auth(CLIENT_ID, CLIENT_SECRET))
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", "abc"),
            ("redirect_uri", REDIRECT_URI),
        ])
        .await;
    assert_oauth_error(&missing_verifier, StatusCode::BAD_REQUEST, "invalid_request");

    let refresh = app
        .server
        .post("/oauth2/token")
        .add_header(header::AUTHORIZATION, basic_auth(CLIENT_ID, CLIENT_SECRET))
        .form(&[
            ("grant_type", "refresh_token"),
            ("code", "abc"),
            ("redirect_uri", REDIRECT_URI),
            ("code_verifier", VERIFIER),
        ])
        .await;
    assert_oauth_error(&refresh, StatusCode::BAD_REQUEST, "unsupported_grant_type");
}

#[tokio::test]
async fn test_token_endpoint_requires_post() {
    let app = create_test_app().await;

    let response = app.server.get("/oauth2/token").await;

    assert_oauth_error(
        &response,
        StatusCode::METHOD_NOT_ALLOWED,
        "method_not_allowed",
    );
}

#[tokio::test]
async fn test_token_field_both_returns_id_token() {
    let app = create_test_app_with(TEST_CONFIG, |state| {
        let mut settings = (*state.settings).clone();
        settings.token_field = TokenField::Both;
        state.settings = Arc::new(settings);
    })
    .await;
    let code = issue_code(&app.server, None).await;

    let body: Value = exchange(&app.server, &code).await.json();
    assert!(body["access_token"].is_string());
    assert_eq!(body["access_token"], body["id_token"]);
}

// =============================================================================
// UserInfo Endpoint Tests
// =============================================================================

#[tokio::test]
async fn test_userinfo_requires_bearer_token() {
    let app = create_test_app().await;

    let missing = app.server.get("/oauth2/userinfo").await;
    assert_oauth_error(&missing, StatusCode::UNAUTHORIZED, "invalid_token");
    assert_eq!(
        missing.headers().get(header::WWW_AUTHENTICATE).unwrap(),
        "Bearer"
    );

    let garbage = app
        .server
        .get("/oauth2/userinfo")
        .add_header(header::AUTHORIZATION, HeaderValue::from_static("Bearer nope"))
        .await;
    assert_oauth_error(&garbage, StatusCode::UNAUTHORIZED, "invalid_token");
}

#[tokio::test]
async fn test_userinfo_rejects_expired_token() {
    let app = create_test_app().await;
    let claims = TokenClaims {
        sub: "u1".into(),
        iss: "https://id.example.com".into(),
        aud: CLIENT_ID.into(),
        client_id: CLIENT_ID.into(),
        scope: "openid".into(),
        email: None,
        name: None,
        picture: None,
        iat: 0,
        exp: 0,
        jti: String::new(),
    };
    let token = app
        .state
        .signer
        .sign(claims, time::Duration::seconds(-10))
        .unwrap();

    let response = app
        .server
        .get("/oauth2/userinfo")
        .add_header(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        )
        .await;
    assert_oauth_error(&response, StatusCode::UNAUTHORIZED, "invalid_token");
}

#[tokio::test]
async fn test_userinfo_revalidation_reports_deleted_user() {
    let app = create_test_app_with(TEST_CONFIG, |state| {
        let mut settings = (*state.settings).clone();
        settings.revalidate_userinfo = true;
        state.settings = Arc::new(settings);
    })
    .await;
    let code = issue_code(&app.server, None).await;
    let body: Value = exchange(&app.server, &code).await.json();
    let bearer =
        HeaderValue::from_str(&format!("Bearer {}", body["access_token"].as_str().unwrap()))
            .unwrap();

    // Directory data wins over token claims
    user::ActiveModel {
        id: Set("u1".into()),
        name: Set(Some("Ada Lovelace".into())),
        ..Default::default()
    }
    .update(app.db.as_ref())
    .await
    .unwrap();
    let live: Value = app
        .server
        .get("/oauth2/userinfo")
        .add_header(header::AUTHORIZATION, bearer.clone())
        .await
        .json();
    assert_eq!(live["name"], "Ada Lovelace");

    session::Entity::delete_many()
        .exec(app.db.as_ref())
        .await
        .unwrap();
    user::Entity::delete_by_id("u1")
        .exec(app.db.as_ref())
        .await
        .unwrap();
    let gone = app
        .server
        .get("/oauth2/userinfo")
        .add_header(header::AUTHORIZATION, bearer)
        .await;
    assert_oauth_error(&gone, StatusCode::NOT_FOUND, "not_found");
}

// =============================================================================
// Alternative strategies
// =============================================================================

#[tokio::test]
async fn test_jwt_session_with_derived_client_secret() {
    use jsonwebtoken::{EncodingKey, Header, encode};
    use oidc_bridge::oauth2::DerivedClientAuthenticator;

    const CLIENT_AUTH_SECRET: &str = "derived-client-secret-0123456789";
    const SESSION_SECRET: &str = "session-cookie-secret-0123456789";
    let yaml = format!(
        r#"
database_url: "sqlite::memory:"
oauth2:
  issuer_url: "https://id.example.com"
  signing:
    kind: hmac
    secret: "0123456789abcdef0123456789abcdef"
  client_auth:
    kind: derived
    secret: "{CLIENT_AUTH_SECRET}"
session:
  cookie_name: "app_session"
  strategy:
    kind: jwt
    secret: "{SESSION_SECRET}"
"#
    );
    let app = create_test_app_with(&yaml, |_| {}).await;

    let exp = OffsetDateTime::now_utc().unix_timestamp() + 600;
    let session_jwt = encode(
        &Header::default(),
        &json!({ "sub": "u9", "email": "u9@x.com", "name": "Nine", "exp": exp }),
        &EncodingKey::from_secret(SESSION_SECRET.as_bytes()),
    )
    .unwrap();

    let response = app
        .server
        .get("/oauth2/authorize")
        .add_query_params(authorize_params(Some("openid profile")))
        .add_header(
            header::COOKIE,
            HeaderValue::from_str(&format!("app_session={session_jwt}")).unwrap(),
        )
        .await;
    response.assert_status(StatusCode::FOUND);
    let code = query_value(&location(&response), "code").unwrap();

    let client_secret =
        DerivedClientAuthenticator::new(CLIENT_AUTH_SECRET.as_bytes()).derive_secret(CLIENT_ID);
    let mut form = token_form(&code, VERIFIER, REDIRECT_URI);
    form.push(("client_id", CLIENT_ID.to_string()));
    form.push(("client_secret", client_secret));
    let token = app.server.post("/oauth2/token").form(&form).await;
    token.assert_status_ok();

    let body: Value = token.json();
    let claims = app
        .state
        .signer
        .verify(body["access_token"].as_str().unwrap())
        .unwrap();
    assert_eq!(claims.sub, "u9");
    assert_eq!(claims.name.as_deref(), Some("Nine"));
    assert!(claims.email.is_none());
}

#[tokio::test]
async fn test_memory_code_store_runs_full_flow() {
    let yaml = format!("{TEST_CONFIG}  code_store:\n    kind: memory\n");
    let app = create_test_app_with(&yaml, |_| {}).await;

    let code = issue_code(&app.server, Some("openid email")).await;
    // Nothing reaches the code table
    let stored = authorization_code::Entity::find()
        .all(app.db.as_ref())
        .await
        .unwrap();
    assert!(stored.is_empty());

    let response = exchange(&app.server, &code).await;
    response.assert_status_ok();
    let body: Value = response.json();
    let claims = app
        .state
        .signer
        .verify(body["access_token"].as_str().unwrap())
        .unwrap();
    assert_eq!(claims.sub, "u1");
    assert_eq!(claims.scope, "openid email");

    let replay = exchange(&app.server, &code).await;
    assert_oauth_error(&replay, StatusCode::BAD_REQUEST, "invalid_grant");
}

// =============================================================================
// Discovery & misc
// =============================================================================

#[tokio::test]
async fn test_discovery_with_hmac_has_no_jwks() {
    let app = create_test_app().await;

    let response = app.server.get("/.well-known/openid-configuration").await;
    response.assert_status_ok();
    let doc: Value = response.json();
    assert_eq!(doc["issuer"], "https://id.example.com");
    assert_eq!(
        doc["authorization_endpoint"],
        "https://id.example.com/oauth2/authorize"
    );
    assert_eq!(doc["token_endpoint"], "https://id.example.com/oauth2/token");
    assert_eq!(
        doc["userinfo_endpoint"],
        "https://id.example.com/oauth2/userinfo"
    );
    assert!(doc.get("jwks_uri").is_none());
    assert_eq!(doc["response_types_supported"], json!(["code"]));
    assert_eq!(doc["grant_types_supported"], json!(["authorization_code"]));
    assert_eq!(doc["code_challenge_methods_supported"], json!(["S256"]));
    assert_eq!(doc["id_token_signing_alg_values_supported"], json!(["HS256"]));

    let jwks = app.server.get("/.well-known/jwks.json").await;
    assert_oauth_error(&jwks, StatusCode::NOT_FOUND, "not_found");
}

#[tokio::test]
async fn test_health_check() {
    let app = create_test_app().await;

    let response = app.server.get("/healthz").await;
    response.assert_status_ok();
    response.assert_text("ok");
}
