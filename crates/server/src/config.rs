use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration build error: {0}")]
    Build(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Minimum length of any shared HMAC secret, in bytes.
pub const MIN_SECRET_LEN: usize = 32;

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    pub oauth2: OAuth2Config,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct OAuth2Config {
    /// Base URL of this provider; used as `iss` and for discovery.
    pub issuer_url: String,
    /// Lifetime of issued bearer tokens, in seconds.
    #[serde(default = "default_token_lifetime")]
    pub token_lifetime: i64,
    /// Lifetime of authorization codes, in seconds.
    #[serde(default = "default_code_lifetime")]
    pub code_lifetime: i64,
    /// Optional regex every `redirect_uri` must match at the authorize endpoint.
    #[serde(default)]
    pub redirect_uri_pattern: Option<String>,
    /// Where unauthenticated users are sent; `callbackUrl` is appended.
    #[serde(default = "default_signin_url")]
    pub signin_url: String,
    #[serde(default)]
    pub token_field: TokenField,
    /// Reload the user from the directory on every userinfo request.
    #[serde(default)]
    pub revalidate_userinfo: bool,
    pub signing: SigningConfig,
    #[serde(default)]
    pub client_auth: ClientAuthConfig,
    #[serde(default)]
    pub code_store: CodeStoreConfig,
}

/// Key material used to sign bearer tokens.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SigningConfig {
    Hmac {
        secret: String,
    },
    /// PEM strings, either raw or base64-encoded.
    Rsa {
        private_key: String,
        public_key: String,
        #[serde(default = "default_key_id")]
        key_id: String,
    },
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientAuthConfig {
    /// Clients are looked up in the `oauth2_client` table.
    #[default]
    Registry,
    /// Client secrets are `hex(HMAC-SHA256(secret, client_id))`.
    Derived { secret: String },
}

/// Where pending authorization codes live.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CodeStoreConfig {
    /// The `oauth2_authorization_code` table; safe across replicas.
    #[default]
    Database,
    /// Process memory. Codes do not survive a restart and are not shared
    /// between instances.
    Memory,
}

/// Which field(s) of the token response carry the bound token.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TokenField {
    #[default]
    AccessToken,
    IdToken,
    Both,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    #[serde(default)]
    pub strategy: SessionStrategy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_cookie_name(),
            strategy: SessionStrategy::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionStrategy {
    /// Cookie carries an opaque token looked up in the `session` table.
    #[default]
    Database,
    /// Cookie carries an HS256-signed JWT.
    Jwt { secret: String },
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_token_lifetime() -> i64 {
    30 * 24 * 60 * 60
}

fn default_code_lifetime() -> i64 {
    10 * 60
}

fn default_signin_url() -> String {
    "/api/auth/signin".to_string()
}

fn default_key_id() -> String {
    "rsa-key-1".to_string()
}

fn default_cookie_name() -> String {
    "session_token".to_string()
}

impl AppConfig {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let oauth2 = &self.oauth2;
        if oauth2.issuer_url.trim().is_empty() {
            return Err(ConfigError::Validation(
                "oauth2.issuer_url must not be empty".into(),
            ));
        }
        if oauth2.token_lifetime <= 0 {
            return Err(ConfigError::Validation(
                "oauth2.token_lifetime must be > 0".into(),
            ));
        }
        if oauth2.code_lifetime <= 0 {
            return Err(ConfigError::Validation(
                "oauth2.code_lifetime must be > 0".into(),
            ));
        }
        if let Some(pattern) = &oauth2.redirect_uri_pattern {
            Regex::new(pattern).map_err(|e| {
                ConfigError::Validation(format!("oauth2.redirect_uri_pattern is invalid: {e}"))
            })?;
        }
        if let SigningConfig::Hmac { secret } = &oauth2.signing {
            check_secret("oauth2.signing.secret", secret)?;
        }
        if let ClientAuthConfig::Derived { secret } = &oauth2.client_auth {
            check_secret("oauth2.client_auth.secret", secret)?;
        }
        if let SessionStrategy::Jwt { secret } = &self.session.strategy {
            check_secret("session.strategy.secret", secret)?;
        }
        if self.session.cookie_name.is_empty() {
            return Err(ConfigError::Validation(
                "session.cookie_name must not be empty".into(),
            ));
        }
        Ok(())
    }
}

fn check_secret(field: &str, secret: &str) -> Result<(), ConfigError> {
    if secret.len() < MIN_SECRET_LEN {
        return Err(ConfigError::Validation(format!(
            "{field} must be at least {MIN_SECRET_LEN} bytes"
        )));
    }
    Ok(())
}

/// Load application configuration from `config.yaml` + environment overrides.
///
/// The file is optional. Any environment variable matching the key path
/// separated by double underscores (e.g. `OAUTH2__SIGNING__SECRET`) overrides
/// the file value.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    use config::{Config, Environment, File};
    let cfg = Config::builder()
        .add_source(File::with_name("config.yaml").required(false))
        .add_source(Environment::default().separator("__"))
        .build()?;

    let app: AppConfig = cfg.try_deserialize()?;
    app.validate()?;
    Ok(app)
}

/// Convenience helper for binaries wanting panic-on-error behaviour.
pub fn load_config_or_panic() -> AppConfig {
    match load_config() {
        Ok(c) => c,
        Err(e) => panic!("Failed to load configuration: {e}"),
    }
}
