use oidc_bridge::AppResources;
use oidc_bridge::api::start_webserver;
use oidc_bridge::config::load_config_or_panic;
use oidc_bridge::oauth2::{OAuth2State, spawn_code_purge_task};
use sea_orm::Database;
use std::sync::Arc;
use tokio::time::Duration;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// How often expired authorization codes are swept from storage.
const CODE_PURGE_INTERVAL: Duration = Duration::from_secs(300);

fn initialize_standard_tracing() {
    let default_directives = "oidc_bridge=info,tower_http=info,sea_orm=warn";
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));

    let registry = tracing_subscriber::registry().with(env_filter);
    let layer = fmt::layer().with_target(true).with_level(true);

    registry.with(layer).init();
}

#[tokio::main]
async fn main() -> color_eyre::eyre::Result<()> {
    color_eyre::install()?;
    // A missing .env is fine; real deployments use the environment directly
    let _ = dotenvy::dotenv();

    initialize_standard_tracing();

    // Load config
    let config = Arc::new(load_config_or_panic());

    // Set up SeaORM database connection
    let db = Arc::new(Database::connect(&config.database_url).await?);

    let oauth2_state = OAuth2State::from_config(&config, db.clone())?;
    tracing::info!(
        issuer = %oauth2_state.settings.issuer_url,
        algorithm = ?oauth2_state.signer.algorithm(),
        token_lifetime_secs = oauth2_state.settings.token_lifetime.whole_seconds(),
        code_lifetime_secs = oauth2_state.settings.code_lifetime.whole_seconds(),
        "oauth2 configuration"
    );

    // Start background cleanup task for expired authorization codes
    spawn_code_purge_task(oauth2_state.codes.clone(), CODE_PURGE_INTERVAL);

    let resources = AppResources { db, config };
    start_webserver(resources, oauth2_state).await?;

    Ok(())
}
