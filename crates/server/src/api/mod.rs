//! API module providing the HTTP surface of the bridge.
//!
//! This module is organized into submodules:
//! - `health` - Health check endpoint (/healthz)
//! - `openapi` - OpenAPI/Utoipa configuration
//!
//! The OAuth2 endpoints themselves live in [`crate::oauth2::endpoints`].

pub mod health;
pub mod openapi;

pub use health::MISC_TAG;

use crate::AppResources;
use crate::oauth2::{self, OAuth2State};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_axum::{router::OpenApiRouter, routes};
use utoipa_redoc::{Redoc, Servable};

/// Builds the complete application router, including the API docs.
pub fn build_router(app_resources: AppResources, oauth2_state: OAuth2State) -> axum::Router {
    let (router, api) = OpenApiRouter::with_openapi(openapi::ApiDoc::openapi())
        .nest("/oauth2", oauth2::router(oauth2_state.clone()))
        .merge(oauth2::well_known_router(oauth2_state))
        .routes(routes!(health::health))
        .layer(axum::Extension(app_resources))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .split_for_parts();

    router
        .merge(Redoc::with_url("/api-docs", api))
        .method_not_allowed_fallback(oauth2::endpoints::method_not_allowed)
}

/// Starts the web server with all configured routes.
#[tracing::instrument(skip(app_resources, oauth2_state))]
pub async fn start_webserver(
    app_resources: AppResources,
    oauth2_state: OAuth2State,
) -> color_eyre::Result<()> {
    let listen_addr = app_resources.config.listen_addr.clone();
    let router = build_router(app_resources, oauth2_state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(addr = %listen_addr, "Server running");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await
    .map_err(|e| color_eyre::Report::msg(format!("Failed to start server: {e}")))?;

    Ok(())
}
