//! Gateport Panel - Main Entry Point

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gateport_backend::services::reconciler;
use gateport_backend::{api, config::Config, db, error::Result};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gateport_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Starting Gateport Panel");

    // Open the embedded store and bring the schema up to date
    let db_pool = db::create_pool(&config.database_url).await?;
    db::ensure_schema(&db_pool).await?;
    tracing::info!("Database ready");

    // Create application state
    let state = Arc::new(api::AppState::new(config.clone(), db_pool.clone()));

    // Background workers: pending-release reconciliation
    reconciler::spawn_all(db_pool, state.federation.clone());

    // Build router
    let app = Router::new()
        .merge(api::routes::create_router(state))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr: SocketAddr = config
        .bind_address
        .parse()
        .map_err(|e| gateport_backend::AppError::Config(format!("invalid bind address: {e}")))?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| gateport_backend::AppError::Config(format!("bind failed: {e}")))?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|e| gateport_backend::AppError::Internal(format!("server error: {e}")))?;

    Ok(())
}
