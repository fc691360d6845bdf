//! Route definitions for the API.

use axum::{
    middleware,
    routing::{any, get, post},
    Json, Router,
};

use super::handlers;
use super::middleware::auth::admin_middleware;
use super::middleware::peer_auth::peer_auth_middleware;
use super::SharedState;

/// Create the main API router
pub fn create_router(state: SharedState) -> Router {
    // Build OpenAPI spec once at startup
    let openapi = super::openapi::build_openapi();

    // Admin surface: panel JWT required.
    let admin_routes = Router::new()
        .route("/node/list", post(handlers::nodes::list_nodes))
        .route("/tunnel/list", post(handlers::tunnels::list_tunnels))
        .route("/tunnel/create", post(handlers::tunnels::create_tunnel))
        .route("/tunnel/delete", post(handlers::tunnels::delete_tunnel))
        .route(
            "/federation/share/create",
            post(handlers::shares::create_share),
        )
        .route("/federation/share/list", post(handlers::shares::list_shares))
        .route(
            "/federation/share/delete",
            post(handlers::shares::delete_share),
        )
        .route(
            "/federation/node/import",
            post(handlers::federation::import_node),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            admin_middleware,
        ));

    // Federation surface: peer share-token + IP allow-list.
    let peer_routes = Router::new()
        .route("/federation/share/info", post(handlers::shares::share_info))
        .route("/federation/reserve", post(handlers::shares::reserve))
        .route("/federation/commit", post(handlers::shares::commit))
        .route("/federation/release", post(handlers::shares::release))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            peer_auth_middleware,
        ));

    Router::new()
        // Health endpoints (no auth required)
        .route("/health", get(handlers::health::health_check))
        .route("/healthz", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check))
        .route("/readyz", get(handlers::health::readiness_check))
        .route(
            "/api-docs/openapi.json",
            get(move || async move { Json(openapi) }),
        )
        // Node-facing endpoints authenticate by node secret
        .route("/system-info", get(handlers::node_channel::node_channel))
        .route("/flow/test", any(handlers::flow::flow_test))
        .route("/flow/config", any(handlers::flow::flow_config))
        .route("/flow/upload", post(handlers::flow::flow_upload))
        .nest("/api/v1", admin_routes.merge(peer_routes))
        .with_state(state)
}
