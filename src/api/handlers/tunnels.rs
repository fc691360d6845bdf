//! Tunnel lifecycle handlers.

use axum::extract::{Extension, State};
use axum::Json;

use crate::api::dto::{CreateTunnelRequest, IdRequest, R};
use crate::api::middleware::auth::AuthExtension;
use crate::api::SharedState;
use crate::error::Result;
use crate::models::tunnel::Tunnel;
use crate::services::coordinator::TunnelCoordinator;

fn coordinator(state: &SharedState) -> TunnelCoordinator {
    TunnelCoordinator::new(
        state.db.clone(),
        state.sessions.clone(),
        state.federation.clone(),
    )
}

/// Create a tunnel across local and federated hops.
#[utoipa::path(
    post,
    path = "/tunnel/create",
    context_path = "/api/v1",
    tag = "tunnel",
    request_body = CreateTunnelRequest,
    responses(
        (status = 200, description = "Envelope with the tunnel id"),
    ),
    security(("bearer_auth" = []))
)]
pub async fn create_tunnel(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthExtension>,
    Json(req): Json<CreateTunnelRequest>,
) -> Result<R<serde_json::Value>> {
    let tunnel_id = coordinator(&state).create_tunnel(&req, auth.user_id).await?;
    Ok(R::ok(serde_json::json!({ "id": tunnel_id })))
}

/// Delete a tunnel and release its remote reservations.
#[utoipa::path(
    post,
    path = "/tunnel/delete",
    context_path = "/api/v1",
    tag = "tunnel",
    request_body = IdRequest,
    responses((status = 200, description = "Empty envelope")),
    security(("bearer_auth" = []))
)]
pub async fn delete_tunnel(
    State(state): State<SharedState>,
    Json(req): Json<IdRequest>,
) -> Result<R> {
    coordinator(&state).delete_tunnel(req.id).await?;
    Ok(R::ok_empty())
}

pub async fn list_tunnels(State(state): State<SharedState>) -> Result<R<Vec<Tunnel>>> {
    let tunnels = Tunnel::list(&state.db).await?;
    Ok(R::ok(tunnels))
}
