//! Peer share handlers: the provider half of the federation surface.

use axum::extract::{Extension, State};
use axum::Json;

use crate::api::dto::{CreatePeerShareRequest, CreatePeerShareResponse, IdRequest, R};
use crate::api::middleware::peer_auth::ShareExtension;
use crate::api::SharedState;
use crate::error::Result;
use crate::models::peer_share::PeerShare;
use crate::services::federation_client::{
    ReservationRef, ReserveRequest, ReserveResponse, ShareInfo,
};
use crate::services::share_service::ShareService;

fn share_service(state: &SharedState) -> ShareService {
    ShareService::new(state.db.clone(), state.sessions.clone())
}

// ---------------------------------------------------------------------------
// Admin surface
// ---------------------------------------------------------------------------

/// Create a share on a local node. The token is returned only here.
#[utoipa::path(
    post,
    path = "/federation/share/create",
    context_path = "/api/v1",
    tag = "federation",
    request_body = CreatePeerShareRequest,
    responses(
        (status = 200, description = "Envelope with the new share id and token", body = CreatePeerShareResponse),
    ),
    security(("bearer_auth" = []))
)]
pub async fn create_share(
    State(state): State<SharedState>,
    Json(req): Json<CreatePeerShareRequest>,
) -> Result<R<CreatePeerShareResponse>> {
    let (id, token) = share_service(&state).create(&req).await?;
    Ok(R::ok(CreatePeerShareResponse { id, token }))
}

pub async fn list_shares(State(state): State<SharedState>) -> Result<R<Vec<PeerShare>>> {
    let shares = share_service(&state).list().await?;
    Ok(R::ok(shares))
}

pub async fn delete_share(
    State(state): State<SharedState>,
    Json(req): Json<IdRequest>,
) -> Result<R> {
    share_service(&state).delete(req.id).await?;
    Ok(R::ok_empty())
}

// ---------------------------------------------------------------------------
// Federation surface (peer-authenticated; the middleware already applied
// the token and IP policy and parked the share in the extensions)
// ---------------------------------------------------------------------------

/// Share metadata for the consumer's import step.
#[utoipa::path(
    post,
    path = "/federation/share/info",
    context_path = "/api/v1",
    tag = "federation",
    responses(
        (status = 200, description = "Envelope with share metadata", body = ShareInfo),
    ),
    security(("share_token" = []))
)]
pub async fn share_info(
    State(state): State<SharedState>,
    Extension(ShareExtension(share)): Extension<ShareExtension>,
) -> Result<R<ShareInfo>> {
    let info = share_service(&state).share_info(&share).await?;
    Ok(R::ok(info))
}

/// Reserve a port on the shared node.
#[utoipa::path(
    post,
    path = "/federation/reserve",
    context_path = "/api/v1",
    tag = "federation",
    request_body = ReserveRequest,
    responses(
        (status = 200, description = "Envelope with the reservation id and bound port", body = ReserveResponse),
    ),
    security(("share_token" = []))
)]
pub async fn reserve(
    State(state): State<SharedState>,
    Extension(ShareExtension(share)): Extension<ShareExtension>,
    Json(req): Json<ReserveRequest>,
) -> Result<R<ReserveResponse>> {
    let reply = share_service(&state).reserve(&share, &req).await?;
    Ok(R::ok(reply))
}

/// Apply a reservation to the node.
#[utoipa::path(
    post,
    path = "/federation/commit",
    context_path = "/api/v1",
    tag = "federation",
    request_body = ReservationRef,
    responses((status = 200, description = "Empty envelope")),
    security(("share_token" = []))
)]
pub async fn commit(
    State(state): State<SharedState>,
    Extension(ShareExtension(share)): Extension<ShareExtension>,
    Json(req): Json<ReservationRef>,
) -> Result<R> {
    share_service(&state).commit(&share, &req.reservation_id).await?;
    Ok(R::ok_empty())
}

/// Release a reservation.
#[utoipa::path(
    post,
    path = "/federation/release",
    context_path = "/api/v1",
    tag = "federation",
    request_body = ReservationRef,
    responses((status = 200, description = "Empty envelope")),
    security(("share_token" = []))
)]
pub async fn release(
    State(state): State<SharedState>,
    Extension(ShareExtension(share)): Extension<ShareExtension>,
    Json(req): Json<ReservationRef>,
) -> Result<R> {
    share_service(&state).release(&share, &req.reservation_id).await?;
    Ok(R::ok_empty())
}
