//! Consumer-side federation handlers.

use axum::extract::State;
use axum::Json;

use crate::api::dto::{ImportNodeRequest, ImportNodeResponse, R};
use crate::api::SharedState;
use crate::error::Result;
use crate::services::import_service::ImportService;

/// Import a peer share as a local shadow node.
#[utoipa::path(
    post,
    path = "/federation/node/import",
    context_path = "/api/v1",
    tag = "federation",
    request_body = ImportNodeRequest,
    responses(
        (status = 200, description = "Envelope with the shadow node id", body = ImportNodeResponse),
    ),
    security(("bearer_auth" = []))
)]
pub async fn import_node(
    State(state): State<SharedState>,
    Json(req): Json<ImportNodeRequest>,
) -> Result<R<ImportNodeResponse>> {
    let node_id = ImportService::new(state.db.clone())
        .import(&state.federation, &req.remote_url, &req.token)
        .await?;
    Ok(R::ok(ImportNodeResponse { node_id }))
}
