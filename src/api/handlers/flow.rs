//! Flow reporting endpoints.
//!
//! Agents probe `/flow/test` and `/flow/config` before shipping usage to
//! `/flow/upload`. All three answer plain text and never error towards
//! the node; a misbehaving agent must not learn anything from the panel
//! nor hammer it with retries.

use axum::extract::{Query, State};
use serde::Deserialize;

use crate::api::SharedState;
use crate::services::flow_service::FlowService;

#[derive(Debug, Deserialize)]
pub struct FlowQuery {
    #[serde(default)]
    pub secret: String,
}

pub async fn flow_test() -> &'static str {
    "test"
}

pub async fn flow_config() -> &'static str {
    "ok"
}

pub async fn flow_upload(
    State(state): State<SharedState>,
    Query(query): Query<FlowQuery>,
    body: String,
) -> &'static str {
    let service = FlowService::new(state.db.clone(), state.sessions.clone());
    if let Err(err) = service.handle_upload(&query.secret, &body).await {
        tracing::warn!(error = %err, "flow upload processing failed");
    }
    "ok"
}
