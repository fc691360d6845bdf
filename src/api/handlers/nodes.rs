//! Node admin handlers.

use axum::extract::State;

use crate::api::dto::R;
use crate::api::SharedState;
use crate::error::Result;
use crate::models::node::Node;

/// List all nodes, local and shadow, with their live-session status.
pub async fn list_nodes(State(state): State<SharedState>) -> Result<R<Vec<serde_json::Value>>> {
    let nodes = sqlx::query_as::<_, Node>("SELECT * FROM node ORDER BY inx, id")
        .fetch_all(&state.db)
        .await?;

    let items = nodes
        .into_iter()
        .map(|node| {
            let online = if node.is_remote() {
                node.status == 1
            } else {
                state.sessions.is_alive(node.id)
            };
            let mut value = serde_json::to_value(&node).unwrap_or_default();
            if let Some(obj) = value.as_object_mut() {
                obj.insert("online".into(), serde_json::json!(online));
            }
            value
        })
        .collect();

    Ok(R::ok(items))
}
