//! Node control channel at `/system-info`.
//!
//! Nodes dial in over WebSocket with their secret in the query string.
//! A connection marks the node online and registers a session in the
//! registry; the reverse happens on disconnect. One writer task drains
//! the session's outbound queue, the reader loop matches `<T>Response`
//! frames to pending requests and answers unknown request types with
//! `success=false`.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;

use crate::api::SharedState;
use crate::models::node::Node;
use crate::services::session_registry::{CommandReply, InboundFrame, NodeSession};
use crate::services::wire_crypto::NodeCipher;

#[derive(Debug, Deserialize)]
pub struct ChannelQuery {
    /// Channel kind; nodes connect with `type=1`.
    #[serde(rename = "type", default)]
    pub channel_type: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub http: String,
    #[serde(default)]
    pub tls: String,
    #[serde(default)]
    pub socks: String,
}

fn flag(raw: &str) -> i64 {
    i64::from(raw.trim() == "1")
}

pub async fn node_channel(
    State(state): State<SharedState>,
    Query(query): Query<ChannelQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if query.channel_type != "1" {
        return (StatusCode::BAD_REQUEST, "unsupported channel type").into_response();
    }

    let node = match Node::by_secret(&state.db, &query.secret).await {
        Ok(Some(node)) => node,
        Ok(None) => return (StatusCode::UNAUTHORIZED, "unknown node secret").into_response(),
        Err(err) => {
            tracing::error!(error = %err, "node channel auth failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "store error").into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(state, node, query, socket))
}

async fn handle_socket(state: SharedState, node: Node, query: ChannelQuery, socket: WebSocket) {
    let now = chrono::Utc::now().timestamp_millis();
    let updated = sqlx::query(
        "UPDATE node SET status = 1, version = ?1, http = ?2, tls = ?3, socks = ?4,
                         updated_time = ?5
         WHERE id = ?6",
    )
    .bind(&query.version)
    .bind(flag(&query.http))
    .bind(flag(&query.tls))
    .bind(flag(&query.socks))
    .bind(now)
    .bind(node.id)
    .execute(&state.db)
    .await;
    if let Err(err) = updated {
        tracing::error!(node_id = node.id, error = %err, "node online update failed");
        return;
    }

    let cipher = NodeCipher::from_secret(&node.secret);
    let (session, mut outbound_rx) = NodeSession::new(node.id, cipher);
    state.sessions.register(session.clone());
    tracing::info!(node_id = node.id, name = %node.name, "node session opened");

    let (mut sender, mut receiver) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(raw)) => handle_frame(&session, &raw),
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    writer.abort();
    state.sessions.unregister(&session);

    // A reconnect may already hold a fresh session; only then is the
    // node actually offline.
    if !state.sessions.is_alive(node.id) {
        let now = chrono::Utc::now().timestamp_millis();
        let _ = sqlx::query("UPDATE node SET status = 0, updated_time = ?1 WHERE id = ?2")
            .bind(now)
            .bind(node.id)
            .execute(&state.db)
            .await;
    }
    tracing::info!(node_id = node.id, "node session closed");
}

fn handle_frame(session: &Arc<NodeSession>, raw: &str) {
    let plain = session.cipher().open_frame(raw);
    let Ok(frame) = serde_json::from_str::<InboundFrame>(&plain) else {
        tracing::debug!(node_id = session.node_id, "undecodable frame dropped");
        return;
    };

    if frame.frame_type.ends_with("Response") {
        session.complete(
            &frame.request_id,
            CommandReply {
                success: frame.success,
                message: frame.message,
            },
        );
    } else if !frame.request_id.is_empty() {
        session.send_unsupported_reply(&frame.frame_type, &frame.request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_parsing() {
        assert_eq!(flag("1"), 1);
        assert_eq!(flag(" 1 "), 1);
        assert_eq!(flag("0"), 0);
        assert_eq!(flag(""), 0);
        assert_eq!(flag("true"), 0);
    }

    #[test]
    fn test_channel_query_deserializes_node_handshake() {
        let query: ChannelQuery = serde_urlencoded_from(
            "type=1&secret=node-secret&version=v1&http=1&tls=1&socks=0",
        );
        assert_eq!(query.channel_type, "1");
        assert_eq!(query.secret, "node-secret");
        assert_eq!(flag(&query.http), 1);
        assert_eq!(flag(&query.socks), 0);
    }

    fn serde_urlencoded_from(query: &str) -> ChannelQuery {
        // Query extraction goes through serde; exercise the same path.
        let pairs: Vec<(String, String)> = query
            .split('&')
            .filter_map(|kv| kv.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let json: serde_json::Map<String, serde_json::Value> = pairs
            .into_iter()
            .map(|(k, v)| (k, serde_json::Value::String(v)))
            .collect();
        serde_json::from_value(serde_json::Value::Object(json)).unwrap()
    }

    #[test]
    fn test_response_frame_completes_pending_request() {
        let (session, _rx) = NodeSession::new(1, NodeCipher::from_secret("s"));
        // No pending request: a late response is simply dropped.
        handle_frame(
            &session,
            r#"{"type":"CreateServiceResponse","success":true,"message":"OK","requestId":"r9"}"#,
        );
    }

    #[test]
    fn test_unknown_request_type_gets_failure_reply() {
        let (session, mut rx) = NodeSession::new(1, NodeCipher::from_secret("s"));
        handle_frame(&session, r#"{"type":"SelfDestruct","requestId":"r1"}"#);

        let raw = rx.try_recv().expect("a reply frame must be queued");
        let plain = session.cipher().open_frame(&raw);
        let frame: serde_json::Value = serde_json::from_str(&plain).unwrap();
        assert_eq!(frame["type"], "SelfDestructResponse");
        assert_eq!(frame["success"], false);
        assert_eq!(frame["requestId"], "r1");
    }

    #[test]
    fn test_frames_without_request_id_are_ignored() {
        let (session, mut rx) = NodeSession::new(1, NodeCipher::from_secret("s"));
        handle_frame(&session, r#"{"type":"Heartbeat"}"#);
        assert!(rx.try_recv().is_err());
    }
}
