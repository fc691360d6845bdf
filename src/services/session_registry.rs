//! Live node control-channel sessions.
//!
//! One session per connected node. The WebSocket handler owns the socket
//! tasks; the registry is the process-wide map other services use to ask
//! "is this node live" and to run request/response commands against it.
//! Request matching uses a `requestId` the node echoes back in a
//! `<Type>Response` frame.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::services::wire_crypto::NodeCipher;

/// A command sent to a node over its control channel.
#[derive(Debug, Clone)]
pub struct NodeCommand {
    pub command_type: String,
    /// Extra frame fields; must serialize to a JSON object.
    pub payload: serde_json::Value,
}

impl NodeCommand {
    pub fn new(command_type: &str, payload: serde_json::Value) -> Self {
        Self {
            command_type: command_type.to_string(),
            payload,
        }
    }
}

/// A node's reply to a command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReply {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

/// Inbound control-channel frame, after envelope decryption.
#[derive(Debug, Deserialize)]
pub struct InboundFrame {
    #[serde(rename = "type", default)]
    pub frame_type: String,
    #[serde(rename = "requestId", default)]
    pub request_id: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

/// One live control-channel connection.
pub struct NodeSession {
    pub node_id: i64,
    cipher: NodeCipher,
    outbound: mpsc::UnboundedSender<String>,
    pending: Mutex<HashMap<String, oneshot::Sender<CommandReply>>>,
}

impl NodeSession {
    /// Create a session and the outbound message stream its writer task
    /// (or a test stub) drains.
    pub fn new(node_id: i64, cipher: NodeCipher) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            node_id,
            cipher,
            outbound: tx,
            pending: Mutex::new(HashMap::new()),
        });
        (session, rx)
    }

    pub fn cipher(&self) -> &NodeCipher {
        &self.cipher
    }

    /// Resolve a pending request with the node's reply. Returns false if
    /// no request with this id is waiting (late or unsolicited reply).
    pub fn complete(&self, request_id: &str, reply: CommandReply) -> bool {
        let waiter = self
            .pending
            .lock()
            .expect("pending map lock poisoned")
            .remove(request_id);
        match waiter {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Answer an inbound request frame of a type the panel does not
    /// understand. The node protocol requires a `<Type>Response` with
    /// `success=false` rather than silence.
    pub fn send_unsupported_reply(&self, frame_type: &str, request_id: &str) {
        let reply = json!({
            "type": format!("{frame_type}Response"),
            "success": false,
            "message": "unsupported command",
            "requestId": request_id,
        });
        let _ = self.outbound.send(self.cipher.seal_frame(&reply.to_string()));
    }

    async fn call(&self, command: &NodeCommand, timeout: Duration) -> Result<CommandReply> {
        let request_id = Uuid::new_v4().to_string();

        let mut frame = json!({
            "type": command.command_type,
            "requestId": request_id,
        });
        if let (Some(obj), Some(extra)) = (frame.as_object_mut(), command.payload.as_object()) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map lock poisoned")
            .insert(request_id.clone(), tx);

        if self
            .outbound
            .send(self.cipher.seal_frame(&frame.to_string()))
            .is_err()
        {
            self.pending
                .lock()
                .expect("pending map lock poisoned")
                .remove(&request_id);
            return Err(AppError::NodeOffline(format!(
                "node {} channel closed",
                self.node_id
            )));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(AppError::NodeOffline(format!(
                "node {} session dropped",
                self.node_id
            ))),
            Err(_) => {
                self.pending
                    .lock()
                    .expect("pending map lock poisoned")
                    .remove(&request_id);
                Err(AppError::NodeOffline(format!(
                    "node {} command timed out",
                    self.node_id
                )))
            }
        }
    }
}

/// Process-wide map of live node sessions.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<i64, Arc<NodeSession>>>,
    command_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(command_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            command_timeout,
        }
    }

    /// Register a session, replacing any previous one for the node.
    pub fn register(&self, session: Arc<NodeSession>) {
        self.sessions
            .lock()
            .expect("session map lock poisoned")
            .insert(session.node_id, session);
    }

    /// Drop a session, but only if it is still the registered one (a
    /// reconnect may already have replaced it).
    pub fn unregister(&self, session: &Arc<NodeSession>) {
        let mut map = self.sessions.lock().expect("session map lock poisoned");
        if let Some(current) = map.get(&session.node_id) {
            if Arc::ptr_eq(current, session) {
                map.remove(&session.node_id);
            }
        }
    }

    pub fn is_alive(&self, node_id: i64) -> bool {
        self.sessions
            .lock()
            .expect("session map lock poisoned")
            .contains_key(&node_id)
    }

    pub fn get(&self, node_id: i64) -> Option<Arc<NodeSession>> {
        self.sessions
            .lock()
            .expect("session map lock poisoned")
            .get(&node_id)
            .cloned()
    }

    /// Run a command against a node with the default per-command timeout.
    pub async fn call(&self, node_id: i64, command: NodeCommand) -> Result<CommandReply> {
        self.call_with_timeout(node_id, command, self.command_timeout)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        node_id: i64,
        command: NodeCommand,
        timeout: Duration,
    ) -> Result<CommandReply> {
        let session = self
            .get(node_id)
            .ok_or_else(|| AppError::NodeOffline(format!("node {node_id} has no live session")))?;
        session.call(&command, timeout).await
    }
}

/// Spawn a task that answers every command on `rx` with a successful
/// `<Type>Response`, the way a healthy node agent would. Used by tests
/// and local tooling.
pub fn spawn_echo_node(session: Arc<NodeSession>, mut rx: mpsc::UnboundedReceiver<String>) {
    tokio::spawn(async move {
        while let Some(raw) = rx.recv().await {
            let plain = session.cipher().open_frame(&raw);
            let Ok(frame) = serde_json::from_str::<InboundFrame>(&plain) else {
                continue;
            };
            if frame.request_id.is_empty() {
                continue;
            }
            session.complete(
                &frame.request_id,
                CommandReply {
                    success: true,
                    message: "OK".into(),
                },
            );
        }
    });
}
