//! API module - HTTP handlers and middleware.

pub mod dto;
pub mod handlers;
pub mod middleware;
pub mod openapi;
pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;

use crate::config::Config;
use crate::services::federation_client::FederationClient;
use crate::services::session_registry::SessionRegistry;

/// Application state shared across handlers
pub struct AppState {
    pub config: Config,
    pub db: SqlitePool,
    /// Live node control-channel sessions.
    pub sessions: Arc<SessionRegistry>,
    /// Outbound RPC to peer panels.
    pub federation: Arc<FederationClient>,
}

impl AppState {
    pub fn new(config: Config, db: SqlitePool) -> Self {
        let sessions = Arc::new(SessionRegistry::new(Duration::from_secs(
            config.node_command_timeout_secs,
        )));
        let federation = Arc::new(FederationClient::new(
            db.clone(),
            Duration::from_secs(config.federation_timeout_secs),
        ));
        Self {
            config,
            db,
            sessions,
            federation,
        }
    }
}

pub type SharedState = Arc<AppState>;
