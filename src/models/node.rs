//! Forwarding node model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::{AppError, Result};

/// A forwarding host managed by this panel.
///
/// A node with `is_remote = 1` is a shadow of a peer panel's node,
/// materialised by a share import. It can be used as a tunnel hop but
/// never hosts a new peer share itself.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Node {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing)]
    pub secret: String,
    pub server_ip: String,
    pub server_ip_v4: String,
    pub server_ip_v6: String,
    /// Allocatable port range, `"start-end"` (a single value means a
    /// one-port range).
    pub port: String,
    pub interface_name: String,
    pub version: String,
    pub http: i64,
    pub tls: i64,
    pub socks: i64,
    /// 0 offline, 1 online
    pub status: i64,
    pub tcp_listen_addr: String,
    pub udp_listen_addr: String,
    pub inx: i64,
    pub is_remote: i64,
    pub remote_url: String,
    #[serde(skip_serializing)]
    pub remote_token: String,
    pub remote_config: String,
    pub created_time: i64,
    pub updated_time: i64,
}

/// Opaque federation metadata stored on a shadow node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(rename = "shareId")]
    pub share_id: i64,
}

impl Node {
    pub fn is_remote(&self) -> bool {
        self.is_remote == 1
    }

    /// Parse the node's `"start-end"` port range.
    pub fn port_range(&self) -> Result<(i64, i64)> {
        parse_port_range(&self.port)
    }

    /// Preferred dial address for chain targets: v4, then v6, then the
    /// legacy combined column.
    pub fn dial_ip(&self) -> &str {
        if !self.server_ip_v4.is_empty() {
            &self.server_ip_v4
        } else if !self.server_ip_v6.is_empty() {
            &self.server_ip_v6
        } else {
            &self.server_ip
        }
    }

    pub fn remote_share_id(&self) -> Option<i64> {
        serde_json::from_str::<RemoteConfig>(&self.remote_config)
            .ok()
            .map(|c| c.share_id)
    }

    pub async fn by_id(pool: &sqlx::SqlitePool, id: i64) -> Result<Option<Node>> {
        let node = sqlx::query_as::<_, Node>("SELECT * FROM node WHERE id = ?1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(node)
    }

    pub async fn by_secret(pool: &sqlx::SqlitePool, secret: &str) -> Result<Option<Node>> {
        let node =
            sqlx::query_as::<_, Node>("SELECT * FROM node WHERE secret = ?1 AND is_remote = 0")
                .bind(secret)
                .fetch_optional(pool)
                .await?;
        Ok(node)
    }
}

/// Parse a `"start-end"` or `"port"` range string.
pub fn parse_port_range(raw: &str) -> Result<(i64, i64)> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AppError::BadRequest("node has no port range".into()));
    }

    let (start, end) = match trimmed.split_once('-') {
        Some((s, e)) => (s.trim(), e.trim()),
        None => (trimmed, trimmed),
    };

    let start: i64 = start
        .parse()
        .map_err(|_| AppError::BadRequest(format!("invalid port range: {raw}")))?;
    let end: i64 = end
        .parse()
        .map_err(|_| AppError::BadRequest(format!("invalid port range: {raw}")))?;

    if start <= 0 || end > 65535 || start > end {
        return Err(AppError::BadRequest(format!("invalid port range: {raw}")));
    }

    Ok((start, end))
}
