//! Consumer-side share import.
//!
//! Importing a peer share materialises a local shadow node: a `node`
//! row flagged `is_remote=1` that carries the peer URL, the share token
//! and the share's port range, so the tunnel planner can treat the
//! remote capacity like any other hop target.

use sqlx::SqlitePool;

use crate::error::{AppError, Result};
use crate::models::node::RemoteConfig;
use crate::services::federation_client::{FederationClient, PeerEndpoint};

pub struct ImportService {
    db: SqlitePool,
}

impl ImportService {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Import (or refresh) a peer share as a shadow node and return the
    /// local node id. Re-importing the same token updates metadata in
    /// place and keeps the node id stable.
    pub async fn import(
        &self,
        federation: &FederationClient,
        remote_url: &str,
        token: &str,
    ) -> Result<i64> {
        let remote_url = remote_url.trim().trim_end_matches('/');
        if remote_url.is_empty() || token.trim().is_empty() {
            return Err(AppError::BadRequest("remoteUrl and token are required".into()));
        }

        let peer = PeerEndpoint {
            base_url: remote_url.to_string(),
            share_token: token.to_string(),
        };
        let info = federation.share_info(&peer).await?;

        let remote_config = serde_json::to_string(&RemoteConfig {
            share_id: info.share_id,
        })?;
        let port_range = if info.port_range_start == info.port_range_end {
            info.port_range_start.to_string()
        } else {
            format!("{}-{}", info.port_range_start, info.port_range_end)
        };
        let name = format!("{}@{}", info.node_name, info.name);
        let (ip_v4, ip_v6) = match info.server_ip.parse::<std::net::IpAddr>() {
            Ok(std::net::IpAddr::V4(_)) => (info.server_ip.as_str(), ""),
            Ok(std::net::IpAddr::V6(_)) => ("", info.server_ip.as_str()),
            Err(_) => ("", ""),
        };
        let now = chrono::Utc::now().timestamp_millis();

        let existing: Option<i64> =
            sqlx::query_scalar("SELECT id FROM node WHERE is_remote = 1 AND remote_token = ?1")
                .bind(token)
                .fetch_optional(&self.db)
                .await?;

        let node_id = match existing {
            Some(id) => {
                sqlx::query(
                    "UPDATE node SET name = ?1, server_ip = ?2, server_ip_v4 = ?3,
                                     server_ip_v6 = ?4, port = ?5, version = ?6, http = ?7,
                                     tls = ?8, socks = ?9, remote_url = ?10, remote_config = ?11,
                                     status = 1, updated_time = ?12
                     WHERE id = ?13",
                )
                .bind(&name)
                .bind(&info.server_ip)
                .bind(ip_v4)
                .bind(ip_v6)
                .bind(&port_range)
                .bind(&info.version)
                .bind(info.http)
                .bind(info.tls)
                .bind(info.socks)
                .bind(remote_url)
                .bind(&remote_config)
                .bind(now)
                .bind(id)
                .execute(&self.db)
                .await?;
                id
            }
            None => {
                // Shadow nodes never open a control channel; the secret
                // only satisfies the schema and stays local.
                let secret = format!("remote-{}", uuid::Uuid::new_v4());
                sqlx::query(
                    "INSERT INTO node(name, secret, server_ip, server_ip_v4, server_ip_v6, port,
                                      version, http, tls, socks, status, is_remote,
                                      remote_url, remote_token, remote_config,
                                      created_time, updated_time)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1, 1, ?11, ?12, ?13, ?14, ?14)",
                )
                .bind(&name)
                .bind(&secret)
                .bind(&info.server_ip)
                .bind(ip_v4)
                .bind(ip_v6)
                .bind(&port_range)
                .bind(&info.version)
                .bind(info.http)
                .bind(info.tls)
                .bind(info.socks)
                .bind(remote_url)
                .bind(token)
                .bind(&remote_config)
                .bind(now)
                .execute(&self.db)
                .await?
                .last_insert_rowid()
            }
        };

        tracing::info!(node_id, share_id = info.share_id, peer = remote_url, "imported peer share");
        Ok(node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_import_rejects_empty_arguments() {
        let pool = crate::db::create_test_pool().await.unwrap();
        let svc = ImportService::new(pool.clone());
        let client = FederationClient::new(pool, std::time::Duration::from_secs(1));

        assert!(svc.import(&client, "", "tok").await.is_err());
        assert!(svc.import(&client, "http://peer", " ").await.is_err());
    }
}
