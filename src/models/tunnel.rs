//! Tunnel-plane models: tunnels, per-hop chain rows, federation bindings.

use serde::Serialize;
use sqlx::{FromRow, SqlitePool};

use crate::error::Result;

/// Chain position of a hop.
pub const CHAIN_TYPE_ENTRY: i64 = 1;
pub const CHAIN_TYPE_MIDDLE: i64 = 2;
pub const CHAIN_TYPE_EXIT: i64 = 3;

/// Role string stored on provider runtime rows for a chain type.
pub fn role_for_chain_type(chain_type: i64) -> &'static str {
    match chain_type {
        CHAIN_TYPE_ENTRY => "entry",
        CHAIN_TYPE_MIDDLE => "middle",
        _ => "exit",
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Tunnel {
    pub id: i64,
    pub name: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub tunnel_type: i64,
    pub flow: i64,
    pub status: i64,
    pub user_id: i64,
    pub created_time: i64,
    pub updated_time: i64,
}

impl Tunnel {
    pub async fn by_id(pool: &SqlitePool, id: i64) -> Result<Option<Tunnel>> {
        let row = sqlx::query_as::<_, Tunnel>("SELECT * FROM tunnel WHERE id = ?1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(row)
    }

    pub async fn list(pool: &SqlitePool) -> Result<Vec<Tunnel>> {
        let rows = sqlx::query_as::<_, Tunnel>("SELECT * FROM tunnel ORDER BY id")
            .fetch_all(pool)
            .await?;
        Ok(rows)
    }
}

/// A per-hop reservation on a node. For local hops the port is picked by
/// this panel; for remote hops it mirrors the peer-reserved port.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ChainTunnel {
    pub id: i64,
    pub tunnel_id: i64,
    pub chain_type: i64,
    pub node_id: i64,
    pub port: i64,
    pub inx: i64,
    pub protocol: String,
    pub strategy: String,
}

impl ChainTunnel {
    pub async fn for_tunnel(pool: &SqlitePool, tunnel_id: i64) -> Result<Vec<ChainTunnel>> {
        let rows = sqlx::query_as::<_, ChainTunnel>(
            "SELECT * FROM chain_tunnel WHERE tunnel_id = ?1 ORDER BY chain_type, inx, id",
        )
        .bind(tunnel_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }
}

/// Consumer-side record of one remote hop's reservation on a peer panel.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct FederationTunnelBinding {
    pub id: i64,
    pub tunnel_id: i64,
    pub chain_type: i64,
    pub chain_tunnel_id: i64,
    pub remote_node_id: i64,
    #[serde(skip_serializing)]
    pub remote_share_token: String,
    pub peer_url: String,
    pub peer_reservation_id: String,
    pub status: i64,
    pub created_time: i64,
    pub updated_time: i64,
}

impl FederationTunnelBinding {
    pub async fn for_tunnel(
        pool: &SqlitePool,
        tunnel_id: i64,
    ) -> Result<Vec<FederationTunnelBinding>> {
        let rows = sqlx::query_as::<_, FederationTunnelBinding>(
            "SELECT * FROM federation_tunnel_binding WHERE tunnel_id = ?1 ORDER BY id",
        )
        .bind(tunnel_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }
}

/// Durable compensation log: release calls that exhausted their retries
/// and wait for the background reconciler.
#[derive(Debug, Clone, FromRow)]
pub struct PendingRelease {
    pub id: i64,
    pub peer_url: String,
    pub share_token: String,
    pub reservation_id: String,
    pub attempts: i64,
    pub created_time: i64,
    pub updated_time: i64,
}
