//! Peer share and runtime-reservation models.

use serde::Serialize;
use sqlx::{FromRow, SqlitePool};

use crate::error::{AppError, Result};

/// A Provider-side grant that lets a peer panel reserve ports on one of
/// our nodes.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PeerShare {
    pub id: i64,
    pub name: String,
    pub node_id: i64,
    #[serde(skip_serializing)]
    pub token: String,
    /// Bandwidth cap in bytes, 0 = unlimited
    pub max_bandwidth: i64,
    /// Cumulative in+out bytes since the last reset
    pub current_flow: i64,
    /// Epoch millis, 0 = never expires
    pub expiry_time: i64,
    pub port_range_start: i64,
    pub port_range_end: i64,
    pub is_active: i64,
    pub allowed_domains: String,
    pub allowed_ips: String,
    pub created_time: i64,
    pub updated_time: i64,
}

impl PeerShare {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expiry_time > 0 && self.expiry_time <= now_ms
    }

    pub fn is_over_quota(&self) -> bool {
        self.max_bandwidth > 0 && self.current_flow >= self.max_bandwidth
    }

    /// Gate every reservation entry point: a disabled, expired or
    /// over-quota share rejects all federation requests.
    pub fn usable(&self, now_ms: i64) -> Result<()> {
        if self.is_active != 1 || self.is_expired(now_ms) || self.is_over_quota() {
            return Err(AppError::ShareInactive);
        }
        Ok(())
    }

    pub async fn by_id(pool: &SqlitePool, id: i64) -> Result<Option<PeerShare>> {
        let share = sqlx::query_as::<_, PeerShare>("SELECT * FROM peer_share WHERE id = ?1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(share)
    }

    pub async fn by_token(pool: &SqlitePool, token: &str) -> Result<Option<PeerShare>> {
        let share = sqlx::query_as::<_, PeerShare>("SELECT * FROM peer_share WHERE token = ?1")
            .bind(token)
            .fetch_optional(pool)
            .await?;
        Ok(share)
    }
}

/// A committed reservation on a shared node.
///
/// Lifecycle: reserved (`applied=0,status=1`) → applied
/// (`applied=1,status=1`) → released (`status=0`, terminal).
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PeerShareRuntime {
    pub id: i64,
    pub share_id: i64,
    pub node_id: i64,
    pub reservation_id: String,
    pub resource_key: String,
    pub binding_id: String,
    /// entry / middle / exit
    pub role: String,
    pub chain_name: String,
    pub service_name: String,
    pub protocol: String,
    pub strategy: String,
    pub port: i64,
    pub target: String,
    pub applied: i64,
    pub status: i64,
    pub created_time: i64,
    pub updated_time: i64,
}

impl PeerShareRuntime {
    pub async fn by_id(pool: &SqlitePool, id: i64) -> Result<Option<PeerShareRuntime>> {
        let row =
            sqlx::query_as::<_, PeerShareRuntime>("SELECT * FROM peer_share_runtime WHERE id = ?1")
                .bind(id)
                .fetch_optional(pool)
                .await?;
        Ok(row)
    }

    pub async fn by_reservation_id(
        pool: &SqlitePool,
        reservation_id: &str,
    ) -> Result<Option<PeerShareRuntime>> {
        let row = sqlx::query_as::<_, PeerShareRuntime>(
            "SELECT * FROM peer_share_runtime WHERE reservation_id = ?1",
        )
        .bind(reservation_id)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }

    pub async fn by_service_name(
        pool: &SqlitePool,
        service_name: &str,
    ) -> Result<Option<PeerShareRuntime>> {
        let row = sqlx::query_as::<_, PeerShareRuntime>(
            "SELECT * FROM peer_share_runtime WHERE service_name = ?1 ORDER BY id DESC LIMIT 1",
        )
        .bind(service_name)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn share(is_active: i64, expiry: i64, max_bw: i64, flow: i64) -> PeerShare {
        PeerShare {
            id: 1,
            name: "s".into(),
            node_id: 1,
            token: "t".into(),
            max_bandwidth: max_bw,
            current_flow: flow,
            expiry_time: expiry,
            port_range_start: 1000,
            port_range_end: 1010,
            is_active,
            allowed_domains: String::new(),
            allowed_ips: String::new(),
            created_time: 0,
            updated_time: 0,
        }
    }

    #[test]
    fn test_usable_active_share() {
        assert!(share(1, 0, 0, 0).usable(1_000).is_ok());
    }

    #[test]
    fn test_disabled_share_rejected() {
        assert!(matches!(
            share(0, 0, 0, 0).usable(1_000),
            Err(AppError::ShareInactive)
        ));
    }

    #[test]
    fn test_expired_share_rejected() {
        let s = share(1, 500, 0, 0);
        assert!(s.usable(500).is_err());
        assert!(s.usable(499).is_ok());
    }

    #[test]
    fn test_zero_expiry_never_expires() {
        assert!(!share(1, 0, 0, 0).is_expired(i64::MAX));
    }

    #[test]
    fn test_over_quota_share_rejected() {
        assert!(share(1, 0, 3000, 3000).usable(0).is_err());
        assert!(share(1, 0, 3000, 2999).usable(0).is_ok());
        // 0 = unlimited
        assert!(share(1, 0, 0, i64::MAX).usable(0).is_ok());
    }
}
