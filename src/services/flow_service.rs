//! Flow accounting.
//!
//! Nodes report usage deltas per canonical service name. Reports keyed
//! `<forwardId>_<userId>_<userTunnelId>` credit user-tunnel counters;
//! `fed_svc_<runtimeId>` reports credit the owning peer share and, once
//! the share crosses its bandwidth cap, disable the share and all of its
//! live reservations. Unknown names (including `web_api`) are dropped
//! silently — nodes also report the panel's own traffic.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use sqlx::SqlitePool;

use crate::error::Result;
use crate::models::node::Node;
use crate::models::peer_share::{PeerShare, PeerShareRuntime};
use crate::services::naming::{control_service_names, parse_forward_service_name};
use crate::services::session_registry::{NodeCommand, SessionRegistry};
use crate::services::wire_crypto::NodeCipher;

/// One usage report item: service name, upload and download byte deltas.
#[derive(Debug, Clone, Deserialize)]
pub struct FlowItem {
    pub n: String,
    #[serde(default)]
    pub u: i64,
    #[serde(default)]
    pub d: i64,
}

pub struct FlowService {
    db: SqlitePool,
    sessions: Arc<SessionRegistry>,
}

impl FlowService {
    pub fn new(db: SqlitePool, sessions: Arc<SessionRegistry>) -> Self {
        Self { db, sessions }
    }

    /// Handle a `/flow/upload` body. The node is identified by its
    /// secret; unknown secrets are ignored (the node still gets its
    /// `ok`, misconfigured agents must not retry-storm the panel).
    pub async fn handle_upload(&self, secret: &str, body: &str) -> Result<()> {
        let Some(node) = Node::by_secret(&self.db, secret).await? else {
            return Ok(());
        };

        let plain = NodeCipher::from_secret(&node.secret).open_frame(body);
        if plain.trim().is_empty() {
            return Ok(());
        }

        let Ok(items) = serde_json::from_str::<Vec<FlowItem>>(&plain) else {
            tracing::debug!(node_id = node.id, "unparseable flow upload dropped");
            return Ok(());
        };

        for item in items {
            if let Err(err) = self.process_flow_item(&item).await {
                tracing::warn!(service = %item.n, error = %err, "flow item failed");
            }
        }

        Ok(())
    }

    /// Apply one usage delta.
    pub async fn process_flow_item(&self, item: &FlowItem) -> Result<()> {
        if let Some((_, user_id, user_tunnel_id)) = parse_forward_service_name(&item.n) {
            return self.credit_user_tunnel(user_id, user_tunnel_id, item).await;
        }

        if let Some(runtime) = PeerShareRuntime::by_service_name(&self.db, &item.n).await? {
            return self.credit_share(&runtime, item).await;
        }

        Ok(())
    }

    async fn credit_user_tunnel(
        &self,
        user_id: i64,
        user_tunnel_id: i64,
        item: &FlowItem,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        sqlx::query(
            "UPDATE user_tunnel SET in_flow = in_flow + ?1, out_flow = out_flow + ?2,
                                    updated_time = ?3
             WHERE id = ?4 AND user_id = ?5",
        )
        .bind(item.u)
        .bind(item.d)
        .bind(now)
        .bind(user_tunnel_id)
        .bind(user_id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Add the delta to the share's cumulative counter and enforce the
    /// bandwidth cap: a share at or over its cap is disabled together
    /// with every live reservation it granted.
    async fn credit_share(&self, runtime: &PeerShareRuntime, item: &FlowItem) -> Result<()> {
        let delta = item.u.saturating_add(item.d);
        if delta <= 0 {
            return Ok(());
        }

        let now = chrono::Utc::now().timestamp_millis();

        let mut tx = self.db.begin().await?;
        sqlx::query(
            "UPDATE peer_share SET current_flow = current_flow + ?1, updated_time = ?2
             WHERE id = ?3",
        )
        .bind(delta)
        .bind(now)
        .bind(runtime.share_id)
        .execute(&mut *tx)
        .await?;

        let share = sqlx::query_as::<_, PeerShare>("SELECT * FROM peer_share WHERE id = ?1")
            .bind(runtime.share_id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(share) = share else {
            // Orphaned runtime row; keep counting nothing.
            tx.commit().await?;
            return Ok(());
        };

        let over_cap = share.is_over_quota();
        if over_cap {
            sqlx::query("UPDATE peer_share SET is_active = 0, updated_time = ?1 WHERE id = ?2")
                .bind(now)
                .bind(share.id)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "UPDATE peer_share_runtime SET status = 0, updated_time = ?1
                 WHERE share_id = ?2 AND status = 1",
            )
            .bind(now)
            .bind(share.id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        if over_cap {
            tracing::info!(
                share_id = share.id,
                current_flow = share.current_flow,
                max_bandwidth = share.max_bandwidth,
                "share over bandwidth cap, disabled"
            );
            self.pause_service(runtime).await;
        }

        Ok(())
    }

    /// Best-effort data-plane pause for an over-cap reservation.
    async fn pause_service(&self, runtime: &PeerShareRuntime) {
        if !self.sessions.is_alive(runtime.node_id) {
            return;
        }
        for name in control_service_names(&runtime.service_name, "PauseService") {
            let _ = self
                .sessions
                .call(
                    runtime.node_id,
                    NodeCommand::new("PauseService", json!({ "name": name })),
                )
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;
    use std::time::Duration;

    async fn service() -> (FlowService, SqlitePool) {
        let pool = create_test_pool().await.unwrap();
        let sessions = Arc::new(SessionRegistry::new(Duration::from_millis(100)));
        (FlowService::new(pool.clone(), sessions), pool)
    }

    async fn insert_share(pool: &SqlitePool, max_bandwidth: i64, current_flow: i64) -> i64 {
        sqlx::query(
            "INSERT INTO peer_share(name, node_id, token, max_bandwidth, current_flow,
                                    port_range_start, port_range_end, is_active)
             VALUES ('flow-share', 1, 'flow-share-token', ?1, ?2, 32000, 32010, 1)",
        )
        .bind(max_bandwidth)
        .bind(current_flow)
        .execute(pool)
        .await
        .unwrap()
        .last_insert_rowid()
    }

    async fn insert_runtime(pool: &SqlitePool, id: i64, share_id: i64, status: i64) {
        sqlx::query(
            "INSERT INTO peer_share_runtime(id, share_id, node_id, reservation_id, resource_key,
                                            role, service_name, port, applied, status)
             VALUES (?1, ?2, 1, ?3, ?4, 'exit', ?5, ?6, 1, ?7)",
        )
        .bind(id)
        .bind(share_id)
        .bind(format!("res-{id}"))
        .bind(format!("rk-{id}"))
        .bind(format!("fed_svc_{id}"))
        .bind(32000 + id)
        .bind(status)
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_share_flow_tracked_and_cap_enforced() {
        let (svc, pool) = service().await;
        let share_id = insert_share(&pool, 3000, 1000).await;
        insert_runtime(&pool, 17, share_id, 1).await;

        svc.process_flow_item(&FlowItem {
            n: "fed_svc_17".into(),
            u: 1200,
            d: 900,
        })
        .await
        .unwrap();

        let share = PeerShare::by_id(&pool, share_id).await.unwrap().unwrap();
        assert_eq!(share.current_flow, 3100);
        assert_eq!(share.is_active, 0);

        let runtime = PeerShareRuntime::by_id(&pool, 17).await.unwrap().unwrap();
        assert_eq!(runtime.status, 0);
    }

    #[tokio::test]
    async fn test_all_share_runtimes_disabled_on_cap() {
        let (svc, pool) = service().await;
        let share_id = insert_share(&pool, 100, 0).await;
        insert_runtime(&pool, 1, share_id, 1).await;
        insert_runtime(&pool, 2, share_id, 1).await;

        svc.process_flow_item(&FlowItem {
            n: "fed_svc_1".into(),
            u: 60,
            d: 60,
        })
        .await
        .unwrap();

        for id in [1, 2] {
            let runtime = PeerShareRuntime::by_id(&pool, id).await.unwrap().unwrap();
            assert_eq!(runtime.status, 0, "runtime {id} must be disabled");
        }
    }

    #[tokio::test]
    async fn test_under_cap_keeps_share_active() {
        let (svc, pool) = service().await;
        let share_id = insert_share(&pool, 10_000, 0).await;
        insert_runtime(&pool, 5, share_id, 1).await;

        svc.process_flow_item(&FlowItem {
            n: "fed_svc_5".into(),
            u: 100,
            d: 200,
        })
        .await
        .unwrap();

        let share = PeerShare::by_id(&pool, share_id).await.unwrap().unwrap();
        assert_eq!(share.current_flow, 300);
        assert_eq!(share.is_active, 1);

        let runtime = PeerShareRuntime::by_id(&pool, 5).await.unwrap().unwrap();
        assert_eq!(runtime.status, 1);
    }

    #[tokio::test]
    async fn test_unlimited_share_never_disables() {
        let (svc, pool) = service().await;
        let share_id = insert_share(&pool, 0, 0).await;
        insert_runtime(&pool, 9, share_id, 1).await;

        svc.process_flow_item(&FlowItem {
            n: "fed_svc_9".into(),
            u: i64::MAX / 4,
            d: 0,
        })
        .await
        .unwrap();

        let share = PeerShare::by_id(&pool, share_id).await.unwrap().unwrap();
        assert_eq!(share.is_active, 1);
    }

    #[tokio::test]
    async fn test_user_tunnel_credit() {
        let (svc, pool) = service().await;
        sqlx::query(
            "INSERT INTO user_tunnel(id, user_id, tunnel_id, in_flow, out_flow)
             VALUES (56, 34, 7, 10, 20)",
        )
        .execute(&pool)
        .await
        .unwrap();

        svc.process_flow_item(&FlowItem {
            n: "12_34_56".into(),
            u: 5,
            d: 6,
        })
        .await
        .unwrap();

        let (in_flow, out_flow): (i64, i64) =
            sqlx::query_as("SELECT in_flow, out_flow FROM user_tunnel WHERE id = 56")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(in_flow, 15);
        assert_eq!(out_flow, 26);
    }

    #[tokio::test]
    async fn test_unknown_and_reserved_names_dropped() {
        let (svc, _pool) = service().await;
        for name in ["web_api", "fed_svc_404", "not-a-service", ""] {
            svc.process_flow_item(&FlowItem {
                n: name.into(),
                u: 100,
                d: 100,
            })
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    async fn test_handle_upload_unknown_secret_is_noop() {
        let (svc, _pool) = service().await;
        svc.handle_upload("no-such-node", r#"[{"n":"12_34_56","u":1,"d":1}]"#)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_handle_upload_plaintext_and_encrypted() {
        let (svc, pool) = service().await;
        sqlx::query(
            "INSERT INTO node(name, secret, server_ip, server_ip_v4, port, status)
             VALUES ('n1', 'node-secret', '10.0.0.1', '10.0.0.1', '1000-1010', 1)",
        )
        .execute(&pool)
        .await
        .unwrap();
        let share_id = insert_share(&pool, 0, 0).await;
        insert_runtime(&pool, 3, share_id, 1).await;

        // Plaintext body
        svc.handle_upload("node-secret", r#"[{"n":"fed_svc_3","u":10,"d":20}]"#)
            .await
            .unwrap();

        // Encrypted body
        let cipher = NodeCipher::from_secret("node-secret");
        let sealed = cipher.seal_frame(r#"[{"n":"fed_svc_3","u":1,"d":2}]"#);
        svc.handle_upload("node-secret", &sealed).await.unwrap();

        let share = PeerShare::by_id(&pool, share_id).await.unwrap().unwrap();
        assert_eq!(share.current_flow, 33);
    }
}
