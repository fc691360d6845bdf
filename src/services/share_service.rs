//! Provider-side peer share management and the reservation protocol.
//!
//! A share grants one peer panel a slice of a local node's port range.
//! Reservations move through reserve (row written, port held) → commit
//! (node session live, service created, `applied=1`) → release
//! (`status=0`, terminal). Reserve is idempotent on
//! `(share_id, resource_key)`, commit and release on `reservation_id`.

use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use serde_json::json;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::api::dto::CreatePeerShareRequest;
use crate::error::{AppError, Result};
use crate::models::node::Node;
use crate::models::peer_share::{PeerShare, PeerShareRuntime};
use crate::services::federation_client::{ReserveRequest, ReserveResponse, ShareInfo};
use crate::services::naming::{control_service_names, federation_service_name};
use crate::services::port_picker::{pick_port, used_ports};
use crate::services::session_registry::{NodeCommand, SessionRegistry};

pub struct ShareService {
    db: SqlitePool,
    sessions: Arc<SessionRegistry>,
}

impl ShareService {
    pub fn new(db: SqlitePool, sessions: Arc<SessionRegistry>) -> Self {
        Self { db, sessions }
    }

    // -----------------------------------------------------------------------
    // Admin surface
    // -----------------------------------------------------------------------

    /// Create a share on a local node.
    ///
    /// The token is generated server-side and returned exactly once.
    pub async fn create(&self, req: &CreatePeerShareRequest) -> Result<(i64, String)> {
        let node = Node::by_id(&self.db, req.node_id)
            .await?
            .ok_or_else(|| AppError::BadRequest(format!("node {} not found", req.node_id)))?;

        if node.is_remote() {
            return Err(AppError::RemoteNodeForbidden);
        }

        if req.port_range_start > req.port_range_end {
            return Err(AppError::RangeOutOfBounds(format!(
                "{}-{}",
                req.port_range_start, req.port_range_end
            )));
        }
        let (node_start, node_end) = node.port_range()?;
        if req.port_range_start < node_start || req.port_range_end > node_end {
            return Err(AppError::RangeOutOfBounds(format!(
                "{}-{} not within node range {}-{}",
                req.port_range_start, req.port_range_end, node_start, node_end
            )));
        }

        let allowed_ips = req.allowed_ips.clone().unwrap_or_default();
        validate_allowed_ips(&allowed_ips)?;

        let token = generate_share_token();
        let now = chrono::Utc::now().timestamp_millis();

        let result = sqlx::query(
            "INSERT INTO peer_share
                (name, node_id, token, max_bandwidth, expiry_time,
                 port_range_start, port_range_end, is_active,
                 allowed_domains, allowed_ips, created_time, updated_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?9, ?10, ?10)",
        )
        .bind(&req.name)
        .bind(req.node_id)
        .bind(&token)
        .bind(req.max_bandwidth)
        .bind(req.expiry_time)
        .bind(req.port_range_start)
        .bind(req.port_range_end)
        .bind(req.allowed_domains.clone().unwrap_or_default())
        .bind(&allowed_ips)
        .bind(now)
        .execute(&self.db)
        .await?;

        Ok((result.last_insert_rowid(), token))
    }

    pub async fn list(&self) -> Result<Vec<PeerShare>> {
        let shares = sqlx::query_as::<_, PeerShare>("SELECT * FROM peer_share ORDER BY id")
            .fetch_all(&self.db)
            .await?;
        Ok(shares)
    }

    /// Revoke a share: its live reservations are released and the grant
    /// row removed, so the peer's token stops resolving.
    pub async fn delete(&self, id: i64) -> Result<()> {
        let share = PeerShare::by_id(&self.db, id)
            .await?
            .ok_or_else(|| AppError::BadRequest(format!("share {id} not found")))?;

        let live = sqlx::query_as::<_, PeerShareRuntime>(
            "SELECT * FROM peer_share_runtime WHERE share_id = ?1 AND status = 1",
        )
        .bind(id)
        .fetch_all(&self.db)
        .await?;

        let now = chrono::Utc::now().timestamp_millis();
        let mut tx = self.db.begin().await?;
        sqlx::query(
            "UPDATE peer_share_runtime SET status = 0, updated_time = ?1 WHERE share_id = ?2",
        )
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM peer_share WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        for runtime in live.iter().filter(|r| r.applied == 1) {
            self.delete_node_service(share.node_id, &runtime.service_name)
                .await;
        }

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Federation surface
    // -----------------------------------------------------------------------

    /// Metadata the consumer needs to materialise its shadow node.
    pub async fn share_info(&self, share: &PeerShare) -> Result<ShareInfo> {
        let node = Node::by_id(&self.db, share.node_id)
            .await?
            .ok_or_else(|| AppError::Store(format!("share {} node missing", share.id)))?;

        Ok(ShareInfo {
            share_id: share.id,
            name: share.name.clone(),
            node_name: node.name.clone(),
            server_ip: node.dial_ip().to_string(),
            port_range_start: share.port_range_start,
            port_range_end: share.port_range_end,
            http: node.http,
            tls: node.tls,
            socks: node.socks,
            version: node.version,
            max_bandwidth: share.max_bandwidth,
            expiry_time: share.expiry_time,
        })
    }

    /// Reserve a port for the peer.
    pub async fn reserve(&self, share: &PeerShare, req: &ReserveRequest) -> Result<ReserveResponse> {
        let now = chrono::Utc::now().timestamp_millis();
        share.usable(now)?;

        if req.resource_key.is_empty() || req.resource_key.len() > 64 {
            return Err(AppError::BadRequest("invalid resource key".into()));
        }

        // Idempotent replay: an existing live reservation for this slot
        // answers with its original coordinates.
        if let Some(existing) = self.live_runtime_for_slot(share.id, &req.resource_key).await? {
            return Ok(ReserveResponse {
                reservation_id: existing.reservation_id,
                port: existing.port,
            });
        }

        if !self.sessions.is_alive(share.node_id) {
            return Err(AppError::NodeOffline(format!(
                "node {} has no live session",
                share.node_id
            )));
        }

        let reservation_id = Uuid::new_v4().to_string();

        // Short exclusive transaction around the pick + insert keeps the
        // (node, port) invariant under concurrent reserves.
        let mut tx = self.db.begin().await?;
        let used = used_ports(&mut tx, share.node_id).await?;
        let port = pick_port(
            &used,
            (share.port_range_start, share.port_range_end),
            req.port,
            &[],
        )?;

        let insert = sqlx::query(
            "INSERT INTO peer_share_runtime
                (share_id, node_id, reservation_id, resource_key, binding_id, role,
                 chain_name, service_name, protocol, strategy, port, target,
                 applied, status, created_time, updated_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, '', ?8, ?9, ?10, ?11, 0, 1, ?12, ?12)",
        )
        .bind(share.id)
        .bind(share.node_id)
        .bind(&reservation_id)
        .bind(&req.resource_key)
        .bind(&req.binding_id)
        .bind(&req.role)
        .bind(&req.chain_name)
        .bind(&req.protocol)
        .bind(&req.strategy)
        .bind(port)
        .bind(&req.target)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let runtime_id = insert.last_insert_rowid();
        sqlx::query("UPDATE peer_share_runtime SET service_name = ?1 WHERE id = ?2")
            .bind(federation_service_name(runtime_id))
            .bind(runtime_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::debug!(
            share_id = share.id,
            reservation_id = %reservation_id,
            port = port,
            "reserved federation port"
        );

        Ok(ReserveResponse {
            reservation_id,
            port,
        })
    }

    /// Commit a reservation: requires a live node session and creates the
    /// forwarding service before flipping `applied`.
    pub async fn commit(&self, share: &PeerShare, reservation_id: &str) -> Result<()> {
        let runtime = self.runtime_for_share(share, reservation_id).await?;

        if runtime.applied == 1 {
            return Ok(());
        }

        if !self.sessions.is_alive(runtime.node_id) {
            return Err(AppError::NodeOffline(format!(
                "node {} has no live session",
                runtime.node_id
            )));
        }

        let reply = self
            .sessions
            .call(
                runtime.node_id,
                NodeCommand::new(
                    "CreateService",
                    json!({
                        "name": runtime.service_name,
                        "protocol": runtime.protocol,
                        "port": runtime.port,
                        "target": runtime.target,
                        "strategy": runtime.strategy,
                        "chainName": runtime.chain_name,
                    }),
                ),
            )
            .await?;

        if !reply.success {
            return Err(AppError::Internal(format!(
                "node rejected service {}: {}",
                runtime.service_name, reply.message
            )));
        }

        let now = chrono::Utc::now().timestamp_millis();
        sqlx::query("UPDATE peer_share_runtime SET applied = 1, updated_time = ?1 WHERE id = ?2")
            .bind(now)
            .bind(runtime.id)
            .execute(&self.db)
            .await?;

        Ok(())
    }

    /// Release a reservation. Idempotent; never fails for business
    /// reasons — only store errors propagate.
    pub async fn release(&self, share: &PeerShare, reservation_id: &str) -> Result<()> {
        let runtime = PeerShareRuntime::by_reservation_id(&self.db, reservation_id).await?;
        let Some(runtime) = runtime else {
            return Ok(());
        };
        if runtime.share_id != share.id || runtime.status == 0 {
            return Ok(());
        }

        let now = chrono::Utc::now().timestamp_millis();
        sqlx::query("UPDATE peer_share_runtime SET status = 0, updated_time = ?1 WHERE id = ?2")
            .bind(now)
            .bind(runtime.id)
            .execute(&self.db)
            .await?;

        if runtime.applied == 1 {
            self.delete_node_service(runtime.node_id, &runtime.service_name)
                .await;
        }

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn live_runtime_for_slot(
        &self,
        share_id: i64,
        resource_key: &str,
    ) -> Result<Option<PeerShareRuntime>> {
        let row = sqlx::query_as::<_, PeerShareRuntime>(
            "SELECT * FROM peer_share_runtime
             WHERE share_id = ?1 AND resource_key = ?2 AND status = 1",
        )
        .bind(share_id)
        .bind(resource_key)
        .fetch_optional(&self.db)
        .await?;
        Ok(row)
    }

    async fn runtime_for_share(
        &self,
        share: &PeerShare,
        reservation_id: &str,
    ) -> Result<PeerShareRuntime> {
        let runtime = PeerShareRuntime::by_reservation_id(&self.db, reservation_id)
            .await?
            .filter(|r| r.share_id == share.id && r.status == 1)
            .ok_or_else(|| AppError::ReservationNotFound(reservation_id.to_string()))?;
        Ok(runtime)
    }

    /// Best-effort teardown of a node service; the reservation row is
    /// authoritative regardless of the data-plane outcome.
    async fn delete_node_service(&self, node_id: i64, service_name: &str) {
        for name in control_service_names(service_name, "DeleteService") {
            let result = self
                .sessions
                .call(node_id, NodeCommand::new("DeleteService", json!({ "name": name })))
                .await;
            if let Err(err) = result {
                tracing::debug!(node_id, service = %name, error = %err, "delete service skipped");
                return;
            }
        }
    }
}

/// Validate a comma-separated v4/v6/CIDR allow-list.
pub fn validate_allowed_ips(raw: &str) -> Result<()> {
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let is_ip = entry.parse::<std::net::IpAddr>().is_ok();
        let is_cidr = entry.parse::<ipnet::IpNet>().is_ok();
        if !is_ip && !is_cidr {
            return Err(AppError::InvalidAllowedIps(entry.to_string()));
        }
    }
    Ok(())
}

/// 192-bit URL-safe opaque token.
fn generate_share_token() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("ps_{}", URL_SAFE_NO_PAD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;
    use std::time::Duration;

    async fn service() -> (ShareService, SqlitePool, Arc<SessionRegistry>) {
        let pool = create_test_pool().await.unwrap();
        let sessions = Arc::new(SessionRegistry::new(Duration::from_millis(200)));
        (
            ShareService::new(pool.clone(), sessions.clone()),
            pool,
            sessions,
        )
    }

    async fn insert_node(pool: &SqlitePool, name: &str, port_range: &str, is_remote: i64) -> i64 {
        sqlx::query(
            "INSERT INTO node(name, secret, server_ip, server_ip_v4, port, version,
                              http, tls, socks, status, is_remote, created_time, updated_time)
             VALUES (?1, ?2, '10.0.0.1', '10.0.0.1', ?3, 'v1', 1, 1, 1, 1, ?4, 0, 0)",
        )
        .bind(name)
        .bind(format!("{name}-secret"))
        .bind(port_range)
        .bind(is_remote)
        .execute(pool)
        .await
        .unwrap()
        .last_insert_rowid()
    }

    fn share_request(node_id: i64, start: i64, end: i64) -> CreatePeerShareRequest {
        CreatePeerShareRequest {
            name: "test-share".into(),
            node_id,
            max_bandwidth: 0,
            expiry_time: 0,
            port_range_start: start,
            port_range_end: end,
            allowed_domains: None,
            allowed_ips: None,
        }
    }

    fn reserve_request(resource_key: &str, port: i64) -> ReserveRequest {
        ReserveRequest {
            resource_key: resource_key.into(),
            role: "exit".into(),
            chain_name: "t1".into(),
            protocol: "tls".into(),
            strategy: "round".into(),
            port,
            target: String::new(),
            binding_id: "t1#3.0".into(),
        }
    }

    fn live_session(sessions: &Arc<SessionRegistry>, node_id: i64) {
        use crate::services::session_registry::{spawn_echo_node, NodeSession};
        use crate::services::wire_crypto::NodeCipher;
        let (session, rx) = NodeSession::new(node_id, NodeCipher::from_secret("s"));
        sessions.register(session.clone());
        spawn_echo_node(session, rx);
    }

    // -----------------------------------------------------------------------
    // validate_allowed_ips
    // -----------------------------------------------------------------------

    #[test]
    fn test_allowed_ips_accepts_v4_v6_and_cidr() {
        assert!(validate_allowed_ips("203.0.113.10").is_ok());
        assert!(validate_allowed_ips("2001:db8::1").is_ok());
        assert!(validate_allowed_ips("203.0.113.0/24, 2001:db8::/64").is_ok());
        assert!(validate_allowed_ips("").is_ok());
    }

    #[test]
    fn test_allowed_ips_rejects_garbage_entry() {
        let err = validate_allowed_ips("203.0.113.10, bad-ip-entry").unwrap_err();
        assert!(err.to_string().contains("Invalid allowed IP or CIDR"));
    }

    // -----------------------------------------------------------------------
    // create
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_create_rejects_remote_node() {
        let (svc, pool, _) = service().await;
        let node_id = insert_node(&pool, "shadow", "20000-20010", 1).await;

        let err = svc.create(&share_request(node_id, 20000, 20010)).await.unwrap_err();
        assert_eq!(err.to_string(), "Only local nodes can be shared");

        let count: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM peer_share")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_create_rejects_range_outside_node() {
        let (svc, pool, _) = service().await;
        let node_id = insert_node(&pool, "n1", "21000-21010", 0).await;

        assert!(svc.create(&share_request(node_id, 20999, 21010)).await.is_err());
        assert!(svc.create(&share_request(node_id, 21000, 21011)).await.is_err());
        assert!(svc.create(&share_request(node_id, 21005, 21004)).await.is_err());
        assert!(svc.create(&share_request(node_id, 21000, 21010)).await.is_ok());
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_allowed_ips() {
        let (svc, pool, _) = service().await;
        let node_id = insert_node(&pool, "n1", "21000-21010", 0).await;

        let mut req = share_request(node_id, 21000, 21010);
        req.allowed_ips = Some("bad-ip-entry".into());

        let err = svc.create(&req).await.unwrap_err();
        assert!(err.to_string().contains("Invalid allowed IP or CIDR"));

        let count: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM peer_share")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_create_generates_unique_urlsafe_token() {
        let (svc, pool, _) = service().await;
        let node_id = insert_node(&pool, "n1", "21000-21010", 0).await;

        let (_, t1) = svc.create(&share_request(node_id, 21000, 21005)).await.unwrap();
        let (_, t2) = svc.create(&share_request(node_id, 21006, 21010)).await.unwrap();

        assert_ne!(t1, t2);
        assert!(t1.len() > 20);
        assert!(t1
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
    }

    // -----------------------------------------------------------------------
    // reserve / commit / release
    // -----------------------------------------------------------------------

    async fn provisioned_share(
        svc: &ShareService,
        pool: &SqlitePool,
    ) -> (PeerShare, i64) {
        let node_id = insert_node(pool, "p1", "44000-44010", 0).await;
        let (share_id, _) = svc.create(&share_request(node_id, 44000, 44010)).await.unwrap();
        (PeerShare::by_id(pool, share_id).await.unwrap().unwrap(), node_id)
    }

    #[tokio::test]
    async fn test_reserve_requires_live_session() {
        let (svc, pool, _) = service().await;
        let (share, _) = provisioned_share(&svc, &pool).await;

        let err = svc.reserve(&share, &reserve_request("rk-1", 0)).await.unwrap_err();
        assert!(matches!(err, AppError::NodeOffline(_)));
    }

    #[tokio::test]
    async fn test_reserve_allocates_lowest_and_names_service() {
        let (svc, pool, sessions) = service().await;
        let (share, node_id) = provisioned_share(&svc, &pool).await;
        live_session(&sessions, node_id);

        let reply = svc.reserve(&share, &reserve_request("rk-1", 0)).await.unwrap();
        assert_eq!(reply.port, 44000);

        let runtime = PeerShareRuntime::by_reservation_id(&pool, &reply.reservation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(runtime.service_name, format!("fed_svc_{}", runtime.id));
        assert_eq!(runtime.applied, 0);
        assert_eq!(runtime.status, 1);
        assert_eq!(runtime.role, "exit");
    }

    #[tokio::test]
    async fn test_reserve_is_idempotent_on_resource_key() {
        let (svc, pool, sessions) = service().await;
        let (share, node_id) = provisioned_share(&svc, &pool).await;
        live_session(&sessions, node_id);

        let first = svc.reserve(&share, &reserve_request("rk-1", 0)).await.unwrap();
        let second = svc.reserve(&share, &reserve_request("rk-1", 0)).await.unwrap();

        assert_eq!(first.reservation_id, second.reservation_id);
        assert_eq!(first.port, second.port);

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(1) FROM peer_share_runtime WHERE share_id = ?1")
                .bind(share.id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_reserve_requested_port_conflicts() {
        let (svc, pool, sessions) = service().await;
        let (share, node_id) = provisioned_share(&svc, &pool).await;
        live_session(&sessions, node_id);

        svc.reserve(&share, &reserve_request("rk-1", 44003)).await.unwrap();

        let err = svc.reserve(&share, &reserve_request("rk-2", 44003)).await.unwrap_err();
        assert!(err.to_string().starts_with("Port busy"));

        // Out-of-share-range requests are refused even when free.
        let err = svc.reserve(&share, &reserve_request("rk-3", 50000)).await.unwrap_err();
        assert!(err.to_string().starts_with("Port busy"));
    }

    #[tokio::test]
    async fn test_reserve_rejects_inactive_share() {
        let (svc, pool, sessions) = service().await;
        let (mut share, node_id) = provisioned_share(&svc, &pool).await;
        live_session(&sessions, node_id);

        share.is_active = 0;
        assert!(matches!(
            svc.reserve(&share, &reserve_request("rk-1", 0)).await,
            Err(AppError::ShareInactive)
        ));

        share.is_active = 1;
        share.max_bandwidth = 100;
        share.current_flow = 100;
        assert!(matches!(
            svc.reserve(&share, &reserve_request("rk-1", 0)).await,
            Err(AppError::ShareInactive)
        ));
    }

    #[tokio::test]
    async fn test_commit_applies_and_is_idempotent() {
        let (svc, pool, sessions) = service().await;
        let (share, node_id) = provisioned_share(&svc, &pool).await;
        live_session(&sessions, node_id);

        let reply = svc.reserve(&share, &reserve_request("rk-1", 0)).await.unwrap();
        svc.commit(&share, &reply.reservation_id).await.unwrap();
        svc.commit(&share, &reply.reservation_id).await.unwrap();

        let runtime = PeerShareRuntime::by_reservation_id(&pool, &reply.reservation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(runtime.applied, 1);
        assert_eq!(runtime.status, 1);
    }

    #[tokio::test]
    async fn test_commit_without_session_keeps_row_pending() {
        let (svc, pool, sessions) = service().await;
        let (share, node_id) = provisioned_share(&svc, &pool).await;
        live_session(&sessions, node_id);

        let reply = svc.reserve(&share, &reserve_request("rk-1", 0)).await.unwrap();

        // Session drops between reserve and commit.
        let session = sessions.get(node_id).unwrap();
        sessions.unregister(&session);

        let err = svc.commit(&share, &reply.reservation_id).await.unwrap_err();
        assert!(matches!(err, AppError::NodeOffline(_)));

        let runtime = PeerShareRuntime::by_reservation_id(&pool, &reply.reservation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(runtime.applied, 0);
        assert_eq!(runtime.status, 1);
    }

    #[tokio::test]
    async fn test_release_is_idempotent_and_frees_port() {
        let (svc, pool, sessions) = service().await;
        let (share, node_id) = provisioned_share(&svc, &pool).await;
        live_session(&sessions, node_id);

        let reply = svc.reserve(&share, &reserve_request("rk-1", 0)).await.unwrap();
        svc.commit(&share, &reply.reservation_id).await.unwrap();

        svc.release(&share, &reply.reservation_id).await.unwrap();
        svc.release(&share, &reply.reservation_id).await.unwrap();
        // Unknown reservation ids are fine too.
        svc.release(&share, "no-such-reservation").await.unwrap();

        let runtime = PeerShareRuntime::by_reservation_id(&pool, &reply.reservation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(runtime.status, 0);

        // The slot is reusable and gets the same port again.
        let again = svc.reserve(&share, &reserve_request("rk-1", 0)).await.unwrap();
        assert_ne!(again.reservation_id, reply.reservation_id);
        assert_eq!(again.port, reply.port);
    }

    #[tokio::test]
    async fn test_commit_unknown_reservation_fails() {
        let (svc, pool, sessions) = service().await;
        let (share, node_id) = provisioned_share(&svc, &pool).await;
        live_session(&sessions, node_id);

        let err = svc.commit(&share, "missing").await.unwrap_err();
        assert!(matches!(err, AppError::ReservationNotFound(_)));
    }
}
