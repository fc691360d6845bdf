//! Outbound federation RPC to a peer panel.
//!
//! Defines the wire contract of the federation surface (shared with the
//! provider-side handlers) and the retry/compensation policy: transient
//! transport failures back off exponentially, business rejections never
//! retry, and a release that exhausts its retries is parked in the
//! durable `pending_release` log for the background reconciler.

use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sqlx::SqlitePool;
use utoipa::ToSchema;

use crate::api::dto::R;
use crate::error::{AppError, Result};

const BACKOFF_BASE_MS: u64 = 200;
const BACKOFF_CAP_MS: u64 = 2_000;
const RESERVE_ATTEMPTS: u32 = 3;
const RELEASE_ATTEMPTS: u32 = 5;
/// Compensating releases run without the originating request's
/// deadline; each call gets its own cap instead.
const RELEASE_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Stable message prefix the provider uses for port conflicts; the
/// consumer's recovery path keys off it (the envelope carries no
/// machine-readable kind).
pub const PORT_BUSY_PREFIX: &str = "Port busy";

// ---------------------------------------------------------------------------
// Wire contract
// ---------------------------------------------------------------------------

/// Share metadata returned by `share/info`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShareInfo {
    pub share_id: i64,
    pub name: String,
    pub node_name: String,
    /// Address consumers dial when chaining through the shared node.
    pub server_ip: String,
    pub port_range_start: i64,
    pub port_range_end: i64,
    pub http: i64,
    pub tls: i64,
    pub socks: i64,
    pub version: String,
    pub max_bandwidth: i64,
    pub expiry_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReserveRequest {
    /// Consumer-stable idempotency key for this logical slot (≤64 chars).
    pub resource_key: String,
    /// entry / middle / exit
    pub role: String,
    pub chain_name: String,
    pub protocol: String,
    pub strategy: String,
    /// Requested port, 0 = provider picks.
    #[serde(default)]
    pub port: i64,
    /// Upstream address for chain/exit hops.
    #[serde(default)]
    pub target: String,
    /// Consumer-side slot label stored on the runtime row.
    #[serde(default)]
    pub binding_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReserveResponse {
    pub reservation_id: String,
    pub port: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReservationRef {
    pub reservation_id: String,
}

/// One remote hop's connection coordinates.
#[derive(Debug, Clone)]
pub struct PeerEndpoint {
    pub base_url: String,
    pub share_token: String,
}

impl PeerEndpoint {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct FederationClient {
    http: reqwest::Client,
    db: SqlitePool,
}

impl FederationClient {
    pub fn new(db: SqlitePool, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self { http, db }
    }

    /// Fetch share metadata from a peer.
    pub async fn share_info(&self, peer: &PeerEndpoint) -> Result<ShareInfo> {
        self.post_envelope(
            peer,
            "/api/v1/federation/share/info",
            &serde_json::json!({}),
            RESERVE_ATTEMPTS,
            None,
        )
        .await
    }

    /// Reserve a port on the peer's shared node.
    pub async fn reserve(&self, peer: &PeerEndpoint, req: &ReserveRequest) -> Result<ReserveResponse> {
        self.post_envelope(peer, "/api/v1/federation/reserve", req, RESERVE_ATTEMPTS, None)
            .await
    }

    /// Commit a reservation; the provider applies it to its node.
    pub async fn commit(&self, peer: &PeerEndpoint, reservation_id: &str) -> Result<()> {
        let _: serde_json::Value = self
            .post_envelope(
                peer,
                "/api/v1/federation/commit",
                &ReservationRef {
                    reservation_id: reservation_id.to_string(),
                },
                RESERVE_ATTEMPTS,
                None,
            )
            .await?;
        Ok(())
    }

    /// Release a reservation.
    ///
    /// Never fails the caller for peer-side reasons: after the retry
    /// budget the release is appended to `pending_release` and the
    /// reconciler takes over. Only a store failure propagates.
    pub async fn release(&self, peer: &PeerEndpoint, reservation_id: &str) -> Result<()> {
        match self.release_once_with_retries(peer, reservation_id).await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::warn!(
                    peer = %peer.base_url,
                    reservation_id = reservation_id,
                    error = %err,
                    "release failed after retries, queueing for reconciler"
                );
                self.queue_pending_release(peer, reservation_id).await
            }
        }
    }

    /// One release attempt, without the pending-log fallback. Used by the
    /// reconciler, which manages its own schedule.
    pub async fn release_once(&self, peer: &PeerEndpoint, reservation_id: &str) -> Result<()> {
        let _: serde_json::Value = self
            .post_envelope(
                peer,
                "/api/v1/federation/release",
                &ReservationRef {
                    reservation_id: reservation_id.to_string(),
                },
                1,
                Some(RELEASE_CALL_TIMEOUT),
            )
            .await?;
        Ok(())
    }

    async fn release_once_with_retries(
        &self,
        peer: &PeerEndpoint,
        reservation_id: &str,
    ) -> Result<()> {
        let _: serde_json::Value = self
            .post_envelope(
                peer,
                "/api/v1/federation/release",
                &ReservationRef {
                    reservation_id: reservation_id.to_string(),
                },
                RELEASE_ATTEMPTS,
                Some(RELEASE_CALL_TIMEOUT),
            )
            .await?;
        Ok(())
    }

    async fn queue_pending_release(&self, peer: &PeerEndpoint, reservation_id: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        sqlx::query(
            "INSERT INTO pending_release(peer_url, share_token, reservation_id, attempts, created_time, updated_time)
             VALUES (?1, ?2, ?3, 0, ?4, ?4)",
        )
        .bind(&peer.base_url)
        .bind(&peer.share_token)
        .bind(reservation_id)
        .bind(now)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// POST a JSON body and unwrap the peer envelope.
    ///
    /// Transport errors and 5xx responses count as retriable and back
    /// off; an envelope with `code != 0` is a business rejection and is
    /// returned immediately.
    async fn post_envelope<B: Serialize, T: DeserializeOwned>(
        &self,
        peer: &PeerEndpoint,
        path: &str,
        body: &B,
        max_attempts: u32,
        call_timeout: Option<Duration>,
    ) -> Result<T> {
        let url = peer.url(path);
        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }

            let mut builder = self
                .http
                .post(&url)
                .bearer_auth(&peer.share_token)
                .json(body);
            if let Some(timeout) = call_timeout {
                builder = builder.timeout(timeout);
            }
            let sent = builder.send().await;

            let response = match sent {
                Ok(r) => r,
                Err(e) => {
                    last_error = e.to_string();
                    tracing::debug!(url = %url, attempt = attempt + 1, error = %e, "federation rpc failed");
                    continue;
                }
            };

            let status = response.status();
            if status.is_server_error() {
                last_error = format!("peer returned {status}");
                continue;
            }
            if status != StatusCode::OK {
                return Err(AppError::PeerUnreachable(format!(
                    "{url}: unexpected status {status}"
                )));
            }

            let envelope: R<T> = response
                .json()
                .await
                .map_err(|e| AppError::PeerUnreachable(format!("{url}: bad envelope: {e}")))?;

            if envelope.code != 0 {
                return Err(peer_business_error(envelope.code, envelope.msg));
            }
            return match envelope.data {
                Some(data) => Ok(data),
                // Empty-data success (commit/release).
                None => serde_json::from_value(serde_json::Value::Null)
                    .map_err(|e| AppError::PeerUnreachable(format!("{url}: empty data: {e}"))),
            };
        }

        Err(AppError::PeerUnreachable(format!("{url}: {last_error}")))
    }
}

/// Map a peer envelope rejection onto a local error kind.
fn peer_business_error(code: i32, msg: String) -> AppError {
    if msg.starts_with(PORT_BUSY_PREFIX) {
        AppError::PortBusy(msg)
    } else if code == 401 {
        AppError::Unauthenticated
    } else if code == 403 {
        AppError::ForbiddenIp
    } else {
        AppError::PeerRejected(msg)
    }
}

/// Exponential backoff with ±20% jitter: 200 ms base, 2 s cap.
fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(8)) / 2;
    let capped = base.clamp(BACKOFF_BASE_MS, BACKOFF_CAP_MS);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_millis((capped as f64 * jitter) as u64)
}
