//! Background reconciliation workers.
//!
//! The only durable compensation state is the `pending_release` log:
//! releases that exhausted their inline retries. A periodic worker
//! replays them until the peer accepts; rows survive panel restarts.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::time::interval;

use crate::error::Result;
use crate::models::tunnel::PendingRelease;
use crate::services::federation_client::{FederationClient, PeerEndpoint};

const DRAIN_INTERVAL_SECS: u64 = 60;
const DRAIN_BATCH: i64 = 50;

/// Spawn all background workers.
pub fn spawn_all(db: SqlitePool, federation: Arc<FederationClient>) {
    tokio::spawn(async move {
        // Initial delay to let the server start up
        tokio::time::sleep(Duration::from_secs(10)).await;
        let mut ticker = interval(Duration::from_secs(DRAIN_INTERVAL_SECS));

        loop {
            ticker.tick().await;
            if let Err(e) = drain_pending_releases(&db, &federation).await {
                tracing::warn!("pending-release drain failed: {}", e);
            }
        }
    });
}

/// Replay queued release calls. Each row gets one attempt per tick;
/// success removes the row, failure bumps its attempt counter.
pub async fn drain_pending_releases(
    db: &SqlitePool,
    federation: &FederationClient,
) -> Result<usize> {
    let rows = sqlx::query_as::<_, PendingRelease>(
        "SELECT * FROM pending_release ORDER BY id LIMIT ?1",
    )
    .bind(DRAIN_BATCH)
    .fetch_all(db)
    .await?;

    let mut drained = 0;
    for row in rows {
        let peer = PeerEndpoint {
            base_url: row.peer_url.clone(),
            share_token: row.share_token.clone(),
        };

        match federation.release_once(&peer, &row.reservation_id).await {
            Ok(()) => {
                sqlx::query("DELETE FROM pending_release WHERE id = ?1")
                    .bind(row.id)
                    .execute(db)
                    .await?;
                drained += 1;
                tracing::info!(
                    reservation_id = %row.reservation_id,
                    peer = %row.peer_url,
                    "queued release delivered"
                );
            }
            Err(err) => {
                let now = chrono::Utc::now().timestamp_millis();
                sqlx::query(
                    "UPDATE pending_release SET attempts = attempts + 1, updated_time = ?1
                     WHERE id = ?2",
                )
                .bind(now)
                .bind(row.id)
                .execute(db)
                .await?;
                tracing::debug!(
                    reservation_id = %row.reservation_id,
                    attempts = row.attempts + 1,
                    error = %err,
                    "queued release still failing"
                );
            }
        }
    }

    Ok(drained)
}
