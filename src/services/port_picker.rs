//! Port allocation over committed reservations.
//!
//! The store is the sole source of truth: a port on a node is taken when
//! any of `chain_tunnel`, `forward_port` or a live `peer_share_runtime`
//! row holds it. Callers read the used set and pick inside the same
//! transaction that inserts the winning row.

use std::collections::BTreeSet;

use sqlx::SqliteConnection;

use crate::error::{AppError, Result};

/// Ports currently held on a node across all reserving tables.
pub async fn used_ports(conn: &mut SqliteConnection, node_id: i64) -> Result<BTreeSet<i64>> {
    let rows: Vec<i64> = sqlx::query_scalar(
        "SELECT port FROM chain_tunnel WHERE node_id = ?1 AND port > 0
         UNION
         SELECT port FROM forward_port WHERE node_id = ?1
         UNION
         SELECT port FROM peer_share_runtime WHERE node_id = ?1 AND status = 1",
    )
    .bind(node_id)
    .fetch_all(conn)
    .await?;

    Ok(rows.into_iter().collect())
}

/// Pick a port inside `range`.
///
/// A non-zero `requested` port must be inside the range and free, else
/// the call fails with `PortBusy`. With `requested = 0` the preferred
/// hints are tried first in order (hints outside the range or taken are
/// skipped), then the numerically lowest free port wins.
pub fn pick_port(
    used: &BTreeSet<i64>,
    range: (i64, i64),
    requested: i64,
    preferred: &[i64],
) -> Result<i64> {
    let (start, end) = range;

    if requested != 0 {
        if requested < start || requested > end {
            return Err(AppError::PortBusy(format!(
                "port {requested} outside range {start}-{end}"
            )));
        }
        if used.contains(&requested) {
            return Err(AppError::PortBusy(requested.to_string()));
        }
        return Ok(requested);
    }

    for &hint in preferred {
        if hint >= start && hint <= end && !used.contains(&hint) {
            return Ok(hint);
        }
    }

    (start..=end)
        .find(|p| !used.contains(p))
        .ok_or_else(|| AppError::PortBusy(format!("no free port in {start}-{end}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;

    fn set(ports: &[i64]) -> BTreeSet<i64> {
        ports.iter().copied().collect()
    }

    // -----------------------------------------------------------------------
    // pick_port
    // -----------------------------------------------------------------------

    #[test]
    fn test_auto_pick_lowest_free() {
        let used = set(&[3000, 3001, 3002]);
        assert_eq!(pick_port(&used, (3000, 3004), 0, &[]).unwrap(), 3003);
    }

    #[test]
    fn test_auto_pick_empty_node() {
        assert_eq!(pick_port(&set(&[]), (44000, 44010), 0, &[]).unwrap(), 44000);
    }

    #[test]
    fn test_requested_busy_port_fails() {
        let used = set(&[3001]);
        assert!(matches!(
            pick_port(&used, (3000, 3004), 3001, &[]),
            Err(AppError::PortBusy(_))
        ));
    }

    #[test]
    fn test_requested_out_of_range_fails() {
        assert!(pick_port(&set(&[]), (3000, 3004), 2999, &[]).is_err());
        assert!(pick_port(&set(&[]), (3000, 3004), 3005, &[]).is_err());
    }

    #[test]
    fn test_requested_free_port_is_kept() {
        assert_eq!(pick_port(&set(&[]), (3000, 3004), 3002, &[]).unwrap(), 3002);
    }

    #[test]
    fn test_preferred_hints_win_over_lowest() {
        let used = set(&[]);
        assert_eq!(pick_port(&used, (3000, 3010), 0, &[3005, 3001]).unwrap(), 3005);
    }

    #[test]
    fn test_taken_or_foreign_hints_are_skipped() {
        let used = set(&[3005]);
        // 3005 taken, 9999 outside the range: fall through to 3001.
        assert_eq!(
            pick_port(&used, (3000, 3010), 0, &[3005, 9999, 3001]).unwrap(),
            3001
        );
    }

    #[test]
    fn test_exhausted_range_fails() {
        let used = set(&[3000, 3001]);
        assert!(matches!(
            pick_port(&used, (3000, 3001), 0, &[]),
            Err(AppError::PortBusy(_))
        ));
    }

    // -----------------------------------------------------------------------
    // used_ports
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_used_ports_unions_all_reserving_tables() {
        let pool = create_test_pool().await.unwrap();

        sqlx::query(
            "INSERT INTO chain_tunnel(tunnel_id, chain_type, node_id, port, inx, protocol, strategy)
             VALUES (1, 2, 1, 3000, 1, 'tls', 'round')",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO forward_port(forward_id, node_id, port) VALUES (1, 1, 3001)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO peer_share_runtime(share_id, node_id, reservation_id, resource_key, port, status)
             VALUES (77, 1, 'res-1', 'rk-1', 3002, 1)",
        )
        .execute(&pool)
        .await
        .unwrap();
        // Released reservations do not count.
        sqlx::query(
            "INSERT INTO peer_share_runtime(share_id, node_id, reservation_id, resource_key, port, status)
             VALUES (77, 1, 'res-2', 'rk-2', 3003, 0)",
        )
        .execute(&pool)
        .await
        .unwrap();
        // Other nodes do not count.
        sqlx::query("INSERT INTO forward_port(forward_id, node_id, port) VALUES (2, 9, 3004)")
            .execute(&pool)
            .await
            .unwrap();

        let mut conn = pool.acquire().await.unwrap();
        let used = used_ports(&mut conn, 1).await.unwrap();
        assert_eq!(used, set(&[3000, 3001, 3002]));

        // The auto pick over this state lands on 3003.
        assert_eq!(pick_port(&used, (3000, 3004), 0, &[]).unwrap(), 3003);
        assert!(pick_port(&used, (3000, 3004), 3001, &[]).is_err());
    }
}
