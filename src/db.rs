//! Database connection pool setup and schema bootstrap.
//!
//! The panel runs on an embedded SQLite store in WAL mode with a single
//! writer. Schema bootstrap is idempotent: tables are created if missing
//! and later additions (the dual-stack IP split) are applied as additive
//! `ALTER TABLE` statements guarded by `PRAGMA table_info`, never as
//! destructive rewrites.

use crate::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;

/// Create a new database connection pool
pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(sqlx::Error::from)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Create a single-connection in-memory pool for tests.
pub async fn create_test_pool() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(sqlx::Error::from)?
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    ensure_schema(&pool).await?;
    Ok(pool)
}

const CREATE_TABLES: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS node (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        secret TEXT NOT NULL,
        server_ip TEXT NOT NULL DEFAULT '',
        port TEXT NOT NULL DEFAULT '',
        interface_name TEXT NOT NULL DEFAULT '',
        version TEXT NOT NULL DEFAULT '',
        http INTEGER NOT NULL DEFAULT 0,
        tls INTEGER NOT NULL DEFAULT 0,
        socks INTEGER NOT NULL DEFAULT 0,
        status INTEGER NOT NULL DEFAULT 0,
        tcp_listen_addr TEXT NOT NULL DEFAULT '[::]',
        udp_listen_addr TEXT NOT NULL DEFAULT '[::]',
        inx INTEGER NOT NULL DEFAULT 0,
        is_remote INTEGER NOT NULL DEFAULT 0,
        remote_url TEXT NOT NULL DEFAULT '',
        remote_token TEXT NOT NULL DEFAULT '',
        remote_config TEXT NOT NULL DEFAULT '',
        created_time INTEGER NOT NULL DEFAULT 0,
        updated_time INTEGER NOT NULL DEFAULT 0
    )"#,
    r#"CREATE TABLE IF NOT EXISTS peer_share (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        node_id INTEGER NOT NULL,
        token TEXT NOT NULL UNIQUE,
        max_bandwidth INTEGER NOT NULL DEFAULT 0,
        current_flow INTEGER NOT NULL DEFAULT 0,
        expiry_time INTEGER NOT NULL DEFAULT 0,
        port_range_start INTEGER NOT NULL,
        port_range_end INTEGER NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        allowed_domains TEXT NOT NULL DEFAULT '',
        allowed_ips TEXT NOT NULL DEFAULT '',
        created_time INTEGER NOT NULL DEFAULT 0,
        updated_time INTEGER NOT NULL DEFAULT 0
    )"#,
    r#"CREATE TABLE IF NOT EXISTS peer_share_runtime (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        share_id INTEGER NOT NULL,
        node_id INTEGER NOT NULL,
        reservation_id TEXT NOT NULL,
        resource_key TEXT NOT NULL,
        binding_id TEXT NOT NULL DEFAULT '',
        role TEXT NOT NULL DEFAULT '',
        chain_name TEXT NOT NULL DEFAULT '',
        service_name TEXT NOT NULL DEFAULT '',
        protocol TEXT NOT NULL DEFAULT '',
        strategy TEXT NOT NULL DEFAULT '',
        port INTEGER NOT NULL DEFAULT 0,
        target TEXT NOT NULL DEFAULT '',
        applied INTEGER NOT NULL DEFAULT 0,
        status INTEGER NOT NULL DEFAULT 1,
        created_time INTEGER NOT NULL DEFAULT 0,
        updated_time INTEGER NOT NULL DEFAULT 0,
        UNIQUE(share_id, reservation_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS federation_tunnel_binding (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tunnel_id INTEGER NOT NULL,
        chain_type INTEGER NOT NULL,
        chain_tunnel_id INTEGER NOT NULL DEFAULT 0,
        remote_node_id INTEGER NOT NULL,
        remote_share_token TEXT NOT NULL,
        peer_url TEXT NOT NULL,
        peer_reservation_id TEXT NOT NULL,
        status INTEGER NOT NULL DEFAULT 1,
        created_time INTEGER NOT NULL DEFAULT 0,
        updated_time INTEGER NOT NULL DEFAULT 0
    )"#,
    r#"CREATE TABLE IF NOT EXISTS tunnel (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        type INTEGER NOT NULL DEFAULT 1,
        flow INTEGER NOT NULL DEFAULT 0,
        status INTEGER NOT NULL DEFAULT 1,
        user_id INTEGER NOT NULL DEFAULT 0,
        created_time INTEGER NOT NULL DEFAULT 0,
        updated_time INTEGER NOT NULL DEFAULT 0
    )"#,
    r#"CREATE TABLE IF NOT EXISTS chain_tunnel (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tunnel_id INTEGER NOT NULL,
        chain_type INTEGER NOT NULL,
        node_id INTEGER NOT NULL,
        port INTEGER NOT NULL DEFAULT 0,
        inx INTEGER NOT NULL DEFAULT 0,
        protocol TEXT NOT NULL DEFAULT '',
        strategy TEXT NOT NULL DEFAULT ''
    )"#,
    r#"CREATE TABLE IF NOT EXISTS forward_port (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        forward_id INTEGER NOT NULL,
        node_id INTEGER NOT NULL,
        port INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS user_tunnel (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        tunnel_id INTEGER NOT NULL,
        in_flow INTEGER NOT NULL DEFAULT 0,
        out_flow INTEGER NOT NULL DEFAULT 0,
        updated_time INTEGER NOT NULL DEFAULT 0
    )"#,
    r#"CREATE TABLE IF NOT EXISTS pending_release (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        peer_url TEXT NOT NULL,
        share_token TEXT NOT NULL,
        reservation_id TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        created_time INTEGER NOT NULL DEFAULT 0,
        updated_time INTEGER NOT NULL DEFAULT 0
    )"#,
];

const CREATE_INDEXES: &[&str] = &[
    // One live reservation per (share, resource_key): reserve dedupe key.
    r#"CREATE UNIQUE INDEX IF NOT EXISTS ux_runtime_share_resource
        ON peer_share_runtime(share_id, resource_key) WHERE status = 1"#,
    // One live reservation per (node, port).
    r#"CREATE UNIQUE INDEX IF NOT EXISTS ux_runtime_node_port
        ON peer_share_runtime(node_id, port) WHERE status = 1"#,
    // Chain hops and ingress ports may not double-book a node port.
    // Entry hops carry port 0 and are exempt.
    r#"CREATE UNIQUE INDEX IF NOT EXISTS ux_chain_node_port
        ON chain_tunnel(node_id, port) WHERE port > 0"#,
    r#"CREATE UNIQUE INDEX IF NOT EXISTS ux_forward_node_port
        ON forward_port(node_id, port)"#,
    r#"CREATE INDEX IF NOT EXISTS ix_runtime_service_name
        ON peer_share_runtime(service_name)"#,
];

/// Ensure all tables, additive columns and indexes exist.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    for ddl in CREATE_TABLES {
        sqlx::query(ddl).execute(pool).await?;
    }

    ensure_node_dual_stack_columns(pool).await?;

    for ddl in CREATE_INDEXES {
        sqlx::query(ddl).execute(pool).await?;
    }

    Ok(())
}

/// Older databases carry a single `server_ip` column; newer panels split
/// it into `server_ip_v4` / `server_ip_v6`. Add the columns when missing
/// and backfill them from `server_ip`.
async fn ensure_node_dual_stack_columns(pool: &SqlitePool) -> Result<()> {
    let cols = table_columns(pool, "node").await?;

    for (column, ddl) in [
        (
            "server_ip_v4",
            "ALTER TABLE node ADD COLUMN server_ip_v4 TEXT NOT NULL DEFAULT ''",
        ),
        (
            "server_ip_v6",
            "ALTER TABLE node ADD COLUMN server_ip_v6 TEXT NOT NULL DEFAULT ''",
        ),
    ] {
        if !cols.iter().any(|c| c == column) {
            sqlx::query(ddl).execute(pool).await?;
            tracing::info!("schema updated: added node.{}", column);
        }
    }

    backfill_node_dual_stack(pool).await
}

async fn backfill_node_dual_stack(pool: &SqlitePool) -> Result<()> {
    let rows = sqlx::query(
        "SELECT id, server_ip FROM node
         WHERE server_ip != '' AND server_ip_v4 = '' AND server_ip_v6 = ''",
    )
    .fetch_all(pool)
    .await?;

    for row in rows {
        let id: i64 = row.get("id");
        let server_ip: String = row.get("server_ip");
        let trimmed = server_ip.trim();

        let column = match trimmed.parse::<std::net::IpAddr>() {
            Ok(std::net::IpAddr::V4(_)) => "server_ip_v4",
            Ok(std::net::IpAddr::V6(_)) => "server_ip_v6",
            Err(_) => continue,
        };

        sqlx::query(&format!("UPDATE node SET {} = ?1 WHERE id = ?2", column))
            .bind(trimmed)
            .bind(id)
            .execute(pool)
            .await?;
    }

    Ok(())
}

async fn table_columns(pool: &SqlitePool, table: &str) -> Result<Vec<String>> {
    let rows = sqlx::query(&format!("PRAGMA table_info({})", table))
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(|r| r.get::<String, _>("name")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ensure_schema_is_idempotent() {
        let pool = create_test_pool().await.unwrap();
        // A second run must be a no-op, not an error.
        ensure_schema(&pool).await.unwrap();

        let cols = table_columns(&pool, "node").await.unwrap();
        assert!(cols.iter().any(|c| c == "server_ip_v4"));
        assert!(cols.iter().any(|c| c == "server_ip_v6"));
        assert!(cols.iter().any(|c| c == "is_remote"));
    }

    #[tokio::test]
    async fn test_dual_stack_backfill_splits_by_family() {
        let pool = create_test_pool().await.unwrap();

        sqlx::query(
            "INSERT INTO node(name, secret, server_ip, port) VALUES
             ('v4-node', 's1', '203.0.113.7', '1000-1010'),
             ('v6-node', 's2', '2001:db8::1', '1000-1010')",
        )
        .execute(&pool)
        .await
        .unwrap();

        backfill_node_dual_stack(&pool).await.unwrap();

        let v4: String =
            sqlx::query_scalar("SELECT server_ip_v4 FROM node WHERE name = 'v4-node'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(v4, "203.0.113.7");

        let v6: String =
            sqlx::query_scalar("SELECT server_ip_v6 FROM node WHERE name = 'v6-node'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(v6, "2001:db8::1");
    }

    #[tokio::test]
    async fn test_live_runtime_port_uniqueness_enforced() {
        let pool = create_test_pool().await.unwrap();

        let insert = "INSERT INTO peer_share_runtime
            (share_id, node_id, reservation_id, resource_key, port, status)
            VALUES (?1, ?2, ?3, ?4, ?5, 1)";

        sqlx::query(insert)
            .bind(1i64)
            .bind(1i64)
            .bind("res-a")
            .bind("rk-a")
            .bind(3000i64)
            .execute(&pool)
            .await
            .unwrap();

        let dup = sqlx::query(insert)
            .bind(2i64)
            .bind(1i64)
            .bind("res-b")
            .bind("rk-b")
            .bind(3000i64)
            .execute(&pool)
            .await;
        assert!(dup.is_err());

        // Released rows do not hold the port.
        sqlx::query("UPDATE peer_share_runtime SET status = 0 WHERE reservation_id = 'res-a'")
            .execute(&pool)
            .await
            .unwrap();

        sqlx::query(insert)
            .bind(2i64)
            .bind(1i64)
            .bind("res-b")
            .bind("rk-b")
            .bind(3000i64)
            .execute(&pool)
            .await
            .unwrap();
    }
}
