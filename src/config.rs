//! Application configuration loaded from environment variables.

use crate::error::{AppError, Result};
use std::env;

/// Read an environment variable and parse it, falling back to a default on missing or invalid values.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database URL (e.g. `sqlite://gateport.db`)
    pub database_url: String,

    /// Server bind address (host:port)
    pub bind_address: String,

    /// Log level
    pub log_level: String,

    /// JWT secret key for signing admin tokens
    pub jwt_secret: String,

    /// Comma-separated CIDRs whose `RemoteAddr` is trusted to forward
    /// the real client IP via `X-Forwarded-For`
    pub trusted_proxies: String,

    /// Outbound federation RPC timeout in seconds (per attempt)
    pub federation_timeout_secs: u64,

    /// Node control-channel command timeout in seconds
    pub node_command_timeout_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://gateport.db?mode=rwc".into()),
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:6365".into()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            jwt_secret: env::var("JWT_SECRET")
                .map_err(|_| AppError::Config("JWT_SECRET not set".into()))?,
            trusted_proxies: env::var("TRUSTED_PROXIES").unwrap_or_else(|_| {
                "10.0.0.0/8,172.16.0.0/12,192.168.0.0/16,127.0.0.0/8,::1/128".into()
            }),
            federation_timeout_secs: env_parse("FEDERATION_TIMEOUT_SECS", 30),
            node_command_timeout_secs: env_parse("NODE_COMMAND_TIMEOUT_SECS", 5),
        })
    }

    /// Build a config suitable for tests without touching the process env.
    pub fn for_tests(jwt_secret: &str) -> Self {
        Self {
            database_url: "sqlite::memory:".into(),
            bind_address: "127.0.0.1:0".into(),
            log_level: "debug".into(),
            jwt_secret: jwt_secret.into(),
            trusted_proxies: "10.0.0.0/8,172.16.0.0/12,192.168.0.0/16,127.0.0.0/8,::1/128".into(),
            federation_timeout_secs: 5,
            node_command_timeout_secs: 2,
        }
    }
}
