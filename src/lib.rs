//! Gateport - Tunnel Panel Control Plane
//!
//! Management panel for multi-hop forwarding tunnels with cross-panel
//! federation: peer panels lease slices of each other's node port
//! ranges through scoped share tokens.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;

pub use config::Config;
pub use error::{AppError, Result};
