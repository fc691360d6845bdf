//! HTTP middleware.

pub mod auth;
pub mod peer_auth;
