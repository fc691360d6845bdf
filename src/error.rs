//! Application error types and result alias.
//!
//! Every business failure is serialised as the panel envelope
//! `{code, msg, data}` with HTTP status 200; only transport-level
//! failures surface as non-200 responses.

use axum::{
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application result type alias
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error types.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("Invalid or expired token")]
    Unauthenticated,

    #[error("IP not allowed")]
    ForbiddenIp,

    #[error("Only local nodes can be shared")]
    RemoteNodeForbidden,

    #[error("Invalid allowed IP or CIDR: {0}")]
    InvalidAllowedIps(String),

    #[error("Port range out of node bounds: {0}")]
    RangeOutOfBounds(String),

    #[error("Share is disabled, expired or over quota")]
    ShareInactive,

    #[error("Port busy: {0}")]
    PortBusy(String),

    #[error("Node offline: {0}")]
    NodeOffline(String),

    #[error("Reservation not found: {0}")]
    ReservationNotFound(String),

    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    /// Peer answered with a business failure; carries the peer's message.
    #[error("{0}")]
    PeerRejected(String),

    #[error("Database error: {0}")]
    Store(String),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Map error variant to the envelope code.
    ///
    /// Codes follow the panel convention: `-1` business rejection,
    /// `-2` store/internal, `401` authentication, `403` IP policy.
    pub fn code(&self) -> i32 {
        match self {
            Self::Unauthenticated => 401,
            Self::ForbiddenIp => 403,
            Self::Config(_) | Self::Store(_) | Self::Sqlx(_) | Self::Internal(_) => -2,
            _ => -1,
        }
    }

    /// Return a user-facing message. Wrapped foreign errors keep their
    /// text so the operator can see what the store reported.
    fn user_message(&self) -> String {
        match self {
            Self::Json(_) => "Invalid JSON".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = self.code();
        let message = self.user_message();

        tracing::error!(error = %self, code = code, "Request error");

        let body = Json(json!({
            "code": code,
            "msg": message,
            "data": null,
        }));

        body.into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_business_errors_map_to_default_code() {
        assert_eq!(AppError::RemoteNodeForbidden.code(), -1);
        assert_eq!(AppError::PortBusy("44000".into()).code(), -1);
        assert_eq!(AppError::ShareInactive.code(), -1);
        assert_eq!(AppError::NodeOffline("node 3".into()).code(), -1);
    }

    #[test]
    fn test_auth_and_policy_codes() {
        assert_eq!(AppError::Unauthenticated.code(), 401);
        assert_eq!(AppError::ForbiddenIp.code(), 403);
    }

    #[test]
    fn test_store_errors_map_to_minus_two() {
        assert_eq!(AppError::Store("locked".into()).code(), -2);
        assert_eq!(AppError::Internal("boom".into()).code(), -2);
    }

    #[test]
    fn test_literal_messages() {
        assert_eq!(
            AppError::RemoteNodeForbidden.to_string(),
            "Only local nodes can be shared"
        );
        assert_eq!(AppError::ForbiddenIp.to_string(), "IP not allowed");
        assert!(AppError::InvalidAllowedIps("bad-ip-entry".into())
            .to_string()
            .contains("Invalid allowed IP or CIDR"));
    }
}
