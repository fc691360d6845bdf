//! Admin authentication middleware.
//!
//! The admin surface uses short-lived HS256 JWTs. The `Authorization`
//! header carries the token either bare or with a `Bearer ` prefix
//! (panel front-ends historically send it bare).

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::api::dto::R;
use crate::api::SharedState;
use crate::error::{AppError, Result};

const TOKEN_TTL_SECS: i64 = 24 * 3600;

/// JWT claims for an admin session.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User id, stringified.
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

/// Extension that holds the authenticated admin identity.
#[derive(Debug, Clone)]
pub struct AuthExtension {
    pub user_id: i64,
}

/// Issue an admin token.
pub fn issue_token(user_id: i64, secret: &str) -> Result<String> {
    let now = chrono::Utc::now().timestamp();
    let claims = Claims {
        sub: user_id.to_string(),
        iat: now,
        exp: now + TOKEN_TTL_SECS,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Internal(format!("token signing failed: {e}")))
}

/// Validate a token and return the admin user id.
pub fn validate_token(token: &str, secret: &str) -> Result<i64> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| AppError::Unauthenticated)?;

    data.claims
        .sub
        .parse::<i64>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or(AppError::Unauthenticated)
}

fn extract_token(request: &Request) -> Option<&str> {
    let header = request.headers().get(AUTHORIZATION)?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ").unwrap_or(header).trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

/// Authentication middleware for the admin surface.
pub async fn admin_middleware(
    State(state): State<SharedState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = extract_token(&request) else {
        return R::err(401, "Invalid or expired token").into_response();
    };

    match validate_token(token, &state.config.jwt_secret) {
        Ok(user_id) => {
            request.extensions_mut().insert(AuthExtension { user_id });
            next.run(request).await
        }
        Err(_) => R::err(401, "Invalid or expired token").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_validate_roundtrip() {
        let token = issue_token(7, "secret").unwrap();
        assert_eq!(validate_token(&token, "secret").unwrap(), 7);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = issue_token(7, "secret-a").unwrap();
        assert!(matches!(
            validate_token(&token, "secret-b"),
            Err(AppError::Unauthenticated)
        ));
    }

    #[test]
    fn test_garbage_token_rejected() {
        assert!(validate_token("not-a-jwt", "secret").is_err());
    }

    #[test]
    fn test_extract_token_accepts_bare_and_bearer() {
        let bare = Request::builder()
            .header(AUTHORIZATION, "raw-token")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(extract_token(&bare), Some("raw-token"));

        let bearer = Request::builder()
            .header(AUTHORIZATION, "Bearer jwt-token")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(extract_token(&bearer), Some("jwt-token"));

        let missing = Request::builder().body(axum::body::Body::empty()).unwrap();
        assert_eq!(extract_token(&missing), None);
    }
}
