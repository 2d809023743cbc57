//! Admin token check for destructive endpoints.
//!
//! When `CHATDIGEST_ADMIN_TOKEN` is unset every caller is admitted.

use std::sync::Arc;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    Json,
};
use serde_json::{json, Value};
use tracing::warn;

use crate::api::AppState;

pub struct RequireAdmin;

#[async_trait]
impl FromRequestParts<Arc<AppState>> for RequireAdmin {
    type Rejection = (StatusCode, Json<Value>);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.admin_token.as_deref() else {
            return Ok(RequireAdmin);
        };

        let presented = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|val| val.to_str().ok())
            .and_then(|header| header.strip_prefix("Bearer "));

        match presented {
            Some(token) if tokens_match(token.trim(), expected) => Ok(RequireAdmin),
            Some(_) => {
                warn!(path = %parts.uri.path(), "Rejected admin request with invalid token");
                Err(unauthorized("Invalid token"))
            }
            None => {
                warn!(path = %parts.uri.path(), "Missing or invalid Authorization header");
                Err(unauthorized("Missing credentials"))
            }
        }
    }
}

fn unauthorized(message: &str) -> (StatusCode, Json<Value>) {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": message })))
}

/// Length-independent comparison over the full input.
fn tokens_match(presented: &str, expected: &str) -> bool {
    let (a, b) = (presented.as_bytes(), expected.as_bytes());
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= usize::from(x ^ y);
    }
    diff == 0
}
