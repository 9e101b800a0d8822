// =============================================================================
// API Key Gating — Axum middleware
// =============================================================================
//
// Endpoints fall into three tiers:
//   - public — never require a key (health, schema, leaderboard, models,
//              feeds summaries),
//   - admin  — always require a key when one is configured (backfill
//              triggers, checkpoint mutations),
//   - read   — everything else; gated only when `API_READ_AUTH` is on.
//
// With no `API_KEY` configured everything is open. The key can arrive as an
// `X-API-Key` header, an `Authorization: Bearer` header, or an `api_key`
// query parameter; comparison is constant-time.
// =============================================================================

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::warn;

use crate::config::Config;

/// Compare two byte slices in constant time. Every byte of both slices is
/// examined even after a mismatch so timing reveals nothing about where the
/// difference sits.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Tier gate evaluated for every request.
pub async fn api_key_gate(
    axum::extract::State(config): axum::extract::State<Arc<Config>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    // No key configured → everything open.
    let Some(expected) = config.api_key.as_deref() else {
        return next.run(request).await;
    };

    let path = request.uri().path().to_string();
    let is_public = config.api_public_prefixes.iter().any(|p| path.starts_with(p));
    let is_admin = config.api_admin_prefixes.iter().any(|p| path.starts_with(p));

    let requires_key = if is_public {
        false
    } else if is_admin {
        true
    } else {
        config.api_read_auth
    };

    if requires_key && !request_has_key(&request, expected) {
        warn!(path = %path, "rejected request without valid API key");
        return unauthorized();
    }
    next.run(request).await
}

fn request_has_key(request: &Request<Body>, expected: &str) -> bool {
    // X-API-Key header.
    if let Some(key) = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
    {
        return constant_time_eq(key.as_bytes(), expected.as_bytes());
    }

    // Authorization: Bearer <key>.
    if let Some(auth) = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = auth
            .strip_prefix("Bearer ")
            .or_else(|| auth.strip_prefix("bearer "))
        {
            return constant_time_eq(token.trim().as_bytes(), expected.as_bytes());
        }
    }

    // api_key query parameter.
    if let Some(query) = request.uri().query() {
        for pair in query.split('&') {
            let mut parts = pair.splitn(2, '=');
            if parts.next() == Some("api_key") {
                if let Some(value) = parts.next() {
                    return constant_time_eq(value.as_bytes(), expected.as_bytes());
                }
            }
        }
    }

    false
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "detail": "API key required" })),
    )
        .into_response()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"Secret"));
        assert!(!constant_time_eq(b"short", b"longer"));
        assert!(constant_time_eq(b"", b""));
    }

    fn request(path_and_query: &str) -> Request<Body> {
        Request::builder()
            .uri(path_and_query)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn key_from_header() {
        let mut req = request("/reports/backfill");
        req.headers_mut()
            .insert("x-api-key", "sekrit".parse().unwrap());
        assert!(request_has_key(&req, "sekrit"));
        assert!(!request_has_key(&req, "other"));
    }

    #[test]
    fn key_from_bearer() {
        let mut req = request("/reports/backfill");
        req.headers_mut()
            .insert("authorization", "Bearer sekrit".parse().unwrap());
        assert!(request_has_key(&req, "sekrit"));
    }

    #[test]
    fn key_from_query_param() {
        let req = request("/reports/backfill?api_key=sekrit&limit=5");
        assert!(request_has_key(&req, "sekrit"));
        let req = request("/reports/backfill?limit=5");
        assert!(!request_has_key(&req, "sekrit"));
    }
}
