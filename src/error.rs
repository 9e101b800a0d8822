// =============================================================================
// Error Taxonomy
// =============================================================================
//
// Typed errors for everything that crosses a component boundary. Worker loops
// log and continue; only the HTTP layer maps these onto status codes.
// =============================================================================

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Input/output/score payload failed schema validation.
    #[error("validation error: {0}")]
    Validation(String),

    /// The challenge scoring function rejected a prediction.
    #[error("scoring error: {0}")]
    Scoring(String),

    /// Retryable store failure; the cycle rolls back and retries.
    #[error("store error: {0}")]
    Store(String),

    /// A feed adapter failed; swallowed at the adapter, retried next poll.
    #[error("feed adapter error: {0}")]
    FeedAdapter(String),

    /// Mutation out of status order, or a second concurrent backfill.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Missing or invalid API key on a gated endpoint.
    #[error("unauthorized: {0}")]
    Auth(String),

    /// Unrecoverable misconfiguration detected at startup.
    #[error("startup error: {0}")]
    Startup(String),
}

impl CoordinatorError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            CoordinatorError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CoordinatorError::Conflict(_) => StatusCode::CONFLICT,
            CoordinatorError::NotFound(_) => StatusCode::NOT_FOUND,
            CoordinatorError::Auth(_) => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for CoordinatorError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "detail": self.to_string() });
        (self.status_code(), Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping() {
        assert_eq!(
            CoordinatorError::Conflict("busy".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            CoordinatorError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            CoordinatorError::Auth("key".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            CoordinatorError::Validation("bad".into()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }
}
