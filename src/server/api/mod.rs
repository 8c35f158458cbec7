// HTTP API module - the worker's REST + SSE surface
//
// All endpoints return JSON (except the context document and the SSE
// stream) and are designed for local consumption only.
// Security: binds to 127.0.0.1 by default (localhost only).

mod context;
mod health;
mod logs;
mod search;
mod sessions;
mod stream;
mod timeline;

pub use context::{get_context_inject, get_context_recent};
pub use health::{get_health, get_queue_stats, get_stats};
pub use logs::get_logs;
pub use search::search_observations;
pub use sessions::{session_complete, session_init, session_observations, session_summarize};
pub use stream::get_stream;
pub use timeline::timeline_by_query;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// Handler error type. Read endpoints never surface mirror outages as
/// 5xx - degraded reads return partial data instead.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl ApiError {
    pub fn internal(e: impl std::fmt::Display) -> Self {
        Self::Internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m),
            Self::Internal(m) => {
                tracing::error!("API error: {}", m);
                (StatusCode::INTERNAL_SERVER_ERROR, m)
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
