// Log tail endpoint

use super::ApiError;
use crate::logtail::tail_lines;
use crate::server::WorkerState;
use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::path::Component;

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    /// Log file name within the logs directory (no path separators).
    pub file: String,
    #[serde(default = "default_tail")]
    pub tail: usize,
}

fn default_tail() -> usize {
    100
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub file: String,
    pub lines: Vec<String>,
}

/// GET /api/logs - last N lines of a worker log file. Reads from the end
/// of the file only; never loads the whole file.
pub async fn get_logs(
    State(state): State<WorkerState>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogsResponse>, ApiError> {
    // The file parameter must stay inside the logs directory.
    let components: Vec<Component> = std::path::Path::new(&query.file).components().collect();
    if components.len() != 1 || !matches!(components[0], Component::Normal(_)) {
        return Err(ApiError::BadRequest("file must be a bare file name".into()));
    }

    let path = state.settings.logs_dir().join(&query.file);
    if !path.exists() {
        return Err(ApiError::NotFound(format!("no such log file: {}", query.file)));
    }

    let tail = query.tail.min(10_000);
    let lines = tail_lines(&path, tail).map_err(ApiError::internal)?;
    Ok(Json(LogsResponse { file: query.file, lines }))
}
