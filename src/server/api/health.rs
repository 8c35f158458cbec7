// Health and stats endpoints

use super::ApiError;
use crate::config::VERSION;
use crate::server::WorkerState;
use crate::store::{ProjectStats, QueueStats};
use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub active_agents: usize,
    pub fts_available: bool,
}

/// GET /api/health - liveness.
pub async fn get_health(State(state): State<WorkerState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: VERSION,
        active_agents: state.registry.active_count(),
        fts_available: state.store.fts_available(),
    })
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub project: String,
}

/// GET /api/stats - per-project counters.
pub async fn get_stats(
    State(state): State<WorkerState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<ProjectStats>, ApiError> {
    Ok(Json(
        state
            .store
            .project_stats(&query.project)
            .map_err(ApiError::internal)?,
    ))
}

/// GET /api/queue/stats - queue depth counters.
pub async fn get_queue_stats(
    State(state): State<WorkerState>,
) -> Result<Json<QueueStats>, ApiError> {
    Ok(Json(state.store.queue_stats().map_err(ApiError::internal)?))
}
