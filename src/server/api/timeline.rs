// Timeline browsing endpoint
//
// Anchors on the best semantic match for a query, widens by observation-id
// offsets, and returns every record type inside the resulting time window.

use super::ApiError;
use crate::server::WorkerState;
use crate::store::{ObservationRow, SummaryRow, UserPromptRow};
use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct TimelineQuery {
    pub query: String,
    pub project: Option<String>,
    #[serde(default = "default_depth")]
    pub depth_before: usize,
    #[serde(default = "default_depth")]
    pub depth_after: usize,
    /// Anchor selection mode; only `auto` is implemented.
    #[serde(default = "default_mode")]
    pub mode: String,
}

fn default_depth() -> usize {
    5
}

fn default_mode() -> String {
    "auto".to_string()
}

#[derive(Debug, Serialize)]
pub struct TimelineWindow {
    pub start_epoch: i64,
    pub end_epoch: i64,
}

#[derive(Debug, Serialize)]
pub struct TimelineResponse {
    pub anchor_id: i64,
    pub window: TimelineWindow,
    pub observations: Vec<ObservationRow>,
    pub summaries: Vec<SummaryRow>,
    pub prompts: Vec<UserPromptRow>,
    pub degraded: bool,
}

/// GET /api/timeline/by-query
pub async fn timeline_by_query(
    State(state): State<WorkerState>,
    Query(query): Query<TimelineQuery>,
) -> Result<Json<TimelineResponse>, ApiError> {
    if query.mode != "auto" {
        return Err(ApiError::BadRequest(format!("unknown mode {:?}", query.mode)));
    }

    // Anchor via the mirror when possible, keyword search otherwise.
    let mut degraded = false;
    let anchor = match query.project.as_deref() {
        Some(project) => match state.mirror.best_observation_match(project, &query.query) {
            Ok(Some(m)) => state.store.get_observation(m.doc_id).map_err(ApiError::internal)?,
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Mirror anchor failed, degrading: {}", e);
                degraded = true;
                None
            }
        },
        None => None,
    };
    let anchor = match anchor {
        Some(anchor) => anchor,
        None => {
            degraded = degraded || query.project.is_none();
            state
                .store
                .search_observations_text(&query.query, query.project.as_deref(), 1)
                .map_err(ApiError::internal)?
                .into_iter()
                .next()
                .ok_or_else(|| ApiError::NotFound("no observation matches the query".into()))?
        }
    };

    let observations = state
        .store
        .observations_around(anchor.id, query.depth_before, query.depth_after)
        .map_err(ApiError::internal)?;

    let start_epoch = observations
        .first()
        .map(|o| o.created_at_epoch)
        .unwrap_or(anchor.created_at_epoch);
    let end_epoch = observations
        .last()
        .map(|o| o.created_at_epoch)
        .unwrap_or(anchor.created_at_epoch);

    let project = anchor.project.clone();
    let summaries = state
        .store
        .summaries_in_window(&project, start_epoch, end_epoch)
        .map_err(ApiError::internal)?;
    let prompts = state
        .store
        .prompts_in_window(&project, start_epoch, end_epoch)
        .map_err(ApiError::internal)?;

    Ok(Json(TimelineResponse {
        anchor_id: anchor.id,
        window: TimelineWindow { start_epoch, end_epoch },
        observations,
        summaries,
        prompts,
        degraded,
    }))
}
