// Context read endpoints

use super::ApiError;
use crate::compose::ComposeOptions;
use crate::config::Settings;
use crate::server::WorkerState;
use crate::store::{ObservationRow, SummaryRow};
use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct InjectQuery {
    /// Comma-separated project list (worktrees pass several).
    #[serde(default)]
    pub projects: String,
    #[serde(default)]
    pub colors: bool,
}

/// GET /api/context/inject - the composed recent-context document.
/// `colors=true` adds terminal escapes for display; the plain form is what
/// assistants ingest.
pub async fn get_context_inject(
    State(state): State<WorkerState>,
    Query(query): Query<InjectQuery>,
) -> Result<String, ApiError> {
    let projects: Vec<String> = query
        .projects
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    if projects.is_empty() {
        return Err(ApiError::BadRequest("projects parameter is required".into()));
    }

    // Display settings re-resolve per request so settings edits apply
    // without a restart.
    let display = Settings::resolve().display;
    let doc = state
        .composer
        .compose(
            &state.mode,
            &ComposeOptions { projects, display, colors: query.colors },
        )
        .map_err(ApiError::internal)?;
    Ok(doc)
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub project: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    20
}

#[derive(Debug, Serialize)]
pub struct RecentResponse {
    pub project: String,
    pub observations: Vec<ObservationRow>,
    pub summaries: Vec<SummaryRow>,
}

/// GET /api/context/recent - structured recent context as JSON.
pub async fn get_context_recent(
    State(state): State<WorkerState>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<RecentResponse>, ApiError> {
    let projects = vec![query.project.clone()];
    let observations = state
        .store
        .recent_observations(&projects, None, None, query.limit)
        .map_err(ApiError::internal)?;
    let summaries = state
        .store
        .recent_summaries(&projects, query.limit.min(10))
        .map_err(ApiError::internal)?;
    Ok(Json(RecentResponse {
        project: query.project,
        observations,
        summaries,
    }))
}
