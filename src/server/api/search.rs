// Semantic search endpoint

use super::ApiError;
use crate::server::WorkerState;
use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub query: String,
    pub project: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    10
}

#[derive(Debug, Serialize)]
pub struct SearchHit {
    pub id: i64,
    pub kind: &'static str,
    pub title: String,
    pub snippet: String,
    pub score: Option<f32>,
    pub created_at_epoch: i64,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    /// True when the vector mirror was unavailable and the results came
    /// from structured keyword search only.
    pub degraded: bool,
}

/// GET /api/search/observations - semantic search with keyword fallback.
/// Mirror outages degrade, they never 5xx.
pub async fn search_observations(
    State(state): State<WorkerState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<SearchResponse>, ApiError> {
    if query.query.trim().is_empty() {
        return Err(ApiError::BadRequest("query is required".into()));
    }

    // Vector path first, when a project scopes the collection.
    if let Some(project) = &query.project {
        match state.mirror.search(project, &query.query, None, query.limit) {
            Ok(matches) if !matches.is_empty() => {
                let hits = matches
                    .into_iter()
                    .map(|m| SearchHit {
                        id: m.doc_id,
                        kind: match m.kind {
                            crate::vector::DocKind::Observation => "observation",
                            crate::vector::DocKind::Summary => "summary",
                            crate::vector::DocKind::Prompt => "prompt",
                        },
                        title: first_line(&m.text),
                        snippet: crate::util::truncate_utf8_safe(&m.text, 300).to_string(),
                        score: Some(m.score),
                        created_at_epoch: m.created_at_epoch,
                    })
                    .collect();
                return Ok(Json(SearchResponse { hits, degraded: false }));
            }
            Ok(_) => {} // empty collection or degraded backend: fall through
            Err(e) => {
                tracing::warn!("Mirror search failed, degrading to keyword: {}", e);
            }
        }
    }

    let rows = state
        .store
        .search_observations_text(&query.query, query.project.as_deref(), query.limit)
        .map_err(ApiError::internal)?;
    let hits = rows
        .into_iter()
        .map(|o| SearchHit {
            id: o.id,
            kind: "observation",
            title: o.title.clone(),
            snippet: o
                .narrative
                .as_deref()
                .map(|n| crate::util::truncate_utf8_safe(n, 300).to_string())
                .unwrap_or_default(),
            score: None,
            created_at_epoch: o.created_at_epoch,
        })
        .collect();
    Ok(Json(SearchResponse { hits, degraded: true }))
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or_default().to_string()
}
