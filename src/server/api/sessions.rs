// Session endpoints - hook events enter the worker here
//
// Writes are queue-only: the handler commits the row, pokes the session's
// agent, and returns. Provider work happens later on the agent loop, so a
// slow provider can never back up the editor hooks.

use super::ApiError;
use crate::agent::WindDownReason;
use crate::server::WorkerState;
use crate::store::{MessageType, NewPendingMessage, SessionStatus};
use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// How long the completion hook waits for in-flight work to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(60);
const DRAIN_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
pub struct InitRequest {
    pub content_session_id: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub prompt: String,
    pub custom_title: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InitResponse {
    pub session_db_id: i64,
}

/// POST /api/sessions/init - create or reuse the session, append the
/// prompt with the next prompt number.
pub async fn session_init(
    State(state): State<WorkerState>,
    Json(request): Json<InitRequest>,
) -> Result<Json<InitResponse>, ApiError> {
    if request.content_session_id.is_empty() {
        return Err(ApiError::BadRequest("content_session_id is required".into()));
    }

    let session_db_id = state
        .store
        .create_session(
            &request.content_session_id,
            &request.project,
            if request.prompt.is_empty() { None } else { Some(&request.prompt) },
            request.custom_title.as_deref(),
            Some(state.settings.worker_port),
        )
        .map_err(ApiError::internal)?;

    if !request.prompt.is_empty() {
        let prompt_number = state
            .store
            .next_prompt_number(&request.content_session_id)
            .map_err(ApiError::internal)?;
        let prompt_id = state
            .store
            .append_prompt(&request.content_session_id, prompt_number, &request.prompt)
            .map_err(ApiError::internal)?;

        // Best-effort mirror; the relational row is the source of truth.
        state.mirror.sync_prompt(
            &request.project,
            &crate::store::UserPromptRow {
                id: prompt_id,
                content_session_id: request.content_session_id.clone(),
                prompt_number,
                prompt_text: request.prompt.clone(),
                created_at_epoch: crate::util::now_epoch_ms(),
            },
        );
    }

    Ok(Json(InitResponse { session_db_id }))
}

#[derive(Debug, Deserialize)]
pub struct ObservationRequest {
    pub content_session_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
    #[serde(default)]
    pub tool_response: Value,
    pub cwd: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub queued: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<&'static str>,
}

/// POST /api/sessions/observations - enqueue one tool event.
/// Fire-and-forget: OK as soon as the row is committed.
pub async fn session_observations(
    State(state): State<WorkerState>,
    Json(request): Json<ObservationRequest>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    let session = state
        .store
        .get_session_by_content_id(&request.content_session_id)
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::NotFound("unknown session; call /api/sessions/init first".into()))?;

    if state.settings.skip_tools.iter().any(|t| t == &request.tool_name) {
        return Ok(Json(EnqueueResponse { queued: false, message_id: None, skipped: Some("tool") }));
    }
    if state.settings.is_project_excluded(&session.project) {
        return Ok(Json(EnqueueResponse { queued: false, message_id: None, skipped: Some("project") }));
    }

    let message_id = state
        .store
        .enqueue(&NewPendingMessage {
            session_db_id: session.id,
            content_session_id: session.content_session_id.clone(),
            message_type: MessageType::Observation,
            tool_name: Some(request.tool_name),
            tool_input: Some(request.tool_input.to_string()),
            tool_response: Some(request.tool_response.to_string()),
            cwd: request.cwd,
            last_assistant_message: None,
            prompt_number: Some(session.prompt_counter),
        })
        .map_err(ApiError::internal)?;

    state.registry.ensure_agent(&session);

    Ok(Json(EnqueueResponse { queued: true, message_id: Some(message_id), skipped: None }))
}

#[derive(Debug, Deserialize)]
pub struct SummarizeRequest {
    pub content_session_id: String,
    #[serde(default)]
    pub last_assistant_message: String,
}

/// POST /api/sessions/summarize - enqueue a summarize work item.
pub async fn session_summarize(
    State(state): State<WorkerState>,
    Json(request): Json<SummarizeRequest>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    let session = state
        .store
        .get_session_by_content_id(&request.content_session_id)
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::NotFound("unknown session".into()))?;

    let message_id = state
        .store
        .enqueue(&NewPendingMessage {
            session_db_id: session.id,
            content_session_id: session.content_session_id.clone(),
            message_type: MessageType::Summarize,
            tool_name: None,
            tool_input: None,
            tool_response: None,
            cwd: None,
            last_assistant_message: Some(request.last_assistant_message),
            prompt_number: Some(session.prompt_counter),
        })
        .map_err(ApiError::internal)?;

    state.registry.ensure_agent(&session);

    Ok(Json(EnqueueResponse { queued: true, message_id: Some(message_id), skipped: None }))
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub content_session_id: String,
}

#[derive(Debug, Serialize)]
pub struct CompleteResponse {
    pub accepted: bool,
}

/// POST /api/sessions/complete - mark the session complete once in-flight
/// work drains. The drain happens in the background; the hook returns
/// immediately.
pub async fn session_complete(
    State(state): State<WorkerState>,
    Json(request): Json<CompleteRequest>,
) -> Result<Json<CompleteResponse>, ApiError> {
    let session = state
        .store
        .get_session_by_content_id(&request.content_session_id)
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::NotFound("unknown session".into()))?;

    let store = state.store.clone();
    let registry = state.registry.clone();
    tokio::spawn(async move {
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        loop {
            match store.in_flight_count(session.id) {
                Ok(0) => break,
                Ok(_) if tokio::time::Instant::now() >= deadline => {
                    tracing::warn!(
                        "Session {}: completion drain timed out with work in flight",
                        session.id
                    );
                    break;
                }
                Ok(_) => tokio::time::sleep(DRAIN_POLL).await,
                Err(e) => {
                    tracing::warn!("Session {}: drain check failed: {}", session.id, e);
                    break;
                }
            }
        }
        // The agent (if running) winds down as Complete; either way the
        // session row flips to completed.
        registry.wind_down(session.id, WindDownReason::Complete);
        if let Err(e) = store.set_session_status(session.id, SessionStatus::Completed) {
            tracing::warn!("Session {}: completion status update failed: {}", session.id, e);
        }
    });

    Ok(Json(CompleteResponse { accepted: true }))
}
