//! Row types for the relational store
//!
//! All integer times are milliseconds since the Unix epoch. JSON-array
//! columns (`facts`, `concepts`, file lists) are stored as JSON text and
//! surfaced as `Vec<String>`.

use serde::{Deserialize, Serialize};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One user conversation, keyed by the editor-assigned content session id.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRow {
    pub id: i64,
    pub content_session_id: String,
    /// Distinct id for the memory agent's own provider-side session.
    /// Never equal to `content_session_id`.
    pub memory_session_id: Option<String>,
    pub project: String,
    pub user_prompt: Option<String>,
    pub custom_title: Option<String>,
    pub started_at_epoch: i64,
    pub completed_at_epoch: Option<i64>,
    pub status: SessionStatus,
    pub worker_port: Option<u16>,
    pub prompt_counter: i64,
}

/// A structured record extracted from a single tool invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ObservationRow {
    pub id: i64,
    pub memory_session_id: String,
    pub project: String,
    #[serde(rename = "type")]
    pub observation_type: String,
    pub title: String,
    pub subtitle: Option<String>,
    pub facts: Vec<String>,
    pub narrative: Option<String>,
    pub concepts: Vec<String>,
    pub files_read: Vec<String>,
    pub files_modified: Vec<String>,
    pub prompt_number: Option<i64>,
    pub discovery_tokens: i64,
    pub content_hash: String,
    pub created_at_epoch: i64,
}

/// New observation payload, before ids and hashes are assigned.
#[derive(Debug, Clone, Default)]
pub struct NewObservation {
    pub observation_type: String,
    pub title: String,
    pub subtitle: Option<String>,
    pub facts: Vec<String>,
    pub narrative: Option<String>,
    pub concepts: Vec<String>,
    pub files_read: Vec<String>,
    pub files_modified: Vec<String>,
}

/// End-of-turn summary of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryRow {
    pub id: i64,
    pub memory_session_id: String,
    pub project: String,
    pub request: Option<String>,
    pub investigated: Option<String>,
    pub learned: Option<String>,
    pub completed: Option<String>,
    pub next_steps: Option<String>,
    pub files_read: Vec<String>,
    pub files_edited: Vec<String>,
    pub notes: Option<String>,
    pub prompt_number: Option<i64>,
    pub discovery_tokens: i64,
    pub created_at_epoch: i64,
}

/// New summary payload.
#[derive(Debug, Clone, Default)]
pub struct NewSummary {
    pub request: Option<String>,
    pub investigated: Option<String>,
    pub learned: Option<String>,
    pub completed: Option<String>,
    pub next_steps: Option<String>,
    pub files_read: Vec<String>,
    pub files_edited: Vec<String>,
    pub notes: Option<String>,
}

/// A prompt the user typed, numbered within its session.
#[derive(Debug, Clone, Serialize)]
pub struct UserPromptRow {
    pub id: i64,
    pub content_session_id: String,
    pub prompt_number: i64,
    pub prompt_text: String,
    pub created_at_epoch: i64,
}

/// Work item kind carried on the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Observation,
    Summarize,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Observation => "observation",
            Self::Summarize => "summarize",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "observation" => Some(Self::Observation),
            "summarize" => Some(Self::Summarize),
            _ => None,
        }
    }
}

/// Queue row state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "processed" => Some(Self::Processed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A durable work item. Payload fields are nulled once processed.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub id: i64,
    pub session_db_id: i64,
    pub content_session_id: String,
    pub message_type: MessageType,
    pub tool_name: Option<String>,
    /// JSON string as received from the hook.
    pub tool_input: Option<String>,
    /// JSON string as received from the hook.
    pub tool_response: Option<String>,
    pub cwd: Option<String>,
    pub last_assistant_message: Option<String>,
    pub prompt_number: Option<i64>,
    pub status: MessageStatus,
    pub retry_count: i64,
    pub created_at_epoch: i64,
    pub started_processing_at_epoch: Option<i64>,
    pub completed_at_epoch: Option<i64>,
    pub failed_at_epoch: Option<i64>,
}

/// New queue item payload from a hook event.
#[derive(Debug, Clone)]
pub struct NewPendingMessage {
    pub session_db_id: i64,
    pub content_session_id: String,
    pub message_type: MessageType,
    pub tool_name: Option<String>,
    pub tool_input: Option<String>,
    pub tool_response: Option<String>,
    pub cwd: Option<String>,
    pub last_assistant_message: Option<String>,
    pub prompt_number: Option<i64>,
}

/// Serialize a string list to its JSON column representation.
pub(crate) fn list_to_json(list: &[String]) -> String {
    serde_json::to_string(list).unwrap_or_else(|_| "[]".to_string())
}

/// Parse a JSON-array column, tolerating NULL and malformed text.
pub(crate) fn list_from_json(raw: Option<String>) -> Vec<String> {
    raw.as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default()
}
