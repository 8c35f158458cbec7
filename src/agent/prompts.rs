//! Prompt assembly for the agent loop
//!
//! Fills the active mode's templates. Tool payloads are bounded before they
//! reach the prompt; a hook can hand us megabytes of tool output and the
//! provider only needs the shape of it.

use crate::modes::Mode;
use crate::store::{MessageType, PendingMessage};
use crate::util::truncate_utf8_safe;

/// Upper bound on any single payload substituted into a prompt.
const PAYLOAD_LIMIT: usize = 8_000;

/// The session-opening prompt, first turn only.
pub fn initial_prompt(mode: &Mode, project: &str, user_prompt: Option<&str>) -> String {
    let mut prompt = fill(&mode.prompts.init, &[("project", project)]);
    if let Some(user_prompt) = user_prompt {
        prompt.push_str("\n\nThe user opened the session with:\n");
        prompt.push_str(truncate_utf8_safe(user_prompt, PAYLOAD_LIMIT));
    }
    prompt
}

/// The per-message prompt, observation or summary shaped.
pub fn message_prompt(mode: &Mode, message: &PendingMessage) -> String {
    match message.message_type {
        MessageType::Observation => fill(
            &mode.prompts.observation,
            &[
                ("tool_name", message.tool_name.as_deref().unwrap_or("unknown")),
                ("tool_input", bounded(message.tool_input.as_deref())),
                ("tool_response", bounded(message.tool_response.as_deref())),
                ("cwd", message.cwd.as_deref().unwrap_or("")),
            ],
        ),
        MessageType::Summarize => fill(
            &mode.prompts.summary,
            &[(
                "last_assistant_message",
                bounded(message.last_assistant_message.as_deref()),
            )],
        ),
    }
}

fn bounded(payload: Option<&str>) -> &str {
    truncate_utf8_safe(payload.unwrap_or("{}"), PAYLOAD_LIMIT)
}

fn fill(template: &str, pairs: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in pairs {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MessageStatus;

    fn message(message_type: MessageType) -> PendingMessage {
        PendingMessage {
            id: 1,
            session_db_id: 1,
            content_session_id: "c1".into(),
            message_type,
            tool_name: Some("Read".into()),
            tool_input: Some(r#"{"file":"a.ts"}"#.into()),
            tool_response: Some(r#"{"ok":true}"#.into()),
            cwd: Some("/repo".into()),
            last_assistant_message: Some("done".into()),
            prompt_number: Some(1),
            status: MessageStatus::Processing,
            retry_count: 1,
            created_at_epoch: 0,
            started_processing_at_epoch: None,
            completed_at_epoch: None,
            failed_at_epoch: None,
        }
    }

    #[test]
    fn observation_prompt_substitutes_tool_fields() {
        let prompt = message_prompt(&Mode::builtin(), &message(MessageType::Observation));
        assert!(prompt.contains("Read"));
        assert!(prompt.contains(r#"{"file":"a.ts"}"#));
        assert!(!prompt.contains("{tool_name}"));
    }

    #[test]
    fn summary_prompt_substitutes_last_message() {
        let prompt = message_prompt(&Mode::builtin(), &message(MessageType::Summarize));
        assert!(prompt.contains("done"));
        assert!(!prompt.contains("{last_assistant_message}"));
    }

    #[test]
    fn initial_prompt_names_project_and_user_ask() {
        let prompt = initial_prompt(&Mode::builtin(), "demo", Some("please fix the tests"));
        assert!(prompt.contains("demo"));
        assert!(prompt.contains("please fix the tests"));
    }

    #[test]
    fn oversized_payload_is_bounded() {
        let mut m = message(MessageType::Observation);
        m.tool_response = Some("x".repeat(100_000));
        let prompt = message_prompt(&Mode::builtin(), &m);
        assert!(prompt.len() < 30_000);
    }
}
