//! Editor transcript parsing
//!
//! The editor maintains a JSONL transcript per session under its projects
//! directory. The "Previously" block wants the last assistant message from
//! the most recent prior session. Parsing is best-effort: scan from the
//! end, skip malformed lines, strip system-reminder markers, and return
//! the first non-empty assistant text found.

use crate::util::project_slug;
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Transcript path for a session: `<root>/<project-slug>/<session-id>.jsonl`.
pub fn transcript_path(root: &Path, project: &str, content_session_id: &str) -> PathBuf {
    root.join(project_slug(project))
        .join(format!("{content_session_id}.jsonl"))
}

/// Last assistant text in the transcript, or `None` when the file is
/// missing or holds no usable assistant line.
pub fn last_assistant_message(path: &Path) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    for line in contents.lines().rev() {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if value["type"].as_str() != Some("assistant") {
            continue;
        }
        let Some(blocks) = value["message"]["content"].as_array() else {
            continue;
        };
        let text: String = blocks
            .iter()
            .filter(|b| b["type"].as_str() == Some("text"))
            .filter_map(|b| b["text"].as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let cleaned = strip_system_reminders(&text);
        if !cleaned.trim().is_empty() {
            return Some(cleaned.trim().to_string());
        }
    }
    None
}

/// Remove vendor system-reminder spans from assistant text.
fn strip_system_reminders(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<system-reminder>") {
        out.push_str(&rest[..start]);
        match rest[start..].find("</system-reminder>") {
            Some(end) => rest = &rest[start + end + "</system-reminder>".len()..],
            None => return out, // unterminated marker: drop the tail
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn finds_last_assistant_text_from_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, r#"{{"type":"user","message":{{"content":"hi"}}}}"#).unwrap();
        writeln!(
            f,
            r#"{{"type":"assistant","message":{{"content":[{{"type":"text","text":"first"}}]}}}}"#
        )
        .unwrap();
        writeln!(f, "not json at all").unwrap();
        writeln!(
            f,
            r#"{{"type":"assistant","message":{{"content":[{{"type":"text","text":"second"}}]}}}}"#
        )
        .unwrap();

        assert_eq!(last_assistant_message(&path).as_deref(), Some("second"));
    }

    #[test]
    fn skips_empty_and_reminder_only_messages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"{{"type":"assistant","message":{{"content":[{{"type":"text","text":"real answer"}}]}}}}"#
        )
        .unwrap();
        writeln!(
            f,
            r#"{{"type":"assistant","message":{{"content":[{{"type":"text","text":"<system-reminder>noise</system-reminder>"}}]}}}}"#
        )
        .unwrap();

        assert_eq!(last_assistant_message(&path).as_deref(), Some("real answer"));
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(last_assistant_message(&dir.path().join("nope.jsonl")).is_none());
    }

    #[test]
    fn reminder_stripping() {
        assert_eq!(
            strip_system_reminders("a <system-reminder>x</system-reminder>b"),
            "a b"
        );
        assert_eq!(strip_system_reminders("plain"), "plain");
        assert_eq!(strip_system_reminders("head <system-reminder>unterminated"), "head ");
    }

    #[test]
    fn path_uses_project_slug() {
        let path = transcript_path(Path::new("/root/.claude/projects"), "My Repo", "c1");
        assert_eq!(
            path,
            Path::new("/root/.claude/projects/my-repo/c1.jsonl")
        );
    }
}
