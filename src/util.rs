//! Shared utility functions

use chrono::Utc;

/// Current wall-clock time as milliseconds since the Unix epoch.
///
/// All persisted timestamps in the store use this representation.
pub fn now_epoch_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Safely truncate a string to at most `max_bytes` while respecting UTF-8 boundaries.
///
/// If the string is already shorter than `max_bytes`, returns it unchanged.
/// Otherwise, finds the last valid UTF-8 character boundary at or before `max_bytes`
/// and returns a slice up to that point.
pub fn truncate_utf8_safe(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Display heuristic: estimated tokens to read a chunk of text (~4 bytes/token).
pub fn estimate_read_tokens(text: &str) -> u64 {
    text.len().div_ceil(4) as u64
}

/// Slug a project path or name for use in file names and collection names.
///
/// Mirrors the editor-side convention: every non-alphanumeric run becomes a
/// single dash.
pub fn project_slug(project: &str) -> String {
    let mut slug = String::with_capacity(project.len());
    let mut last_dash = false;
    for c in project.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    slug.trim_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_shorter_than_max() {
        assert_eq!(truncate_utf8_safe("hello", 10), "hello");
    }

    #[test]
    fn test_truncate_at_ascii_boundary() {
        assert_eq!(truncate_utf8_safe("hello world", 5), "hello");
    }

    #[test]
    fn test_truncate_at_utf8_boundary() {
        // 3-byte UTF-8 character: "日" = 0xE6 0x97 0xA5
        let s = "日本語";
        assert_eq!(truncate_utf8_safe(s, 4), "日");
        assert_eq!(truncate_utf8_safe(s, 6), "日本");
    }

    #[test]
    fn test_read_token_estimate_rounds_up() {
        assert_eq!(estimate_read_tokens(""), 0);
        assert_eq!(estimate_read_tokens("abcd"), 1);
        assert_eq!(estimate_read_tokens("abcde"), 2);
    }

    #[test]
    fn test_project_slug() {
        assert_eq!(project_slug("My Project/v2"), "my-project-v2");
        assert_eq!(project_slug("demo"), "demo");
        assert_eq!(project_slug("/home/me/repo"), "home-me-repo");
    }
}
