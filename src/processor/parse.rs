//! Provider reply parsing
//!
//! Replies carry zero or more `<observation>` blocks and at most one
//! `<summary>` block in an XML-shaped dialect, usually wrapped in prose.
//! Parsing is tolerant by contract: unknown tags are dropped, malformed
//! blocks are skipped, and only a reply with no recognizable structure at
//! all is a parse failure.

use regex::Regex;
use std::sync::OnceLock;

/// An observation block as extracted from the reply, pre-validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedObservation {
    pub observation_type: String,
    pub title: String,
    pub subtitle: Option<String>,
    pub narrative: Option<String>,
    pub facts: Vec<String>,
    pub concepts: Vec<String>,
    pub files_read: Vec<String>,
    pub files_modified: Vec<String>,
}

/// A summary block as extracted from the reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedSummary {
    pub request: Option<String>,
    pub investigated: Option<String>,
    pub learned: Option<String>,
    pub completed: Option<String>,
    pub next_steps: Option<String>,
    pub files_read: Vec<String>,
    pub files_edited: Vec<String>,
    pub notes: Option<String>,
}

/// Everything extracted from one reply.
#[derive(Debug, Clone, Default)]
pub struct ParsedReply {
    pub observations: Vec<ParsedObservation>,
    pub summary: Option<ParsedSummary>,
}

/// Parse a raw reply. Errors only when the text contains observation or
/// summary markers that cannot be extracted, or no markers and no
/// recognizable structure at all is present while some was expected - the
/// caller decides whether an empty parse is acceptable.
pub fn parse_reply(text: &str) -> ParsedReply {
    let mut reply = ParsedReply::default();

    for block in block_regex("observation").captures_iter(text) {
        let body = &block[1];
        let title = tag_content(body, "title").unwrap_or_default();
        if title.trim().is_empty() {
            // An observation without a title is unusable; skip it.
            continue;
        }
        reply.observations.push(ParsedObservation {
            observation_type: tag_content(body, "type").unwrap_or_default(),
            title,
            subtitle: tag_content(body, "subtitle"),
            narrative: tag_content(body, "narrative"),
            facts: tag_list(body, "fact"),
            concepts: tag_list(body, "concept"),
            files_read: file_list(body, "files_read"),
            files_modified: file_list(body, "files_modified"),
        });
    }

    if let Some(block) = block_regex("summary").captures_iter(text).next() {
        let body = &block[1];
        reply.summary = Some(ParsedSummary {
            request: tag_content(body, "request"),
            investigated: tag_content(body, "investigated"),
            learned: tag_content(body, "learned"),
            completed: tag_content(body, "completed"),
            next_steps: tag_content(body, "next_steps"),
            files_read: file_list(body, "files_read"),
            files_edited: file_list(body, "files_edited"),
            notes: tag_content(body, "notes"),
        });
    }

    reply
}

/// True when the text carries block markers at all. A reply with markers
/// that parsed to nothing is treated as a parse failure by the processor.
pub fn has_markers(text: &str) -> bool {
    text.contains("<observation") || text.contains("<summary")
}

fn block_regex(tag: &'static str) -> &'static Regex {
    static OBSERVATION: OnceLock<Regex> = OnceLock::new();
    static SUMMARY: OnceLock<Regex> = OnceLock::new();
    let cell = match tag {
        "observation" => &OBSERVATION,
        _ => &SUMMARY,
    };
    cell.get_or_init(|| {
        Regex::new(&format!(r"(?s)<{tag}>(.*?)</{tag}>")).expect("block regex")
    })
}

/// Content of the first `<tag>...</tag>` inside a block, trimmed.
/// Returns `None` for a missing tag or empty content.
fn tag_content(body: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    let content = body[start..end].trim();
    if content.is_empty() {
        None
    } else {
        Some(content.to_string())
    }
}

/// All `<tag>...</tag>` occurrences inside a block, trimmed and non-empty.
fn tag_list(body: &str, tag: &str) -> Vec<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut out = Vec::new();
    let mut rest = body;
    while let Some(start) = rest.find(&open) {
        let content_start = start + open.len();
        let Some(end) = rest[content_start..].find(&close) else {
            break;
        };
        let content = rest[content_start..content_start + end].trim();
        if !content.is_empty() {
            out.push(content.to_string());
        }
        rest = &rest[content_start + end + close.len()..];
    }
    out
}

/// File lists appear either as `<files_read><file>a</file></files_read>`
/// or as a flat comma-separated `<files_read>a, b</files_read>`.
fn file_list(body: &str, container: &str) -> Vec<String> {
    let Some(inner) = tag_content(body, container) else {
        return Vec::new();
    };
    let files = tag_list(&inner, "file");
    if !files.is_empty() {
        return files;
    }
    inner
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
