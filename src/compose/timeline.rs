//! Timeline assembly for the context document
//!
//! Observations and session summaries interleave into one timeline ordered
//! by commit time, grouped by calendar day and, within a day, by a derived
//! "folder" (where the work happened).

use crate::store::{ObservationRow, SummaryRow};
use crate::util::estimate_read_tokens;
use chrono::{DateTime, Utc};
use std::path::Path;

/// One timeline entry.
#[derive(Debug, Clone)]
pub enum TimelineItem {
    Observation(ObservationRow),
    Summary(SummaryRow),
}

impl TimelineItem {
    pub fn created_at_epoch(&self) -> i64 {
        match self {
            Self::Observation(o) => o.created_at_epoch,
            Self::Summary(s) => s.created_at_epoch,
        }
    }

    /// Day key `YYYY-MM-DD` for grouping.
    pub fn day(&self) -> String {
        format_day(self.created_at_epoch())
    }

    /// Grouping folder: the parent directory of the first touched file.
    /// Modified files win over read files; no files means "General".
    pub fn folder(&self) -> String {
        let file = match self {
            Self::Observation(o) => o
                .files_modified
                .first()
                .or_else(|| o.files_read.first())
                .cloned(),
            Self::Summary(s) => s
                .files_edited
                .first()
                .or_else(|| s.files_read.first())
                .cloned(),
        };
        match file {
            Some(file) => folder_of(&file),
            None => "General".to_string(),
        }
    }

    /// Display heuristic: tokens to read this record.
    pub fn read_tokens(&self) -> u64 {
        match self {
            Self::Observation(o) => observation_read_tokens(o),
            Self::Summary(s) => {
                let text = [
                    s.request.as_deref().unwrap_or(""),
                    s.investigated.as_deref().unwrap_or(""),
                    s.learned.as_deref().unwrap_or(""),
                    s.completed.as_deref().unwrap_or(""),
                    s.next_steps.as_deref().unwrap_or(""),
                ]
                .concat();
                estimate_read_tokens(&text)
            }
        }
    }

    pub fn discovery_tokens(&self) -> i64 {
        match self {
            Self::Observation(o) => o.discovery_tokens,
            Self::Summary(s) => s.discovery_tokens,
        }
    }
}

/// `read_tokens` of an observation: title + subtitle + narrative + facts.
pub fn observation_read_tokens(o: &ObservationRow) -> u64 {
    let mut text = String::new();
    text.push_str(&o.title);
    if let Some(subtitle) = &o.subtitle {
        text.push_str(subtitle);
    }
    if let Some(narrative) = &o.narrative {
        text.push_str(narrative);
    }
    if !o.facts.is_empty() {
        text.push_str(&serde_json::to_string(&o.facts).unwrap_or_default());
    }
    estimate_read_tokens(&text)
}

/// Interleave both record kinds, ascending by commit time.
pub fn zip_timeline(
    observations: Vec<ObservationRow>,
    summaries: Vec<SummaryRow>,
) -> Vec<TimelineItem> {
    let mut items: Vec<TimelineItem> = observations
        .into_iter()
        .map(TimelineItem::Observation)
        .chain(summaries.into_iter().map(TimelineItem::Summary))
        .collect();
    items.sort_by_key(|item| item.created_at_epoch());
    items
}

pub fn format_day(epoch_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(epoch_ms)
        .unwrap_or_else(|| DateTime::<Utc>::from_timestamp_millis(0).unwrap())
        .format("%Y-%m-%d")
        .to_string()
}

pub fn format_time(epoch_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(epoch_ms)
        .unwrap_or_else(|| DateTime::<Utc>::from_timestamp_millis(0).unwrap())
        .format("%H:%M")
        .to_string()
}

fn folder_of(file: &str) -> String {
    match Path::new(file).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_string_lossy().into_owned(),
        _ => "General".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(created: i64, modified: &[&str], read: &[&str]) -> ObservationRow {
        ObservationRow {
            id: 1,
            memory_session_id: "m1".into(),
            project: "demo".into(),
            observation_type: "discovery".into(),
            title: "title".into(),
            subtitle: None,
            facts: vec![],
            narrative: Some("narrative".into()),
            concepts: vec![],
            files_read: read.iter().map(|s| s.to_string()).collect(),
            files_modified: modified.iter().map(|s| s.to_string()).collect(),
            prompt_number: None,
            discovery_tokens: 100,
            content_hash: String::new(),
            created_at_epoch: created,
        }
    }

    fn summary(created: i64) -> SummaryRow {
        SummaryRow {
            id: 1,
            memory_session_id: "m1".into(),
            project: "demo".into(),
            request: Some("r".into()),
            investigated: None,
            learned: None,
            completed: None,
            next_steps: None,
            files_read: vec![],
            files_edited: vec![],
            notes: None,
            prompt_number: None,
            discovery_tokens: 50,
            created_at_epoch: created,
        }
    }

    #[test]
    fn zip_orders_ascending_across_kinds() {
        let items = zip_timeline(
            vec![obs(300, &[], &[]), obs(100, &[], &[])],
            vec![summary(200)],
        );
        let times: Vec<i64> = items.iter().map(|i| i.created_at_epoch()).collect();
        assert_eq!(times, vec![100, 200, 300]);
    }

    #[test]
    fn folder_prefers_modified_over_read() {
        let item = TimelineItem::Observation(obs(0, &["src/store/mod.rs"], &["docs/a.md"]));
        assert_eq!(item.folder(), "src/store");

        let item = TimelineItem::Observation(obs(0, &[], &["docs/a.md"]));
        assert_eq!(item.folder(), "docs");

        let item = TimelineItem::Observation(obs(0, &[], &[]));
        assert_eq!(item.folder(), "General");

        let item = TimelineItem::Observation(obs(0, &["README.md"], &[]));
        assert_eq!(item.folder(), "General");
    }

    #[test]
    fn read_tokens_cover_all_text_fields() {
        let mut o = obs(0, &[], &[]);
        o.title = "abcd".into(); // 1 token
        o.narrative = Some("efgh".into()); // 1 token
        assert_eq!(observation_read_tokens(&o), 2);
    }

    #[test]
    fn day_formatting() {
        // 2026-08-01T00:00:00Z
        assert_eq!(format_day(1_785_542_400_000), "2026-08-01");
    }
}
