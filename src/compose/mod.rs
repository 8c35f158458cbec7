//! Context composer
//!
//! Produces the Markdown "recent context" document an assistant ingests at
//! session start: a budgeted timeline of recent observations and session
//! summaries, grouped by day and folder, with the leading items in full
//! detail and the rest as compact rows.

mod timeline;
pub mod transcript;

pub use timeline::{observation_read_tokens, zip_timeline, TimelineItem};

use crate::config::{DetailField, DisplaySettings};
use crate::modes::Mode;
use crate::store::Store;
use chrono::Utc;
use std::path::PathBuf;

/// ANSI codes used by the `colors=true` rendering.
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";

/// Inputs for one composition.
pub struct ComposeOptions {
    /// Projects to include (worktrees pass several).
    pub projects: Vec<String>,
    pub display: DisplaySettings,
    /// Terminal color codes, display only; the plain form is byte-stable.
    pub colors: bool,
}

pub struct Composer {
    store: Store,
    /// Root of the editor's transcript tree (`~/.claude/projects`).
    transcripts_root: PathBuf,
}

impl Composer {
    pub fn new(store: Store, transcripts_root: PathBuf) -> Self {
        Self { store, transcripts_root }
    }

    pub fn default_transcripts_root() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".claude")
            .join("projects")
    }

    /// Compose the recent-context document.
    pub fn compose(&self, mode: &Mode, opts: &ComposeOptions) -> anyhow::Result<String> {
        let display = &opts.display;
        let type_filter = mode.type_ids();
        let concept_filter = mode.concept_ids();

        let observations = self.store.recent_observations(
            &opts.projects,
            Some(&type_filter),
            Some(&concept_filter),
            display.total_observations,
        )?;
        // One extra summary enables the one-past lookback.
        let summaries = self
            .store
            .recent_summaries(&opts.projects, display.session_count + 1)?;

        let mut doc = String::new();
        let header_label = opts.projects.join(", ");
        let timestamp = Utc::now().format("%Y-%m-%d %H:%M UTC");
        self.push_heading(
            &mut doc,
            opts,
            &format!("# [{header_label}] recent context, {timestamp}"),
        );
        doc.push('\n');

        if observations.is_empty() && summaries.is_empty() {
            doc.push_str("No context yet. Observations will accumulate as the session runs.\n");
            return Ok(doc);
        }

        if display.show_legend {
            self.push_legend(&mut doc, mode, opts);
        }
        if display.show_column_key {
            self.push_line(
                &mut doc,
                opts,
                "Columns: id | time | type | title | read-tokens | work-tokens",
                true,
            );
            doc.push('\n');
        }

        let items = zip_timeline(observations, summaries);
        if display.show_context_index {
            self.push_context_index(&mut doc, &items, opts);
        }

        let mut total_read_tokens: u64 = 0;
        let mut total_discovery_tokens: i64 = 0;
        let mut rendered = 0usize;
        let mut current_day = String::new();
        let mut current_folder = String::new();

        for item in &items {
            total_read_tokens += item.read_tokens();
            total_discovery_tokens += item.discovery_tokens();

            let day = item.day();
            if day != current_day {
                current_day = day.clone();
                current_folder.clear();
                self.push_heading(&mut doc, opts, &format!("## {day}"));
            }
            let folder = item.folder();
            if folder != current_folder {
                current_folder = folder.clone();
                self.push_heading(&mut doc, opts, &format!("### {folder}"));
            }

            if rendered < display.full_observation_count {
                self.render_full(&mut doc, item, display, mode);
            } else {
                self.render_compact(&mut doc, item, opts, mode);
            }
            rendered += 1;
        }

        if display.show_economics && total_discovery_tokens > 0 {
            let savings = total_discovery_tokens - total_read_tokens as i64;
            let savings_percent = (savings as f64 / total_discovery_tokens as f64) * 100.0;
            doc.push('\n');
            self.push_line(
                &mut doc,
                opts,
                &format!(
                    "Economics: {} discovery tokens distilled to {} read tokens (saved {} tokens, {:.0}%)",
                    total_discovery_tokens, total_read_tokens, savings, savings_percent
                ),
                true,
            );
        }

        if display.show_previously {
            if let Some(previously) = self.previously_block(&opts.projects) {
                doc.push('\n');
                self.push_heading(&mut doc, opts, "## Previously");
                doc.push_str(&previously);
                doc.push('\n');
            }
        }

        Ok(doc)
    }

    fn push_heading(&self, doc: &mut String, opts: &ComposeOptions, text: &str) {
        if opts.colors {
            doc.push_str(BOLD);
            doc.push_str(text);
            doc.push_str(RESET);
        } else {
            doc.push_str(text);
        }
        doc.push('\n');
    }

    fn push_line(&self, doc: &mut String, opts: &ComposeOptions, text: &str, dim: bool) {
        if opts.colors && dim {
            doc.push_str(DIM);
            doc.push_str(text);
            doc.push_str(RESET);
        } else {
            doc.push_str(text);
        }
        doc.push('\n');
    }

    fn push_legend(&self, doc: &mut String, mode: &Mode, opts: &ComposeOptions) {
        let legend: Vec<String> = mode
            .observation_types
            .iter()
            .map(|t| format!("{} {}", t.emoji, t.label))
            .collect();
        self.push_line(&mut *doc, opts, &format!("Legend: {}", legend.join("  ")), true);
        doc.push('\n');
    }

    fn push_context_index(&self, doc: &mut String, items: &[TimelineItem], opts: &ComposeOptions) {
        let observation_count = items
            .iter()
            .filter(|i| matches!(i, TimelineItem::Observation(_)))
            .count();
        let summary_count = items.len() - observation_count;
        self.push_line(
            &mut *doc,
            opts,
            &format!(
                "Context index: {} observations, {} session summaries",
                observation_count, summary_count
            ),
            true,
        );
        doc.push('\n');
    }

    fn render_full(&self, doc: &mut String, item: &TimelineItem, display: &DisplaySettings, mode: &Mode) {
        match item {
            TimelineItem::Observation(o) => {
                let emoji = mode
                    .type_display(&o.observation_type)
                    .map(|t| t.emoji.as_str())
                    .unwrap_or("");
                doc.push_str(&format!(
                    "- {} **{}**",
                    emoji,
                    o.title
                ));
                if let Some(subtitle) = &o.subtitle {
                    doc.push_str(&format!(" - {subtitle}"));
                }
                doc.push('\n');
                match display.full_detail_field {
                    DetailField::Narrative => {
                        if let Some(narrative) = &o.narrative {
                            doc.push_str(&format!("  {narrative}\n"));
                        } else {
                            for fact in &o.facts {
                                doc.push_str(&format!("  - {fact}\n"));
                            }
                        }
                    }
                    DetailField::Facts => {
                        for fact in &o.facts {
                            doc.push_str(&format!("  - {fact}\n"));
                        }
                        if o.facts.is_empty() {
                            if let Some(narrative) = &o.narrative {
                                doc.push_str(&format!("  {narrative}\n"));
                            }
                        }
                    }
                }
            }
            TimelineItem::Summary(s) => {
                doc.push_str("- 📋 **Session summary**\n");
                for (label, field) in [
                    ("Request", &s.request),
                    ("Investigated", &s.investigated),
                    ("Learned", &s.learned),
                    ("Completed", &s.completed),
                    ("Next steps", &s.next_steps),
                ] {
                    if let Some(text) = field {
                        doc.push_str(&format!("  {label}: {text}\n"));
                    }
                }
            }
        }
    }

    fn render_compact(
        &self,
        doc: &mut String,
        item: &TimelineItem,
        opts: &ComposeOptions,
        mode: &Mode,
    ) {
        let line = match item {
            TimelineItem::Observation(o) => {
                let emoji = mode
                    .type_display(&o.observation_type)
                    .map(|t| t.work_emoji.as_str())
                    .unwrap_or("");
                format!(
                    "{} | {} | {} {} | {} | {} | {}",
                    o.id,
                    timeline::format_time(o.created_at_epoch),
                    emoji,
                    o.observation_type,
                    o.title,
                    item.read_tokens(),
                    o.discovery_tokens
                )
            }
            TimelineItem::Summary(s) => format!(
                "{} | {} | summary | {} | {} | {}",
                s.id,
                timeline::format_time(s.created_at_epoch),
                s.request.as_deref().unwrap_or("session summary"),
                item.read_tokens(),
                s.discovery_tokens
            ),
        };
        self.push_line(doc, opts, &line, true);
    }

    /// The last assistant message of the most recent prior session, parsed
    /// from the editor transcript. Best-effort: any miss omits the block.
    fn previously_block(&self, projects: &[String]) -> Option<String> {
        for project in projects {
            let sessions = self.store.recent_sessions(project, 5).ok()?;
            // The newest session is typically the one being started right
            // now; "prior" means anything before it with a transcript.
            for session in sessions.iter().skip(1) {
                let path = transcript::transcript_path(
                    &self.transcripts_root,
                    project,
                    &session.content_session_id,
                );
                if let Some(text) = transcript::last_assistant_message(&path) {
                    return Some(text);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewObservation, NewSummary};

    fn seeded() -> (tempfile::TempDir, Store, Composer) {
        let (dir, store) = Store::open_temp();
        let sid = store.create_session("c1", "demo", None, None, None).unwrap();
        store.register_memory_session_id(sid, "m1").unwrap();
        let composer = Composer::new(store.clone(), dir.path().join("projects"));
        (dir, store, composer)
    }

    fn obs(title: &str) -> NewObservation {
        NewObservation {
            observation_type: "discovery".into(),
            title: title.into(),
            narrative: Some(format!("narrative for {title}")),
            ..Default::default()
        }
    }

    fn options() -> ComposeOptions {
        ComposeOptions {
            projects: vec!["demo".into()],
            display: DisplaySettings {
                total_observations: 50,
                full_observation_count: 1,
                ..Default::default()
            },
            colors: false,
        }
    }

    #[test]
    fn empty_project_renders_no_context_block() {
        let (_dir, _store, composer) = seeded();
        let doc = composer.compose(&Mode::builtin(), &options()).unwrap();
        assert!(doc.starts_with("# [demo] recent context, "));
        assert!(doc.contains("No context yet"));
    }

    #[test]
    fn four_observations_one_summary_one_full_detail() {
        let (_dir, store, composer) = seeded();
        for (i, title) in ["a", "b", "c", "d"].iter().enumerate() {
            store
                .store_observations(
                    "m1",
                    "demo",
                    &[obs(title)],
                    None,
                    None,
                    1000,
                    Some(1_000 * (i as i64 + 1)),
                    None,
                )
                .unwrap();
        }
        store
            .store_observations(
                "m1",
                "demo",
                &[],
                Some(&NewSummary {
                    request: Some("wrap up".into()),
                    ..Default::default()
                }),
                None,
                500,
                Some(10_000),
                None,
            )
            .unwrap();

        let doc = composer.compose(&Mode::builtin(), &options()).unwrap();
        assert!(doc.starts_with("# [demo] recent context, "));

        // Ascending order: "a" first, and exactly one full-detail render
        // (full detail emits the narrative line).
        let pos_a = doc.find("**a**").expect("first observation in full detail");
        let pos_d = doc.find(" d |").or_else(|| doc.find("| d |")).expect("later observation compact");
        assert!(pos_a < pos_d);
        assert_eq!(doc.matches("narrative for").count(), 1);

        // Summary present, economics computed, no Previously block.
        assert!(doc.contains("wrap up"));
        assert!(doc.contains("Economics:"));
        assert!(!doc.contains("## Previously"));
    }

    #[test]
    fn colored_variant_wraps_headings() {
        let (_dir, store, composer) = seeded();
        store
            .store_observation_single("m1", "demo", &obs("x"), None, 10)
            .unwrap();
        let mut opts = options();
        opts.colors = true;
        let doc = composer.compose(&Mode::builtin(), &opts).unwrap();
        assert!(doc.contains("\x1b[1m"));

        opts.colors = false;
        let plain = composer.compose(&Mode::builtin(), &opts).unwrap();
        assert!(!plain.contains("\x1b["));
    }

    #[test]
    fn previously_block_reads_prior_session_transcript() {
        let (dir, store, composer) = seeded();
        store
            .store_observation_single("m1", "demo", &obs("x"), None, 10)
            .unwrap();

        // A prior session with a transcript on disk, then a newer one.
        store.create_session("c0", "demo", None, None, None).unwrap();
        let conn = store.conn().unwrap();
        conn.execute(
            "UPDATE sdk_sessions SET started_at_epoch=1 WHERE content_session_id='c0'",
            [],
        )
        .unwrap();

        let transcript_dir = dir.path().join("projects").join("demo");
        std::fs::create_dir_all(&transcript_dir).unwrap();
        std::fs::write(
            transcript_dir.join("c0.jsonl"),
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"left off here"}]}}"#,
        )
        .unwrap();

        let doc = composer.compose(&Mode::builtin(), &options()).unwrap();
        assert!(doc.contains("## Previously"));
        assert!(doc.contains("left off here"));
    }
}
