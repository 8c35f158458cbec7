//! Observation, summary and read-path operations
//!
//! `store_observations` is the single write path for distilled memory: all
//! observations of a message, the optional summary, and the queue
//! confirmation commit in one transaction. A crash at any point leaves
//! either nothing (message re-claimed later) or everything.

use super::types::{
    list_from_json, list_to_json, NewObservation, NewSummary, ObservationRow, SummaryRow,
    UserPromptRow,
};
use super::Store;
use crate::util::now_epoch_ms;
use rusqlite::{params, Connection, OptionalExtension, Row};
use sha2::{Digest, Sha256};

/// Two observations with the same content hash within this window collapse
/// into one row.
const DEDUP_WINDOW_MS: i64 = 30_000;

/// Result of a batch store.
#[derive(Debug, Clone)]
pub struct StoredBatch {
    pub observation_ids: Vec<i64>,
    pub summary_id: Option<i64>,
    pub created_at_epoch: i64,
    /// Ids that hit the dedup window instead of inserting a fresh row.
    pub deduplicated: Vec<i64>,
}

/// 16 hex chars of SHA-256 over the session-scoped content identity.
pub fn content_hash(memory_session_id: &str, title: &str, narrative: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(memory_session_id.as_bytes());
    hasher.update(title.as_bytes());
    hasher.update(narrative.as_bytes());
    let digest = hasher.finalize();
    digest.iter().take(8).map(|b| format!("{:02x}", b)).collect()
}

fn observation_from_row(row: &Row<'_>) -> rusqlite::Result<ObservationRow> {
    Ok(ObservationRow {
        id: row.get("id")?,
        memory_session_id: row.get("memory_session_id")?,
        project: row.get("project")?,
        observation_type: row.get("type")?,
        title: row.get("title")?,
        subtitle: row.get("subtitle")?,
        facts: list_from_json(row.get("facts")?),
        narrative: row.get("narrative")?,
        concepts: list_from_json(row.get("concepts")?),
        files_read: list_from_json(row.get("files_read")?),
        files_modified: list_from_json(row.get("files_modified")?),
        prompt_number: row.get("prompt_number")?,
        discovery_tokens: row.get("discovery_tokens")?,
        content_hash: row.get::<_, Option<String>>("content_hash")?.unwrap_or_default(),
        created_at_epoch: row.get("created_at_epoch")?,
    })
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<SummaryRow> {
    Ok(SummaryRow {
        id: row.get("id")?,
        memory_session_id: row.get("memory_session_id")?,
        project: row.get("project")?,
        request: row.get("request")?,
        investigated: row.get("investigated")?,
        learned: row.get("learned")?,
        completed: row.get("completed")?,
        next_steps: row.get("next_steps")?,
        files_read: list_from_json(row.get("files_read")?),
        files_edited: list_from_json(row.get("files_edited")?),
        notes: row.get("notes")?,
        prompt_number: row.get("prompt_number")?,
        discovery_tokens: row.get("discovery_tokens")?,
        created_at_epoch: row.get("created_at_epoch")?,
    })
}

const OBSERVATION_COLUMNS: &str = "id, memory_session_id, project, type, title, subtitle, facts, \
     narrative, concepts, files_read, files_modified, prompt_number, discovery_tokens, \
     content_hash, created_at_epoch";

const SUMMARY_COLUMNS: &str = "id, memory_session_id, project, request, investigated, learned, \
     completed, next_steps, files_read, files_edited, notes, prompt_number, discovery_tokens, \
     created_at_epoch";

impl Store {
    /// Store a batch of observations plus an optional summary, and confirm
    /// the originating queue entry, atomically.
    ///
    /// When `confirm_message_id` is set, the matching `pending_messages`
    /// row must still be `processing`; otherwise the whole transaction
    /// rolls back (another claimer owns the message now).
    #[allow(clippy::too_many_arguments)]
    pub fn store_observations(
        &self,
        memory_session_id: &str,
        project: &str,
        observations: &[NewObservation],
        summary: Option<&NewSummary>,
        prompt_number: Option<i64>,
        discovery_tokens: i64,
        ts_override: Option<i64>,
        confirm_message_id: Option<i64>,
    ) -> anyhow::Result<StoredBatch> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let now = ts_override.unwrap_or_else(now_epoch_ms);

        // Per-record token attribution: split evenly across stored records.
        let record_count = (observations.len() + usize::from(summary.is_some())).max(1);
        let tokens_each = discovery_tokens / record_count as i64;

        let mut observation_ids = Vec::with_capacity(observations.len());
        let mut deduplicated = Vec::new();
        for obs in observations {
            let (id, was_dup) = insert_observation(
                &tx,
                memory_session_id,
                project,
                obs,
                prompt_number,
                tokens_each,
                now,
                self.fts_available(),
            )?;
            if was_dup {
                deduplicated.push(id);
            }
            observation_ids.push(id);
        }

        let summary_id = match summary {
            Some(s) => Some(insert_summary(
                &tx,
                memory_session_id,
                project,
                s,
                prompt_number,
                tokens_each,
                now,
            )?),
            None => None,
        };

        if let Some(message_id) = confirm_message_id {
            let confirmed = tx.execute(
                "UPDATE pending_messages
                 SET status='processed', completed_at_epoch=?2, tool_input=NULL, tool_response=NULL
                 WHERE id=?1 AND status='processing'",
                params![message_id, now],
            )?;
            if confirmed == 0 {
                anyhow::bail!(
                    "pending message {} is no longer processing; store aborted",
                    message_id
                );
            }
        }

        tx.commit()?;
        Ok(StoredBatch {
            observation_ids,
            summary_id,
            created_at_epoch: now,
            deduplicated,
        })
    }

    /// Single-observation variant. Applies the same dedup and returns the
    /// surviving row id (existing or new).
    pub fn store_observation_single(
        &self,
        memory_session_id: &str,
        project: &str,
        observation: &NewObservation,
        prompt_number: Option<i64>,
        discovery_tokens: i64,
    ) -> anyhow::Result<i64> {
        let batch = self.store_observations(
            memory_session_id,
            project,
            std::slice::from_ref(observation),
            None,
            prompt_number,
            discovery_tokens,
            None,
            None,
        )?;
        Ok(batch.observation_ids[0])
    }

    pub fn get_observation(&self, id: i64) -> anyhow::Result<Option<ObservationRow>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {OBSERVATION_COLUMNS} FROM observations WHERE id=?1");
        Ok(conn.query_row(&sql, [id], observation_from_row).optional()?)
    }

    pub fn get_summary(&self, id: i64) -> anyhow::Result<Option<SummaryRow>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {SUMMARY_COLUMNS} FROM session_summaries WHERE id=?1");
        Ok(conn.query_row(&sql, [id], summary_from_row).optional()?)
    }

    /// Recent observations in the given projects, newest first, optionally
    /// filtered to allowed types and concepts. Concept containment is a
    /// JSON-array membership test.
    pub fn recent_observations(
        &self,
        projects: &[String],
        allowed_types: Option<&[String]>,
        allowed_concepts: Option<&[String]>,
        limit: usize,
    ) -> anyhow::Result<Vec<ObservationRow>> {
        if projects.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let placeholders = vec!["?"; projects.len()].join(",");
        let sql = format!(
            "SELECT {OBSERVATION_COLUMNS} FROM observations
             WHERE project IN ({placeholders})
             ORDER BY created_at_epoch DESC, id DESC LIMIT {}",
            // Over-fetch so post-filtering can still fill the limit.
            limit.saturating_mul(3).max(limit)
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(projects.iter()),
            observation_from_row,
        )?;

        let mut out = Vec::new();
        for row in rows {
            let obs = row?;
            if let Some(types) = allowed_types {
                if !types.iter().any(|t| *t == obs.observation_type) {
                    continue;
                }
            }
            if let Some(concepts) = allowed_concepts {
                if !obs.concepts.is_empty()
                    && !obs.concepts.iter().any(|c| concepts.contains(c))
                {
                    continue;
                }
            }
            out.push(obs);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    /// Recent summaries across projects, newest first.
    pub fn recent_summaries(
        &self,
        projects: &[String],
        limit: usize,
    ) -> anyhow::Result<Vec<SummaryRow>> {
        if projects.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let placeholders = vec!["?"; projects.len()].join(",");
        let sql = format!(
            "SELECT {SUMMARY_COLUMNS} FROM session_summaries
             WHERE project IN ({placeholders})
             ORDER BY created_at_epoch DESC, id DESC LIMIT {limit}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(projects.iter()),
            summary_from_row,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Observations around an anchor id: `before` rows with smaller ids and
    /// `after` rows with larger ids, plus the anchor itself, ascending.
    pub fn observations_around(
        &self,
        anchor_id: i64,
        before: usize,
        after: usize,
    ) -> anyhow::Result<Vec<ObservationRow>> {
        let conn = self.conn()?;
        let mut out: Vec<ObservationRow> = Vec::new();

        let sql = format!(
            "SELECT {OBSERVATION_COLUMNS} FROM observations WHERE id <= ?1
             ORDER BY id DESC LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![anchor_id, (before + 1) as i64], observation_from_row)?;
        for row in rows {
            out.push(row?);
        }
        out.reverse();

        let sql = format!(
            "SELECT {OBSERVATION_COLUMNS} FROM observations WHERE id > ?1
             ORDER BY id ASC LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![anchor_id, after as i64], observation_from_row)?;
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Summaries within a closed time window, ascending.
    pub fn summaries_in_window(
        &self,
        project: &str,
        start: i64,
        end: i64,
    ) -> anyhow::Result<Vec<SummaryRow>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {SUMMARY_COLUMNS} FROM session_summaries
             WHERE project=?1 AND created_at_epoch BETWEEN ?2 AND ?3
             ORDER BY created_at_epoch ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![project, start, end], summary_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// User prompts within a closed time window for a project, ascending.
    pub fn prompts_in_window(
        &self,
        project: &str,
        start: i64,
        end: i64,
    ) -> anyhow::Result<Vec<UserPromptRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT p.id, p.content_session_id, p.prompt_number, p.prompt_text, p.created_at_epoch
             FROM user_prompts p
             JOIN sdk_sessions s ON s.content_session_id = p.content_session_id
             WHERE s.project=?1 AND p.created_at_epoch BETWEEN ?2 AND ?3
             ORDER BY p.created_at_epoch ASC",
        )?;
        let rows = stmt.query_map(params![project, start, end], |row| {
            Ok(UserPromptRow {
                id: row.get(0)?,
                content_session_id: row.get(1)?,
                prompt_number: row.get(2)?,
                prompt_text: row.get(3)?,
                created_at_epoch: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Keyword search over title/narrative. Uses the FTS index when the
    /// runtime has it, LIKE otherwise.
    pub fn search_observations_text(
        &self,
        query: &str,
        project: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<ObservationRow>> {
        let conn = self.conn()?;
        if self.fts_available() {
            let sql = format!(
                "SELECT {OBSERVATION_COLUMNS} FROM observations
                 WHERE id IN (SELECT rowid FROM observations_fts WHERE observations_fts MATCH ?1)
                   AND (?2 IS NULL OR project=?2)
                 ORDER BY created_at_epoch DESC LIMIT ?3"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![fts_quote(query), project, limit as i64],
                observation_from_row,
            )?;
            return Ok(rows.collect::<Result<Vec<_>, _>>()?);
        }

        let pattern = format!("%{}%", query);
        let sql = format!(
            "SELECT {OBSERVATION_COLUMNS} FROM observations
             WHERE (title LIKE ?1 OR narrative LIKE ?1)
               AND (?2 IS NULL OR project=?2)
             ORDER BY created_at_epoch DESC LIMIT ?3"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![pattern, project, limit as i64], observation_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Per-project counts and token totals for the stats endpoint.
    pub fn project_stats(&self, project: &str) -> anyhow::Result<ProjectStats> {
        let conn = self.conn()?;
        let (observation_count, discovery_tokens): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(discovery_tokens), 0) FROM observations WHERE project=?1",
            [project],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        let summary_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM session_summaries WHERE project=?1",
            [project],
            |r| r.get(0),
        )?;
        let session_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sdk_sessions WHERE project=?1",
            [project],
            |r| r.get(0),
        )?;
        Ok(ProjectStats {
            project: project.to_string(),
            observation_count,
            summary_count,
            session_count,
            discovery_tokens,
        })
    }
}

/// Aggregate counters for one project.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProjectStats {
    pub project: String,
    pub observation_count: i64,
    pub summary_count: i64,
    pub session_count: i64,
    pub discovery_tokens: i64,
}

/// Quote an FTS5 query so user text cannot inject query syntax.
fn fts_quote(query: &str) -> String {
    format!("\"{}\"", query.replace('"', "\"\""))
}

#[allow(clippy::too_many_arguments)]
fn insert_observation(
    tx: &Connection,
    memory_session_id: &str,
    project: &str,
    obs: &NewObservation,
    prompt_number: Option<i64>,
    discovery_tokens: i64,
    now: i64,
    fts: bool,
) -> anyhow::Result<(i64, bool)> {
    let hash = content_hash(
        memory_session_id,
        &obs.title,
        obs.narrative.as_deref().unwrap_or(""),
    );

    // Same-session near-duplicate suppression: an identical hash committed
    // within the window returns the existing row instead of inserting.
    let existing: Option<(i64, i64)> = tx
        .query_row(
            "SELECT id, created_at_epoch FROM observations
             WHERE content_hash=?1 ORDER BY created_at_epoch DESC LIMIT 1",
            [&hash],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    if let Some((id, created_at)) = existing {
        if (now - created_at).abs() <= DEDUP_WINDOW_MS {
            return Ok((id, true));
        }
    }

    tx.execute(
        "INSERT INTO observations
             (memory_session_id, project, type, title, subtitle, facts, narrative, concepts,
              files_read, files_modified, prompt_number, discovery_tokens, content_hash,
              created_at_epoch)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            memory_session_id,
            project,
            obs.observation_type,
            obs.title,
            obs.subtitle,
            list_to_json(&obs.facts),
            obs.narrative,
            list_to_json(&obs.concepts),
            list_to_json(&obs.files_read),
            list_to_json(&obs.files_modified),
            prompt_number,
            discovery_tokens,
            hash,
            now,
        ],
    )?;
    let id = tx.last_insert_rowid();

    if fts {
        // External-content FTS index must be kept in step with the base row.
        let indexed = tx.execute(
            "INSERT INTO observations_fts(rowid, title, narrative) VALUES (?1, ?2, ?3)",
            params![id, obs.title, obs.narrative.as_deref().unwrap_or("")],
        );
        if let Err(e) = indexed {
            tracing::warn!("FTS index insert failed for observation {}: {}", id, e);
        }
    }

    Ok((id, false))
}

fn insert_summary(
    tx: &Connection,
    memory_session_id: &str,
    project: &str,
    summary: &NewSummary,
    prompt_number: Option<i64>,
    discovery_tokens: i64,
    now: i64,
) -> anyhow::Result<i64> {
    tx.execute(
        "INSERT INTO session_summaries
             (memory_session_id, project, request, investigated, learned, completed, next_steps,
              files_read, files_edited, notes, prompt_number, discovery_tokens, created_at_epoch)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            memory_session_id,
            project,
            summary.request,
            summary.investigated,
            summary.learned,
            summary.completed,
            summary.next_steps,
            list_to_json(&summary.files_read),
            list_to_json(&summary.files_edited),
            summary.notes,
            prompt_number,
            discovery_tokens,
            now,
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_store() -> (tempfile::TempDir, Store) {
        let (dir, store) = Store::open_temp();
        let id = store.create_session("c1", "demo", None, None, None).unwrap();
        store.register_memory_session_id(id, "m1").unwrap();
        (dir, store)
    }

    fn obs(title: &str) -> NewObservation {
        NewObservation {
            observation_type: "discovery".into(),
            title: title.into(),
            narrative: Some("N".into()),
            ..Default::default()
        }
    }

    #[test]
    fn content_hash_is_16_hex_chars() {
        let h = content_hash("m1", "T", "N");
        assert_eq!(h.len(), 16);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(h, content_hash("m2", "T", "N"));
    }

    #[test]
    fn duplicate_within_window_returns_existing_id() {
        let (_dir, store) = seeded_store();
        let a = store
            .store_observation_single("m1", "demo", &obs("T"), None, 100)
            .unwrap();
        let b = store
            .store_observation_single("m1", "demo", &obs("T"), None, 100)
            .unwrap();
        assert_eq!(a, b);

        let conn = store.conn().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM observations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn duplicate_outside_window_inserts_fresh_row() {
        let (_dir, store) = seeded_store();
        let a = store
            .store_observations("m1", "demo", &[obs("T")], None, None, 0, Some(1_000), None)
            .unwrap();
        let b = store
            .store_observations("m1", "demo", &[obs("T")], None, None, 0, Some(60_000), None)
            .unwrap();
        assert_ne!(a.observation_ids[0], b.observation_ids[0]);
        assert!(b.deduplicated.is_empty());
    }

    #[test]
    fn batch_store_is_atomic_with_confirm() {
        let (_dir, store) = seeded_store();
        let msg_id = store
            .enqueue(&crate::store::NewPendingMessage {
                session_db_id: 1,
                content_session_id: "c1".into(),
                message_type: crate::store::MessageType::Observation,
                tool_name: Some("Read".into()),
                tool_input: Some("{}".into()),
                tool_response: Some("{}".into()),
                cwd: None,
                last_assistant_message: None,
                prompt_number: Some(1),
            })
            .unwrap();
        let claimed = store.claim_next(1).unwrap().unwrap();
        assert_eq!(claimed.id, msg_id);

        let batch = store
            .store_observations(
                "m1",
                "demo",
                &[obs("A"), obs("B")],
                Some(&NewSummary::default()),
                Some(1),
                300,
                None,
                Some(msg_id),
            )
            .unwrap();
        assert_eq!(batch.observation_ids.len(), 2);
        assert!(batch.summary_id.is_some());

        // Confirmed with payload nulled.
        let conn = store.conn().unwrap();
        let (status, input): (String, Option<String>) = conn
            .query_row(
                "SELECT status, tool_input FROM pending_messages WHERE id=?1",
                [msg_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(status, "processed");
        assert!(input.is_none());
    }

    #[test]
    fn confirm_of_unclaimed_message_rolls_everything_back() {
        let (_dir, store) = seeded_store();
        let msg_id = store
            .enqueue(&crate::store::NewPendingMessage {
                session_db_id: 1,
                content_session_id: "c1".into(),
                message_type: crate::store::MessageType::Observation,
                tool_name: None,
                tool_input: None,
                tool_response: None,
                cwd: None,
                last_assistant_message: None,
                prompt_number: None,
            })
            .unwrap();
        // Never claimed: still pending, so the guarded confirm matches zero
        // rows and the observation insert must not survive.
        let result = store.store_observations(
            "m1", "demo", &[obs("T")], None, None, 0, None, Some(msg_id),
        );
        assert!(result.is_err());

        let conn = store.conn().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM observations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn recent_observations_filters_types_and_concepts() {
        let (_dir, store) = seeded_store();
        let mut a = obs("A");
        a.concepts = vec!["architecture".into()];
        let mut b = obs("B");
        b.observation_type = "bugfix".into();
        b.concepts = vec!["testing".into()];
        store
            .store_observations("m1", "demo", &[a, b], None, None, 0, None, None)
            .unwrap();

        let projects = vec!["demo".to_string()];
        let all = store.recent_observations(&projects, None, None, 10).unwrap();
        assert_eq!(all.len(), 2);

        let discoveries = store
            .recent_observations(&projects, Some(&["discovery".to_string()]), None, 10)
            .unwrap();
        assert_eq!(discoveries.len(), 1);
        assert_eq!(discoveries[0].title, "A");

        let testing = store
            .recent_observations(&projects, None, Some(&["testing".to_string()]), 10)
            .unwrap();
        assert_eq!(testing.len(), 1);
        assert_eq!(testing[0].title, "B");
    }

    #[test]
    fn observations_around_anchor() {
        let (_dir, store) = seeded_store();
        for i in 0..5 {
            store
                .store_observations(
                    "m1",
                    "demo",
                    &[obs(&format!("T{i}"))],
                    None,
                    None,
                    0,
                    Some(1_000 * (i + 1)),
                    None,
                )
                .unwrap();
        }
        let window = store.observations_around(3, 1, 1).unwrap();
        let ids: Vec<i64> = window.iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
    }

    #[test]
    fn text_search_finds_by_title() {
        let (_dir, store) = seeded_store();
        store
            .store_observation_single("m1", "demo", &obs("solarized theme crash"), None, 0)
            .unwrap();
        let hits = store
            .search_observations_text("solarized", Some("demo"), 10)
            .unwrap();
        assert_eq!(hits.len(), 1);
    }
}
