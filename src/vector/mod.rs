//! Vector mirror
//!
//! Project-scoped embedding mirror of observations, summaries and user
//! prompts. The relational store is the source of truth; the mirror only
//! serves semantic search and timeline anchoring, so every sync is
//! best-effort and every failure is logged rather than raised.
//!
//! One collection per project, named `cm__<project>`, all stored in a
//! single SQLite file under `<data_dir>/vector-db/`.
//!
//! # Connection lifecycle
//!
//! The embedder handle and the database connection live together in
//! `MirrorInner` behind one mutex. Any storage error drops the whole inner
//! (closing both) before the next call reconnects - a half-torn handle is
//! never left behind for a reconnect to leak.

mod embedder;

pub use embedder::{blob_to_embedding, cosine_similarity, embedding_to_blob, Embedding};

use crate::store::{ObservationRow, Store, SummaryRow, UserPromptRow};
use embedder::EmbeddingBackend;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use std::sync::Mutex;

/// Record kinds mirrored into a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DocKind {
    Observation,
    Summary,
    Prompt,
}

impl DocKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Observation => "observation",
            Self::Summary => "summary",
            Self::Prompt => "prompt",
        }
    }
}

/// A semantic search hit.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MirrorMatch {
    pub doc_id: i64,
    pub kind: DocKind,
    pub text: String,
    pub score: f32,
    pub created_at_epoch: i64,
}

struct MirrorInner {
    conn: Connection,
    backend: EmbeddingBackend,
}

/// Shared mirror handle. One per process.
pub struct VectorMirror {
    db_path: PathBuf,
    inner: Mutex<Option<MirrorInner>>,
}

/// Collection name for a project.
pub fn collection_name(project: &str) -> String {
    format!("cm__{}", project)
}

impl VectorMirror {
    /// Create the handle. The connection and model are opened lazily on
    /// first use so startup is not gated on an ONNX model load.
    pub fn new(db_path: PathBuf) -> Self {
        Self {
            db_path,
            inner: Mutex::new(None),
        }
    }

    /// Close the transport and embedder. Idempotent.
    pub fn close(&self) {
        let mut guard = self.inner.lock().unwrap();
        if guard.take().is_some() {
            tracing::debug!("Vector mirror closed");
        }
    }

    /// True when an embedding backend is live (or can be brought up).
    pub fn is_enabled(&self) -> bool {
        cfg!(feature = "local-embeddings")
    }

    /// Mirror an observation. Failures are logged, never raised.
    pub fn sync_observation(&self, obs: &ObservationRow) {
        let text = observation_text(obs);
        self.sync_document(
            &obs.project,
            DocKind::Observation,
            obs.id,
            &text,
            obs.created_at_epoch,
        );
    }

    /// Mirror a session summary.
    pub fn sync_summary(&self, summary: &SummaryRow) {
        let text = summary_text(summary);
        self.sync_document(
            &summary.project,
            DocKind::Summary,
            summary.id,
            &text,
            summary.created_at_epoch,
        );
    }

    /// Mirror a user prompt.
    pub fn sync_prompt(&self, project: &str, prompt: &UserPromptRow) {
        self.sync_document(
            project,
            DocKind::Prompt,
            prompt.id,
            &prompt.prompt_text,
            prompt.created_at_epoch,
        );
    }

    fn sync_document(&self, project: &str, kind: DocKind, doc_id: i64, text: &str, created: i64) {
        let result = self.with_inner(|inner| {
            let embeddings = inner.backend.embed(vec![text.to_string()])?;
            let Some(embedding) = embeddings.into_iter().next() else {
                return Ok(()); // degraded backend, nothing to mirror
            };
            inner.conn.execute(
                "INSERT OR REPLACE INTO mirror_documents
                     (collection, kind, doc_id, text, embedding, created_at_epoch)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    collection_name(project),
                    kind.as_str(),
                    doc_id,
                    text,
                    embedding_to_blob(&embedding),
                    created,
                ],
            )?;
            Ok(())
        });
        if let Err(e) = result {
            tracing::warn!("Mirror sync failed ({} {}): {}", kind.as_str(), doc_id, e);
        }
    }

    /// Semantic search within a project's collection, best score first.
    pub fn search(
        &self,
        project: &str,
        query: &str,
        kinds: Option<&[DocKind]>,
        limit: usize,
    ) -> anyhow::Result<Vec<MirrorMatch>> {
        self.with_inner(|inner| {
            let mut embeddings = inner.backend.embed(vec![query.to_string()])?;
            let Some(query_embedding) = embeddings.pop() else {
                return Ok(Vec::new()); // degraded
            };

            let mut stmt = inner.conn.prepare(
                "SELECT doc_id, kind, text, embedding, created_at_epoch
                 FROM mirror_documents WHERE collection=?1",
            )?;
            let rows = stmt.query_map([collection_name(project)], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?;

            let mut results: Vec<MirrorMatch> = Vec::new();
            for row in rows {
                let (doc_id, kind_str, text, blob, created_at_epoch) = row?;
                let kind = match kind_str.as_str() {
                    "observation" => DocKind::Observation,
                    "summary" => DocKind::Summary,
                    "prompt" => DocKind::Prompt,
                    _ => continue,
                };
                if let Some(kinds) = kinds {
                    if !kinds.contains(&kind) {
                        continue;
                    }
                }
                let score = cosine_similarity(&query_embedding, &blob_to_embedding(&blob));
                results.push(MirrorMatch {
                    doc_id,
                    kind,
                    text,
                    score,
                    created_at_epoch,
                });
            }

            results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
            results.truncate(limit);
            Ok(results)
        })
    }

    /// Best observation match for timeline anchoring.
    pub fn best_observation_match(
        &self,
        project: &str,
        query: &str,
    ) -> anyhow::Result<Option<MirrorMatch>> {
        Ok(self
            .search(project, query, Some(&[DocKind::Observation]), 1)?
            .into_iter()
            .next())
    }

    /// Re-sync rows present in SQL but missing from the mirror. Invoked by
    /// the maintenance task at a slow cadence.
    pub fn backfill(&self, store: &Store, project: &str) -> anyhow::Result<usize> {
        let projects = vec![project.to_string()];
        let observations = store.recent_observations(&projects, None, None, 500)?;
        let mut synced = 0usize;

        for obs in &observations {
            let missing = self.with_inner(|inner| {
                let found: Option<i64> = inner
                    .conn
                    .query_row(
                        "SELECT doc_id FROM mirror_documents
                         WHERE collection=?1 AND kind='observation' AND doc_id=?2",
                        params![collection_name(project), obs.id],
                        |r| r.get(0),
                    )
                    .optional()?;
                Ok(found.is_none())
            })?;
            if missing {
                self.sync_observation(obs);
                synced += 1;
            }
        }
        Ok(synced)
    }

    /// Run `f` against the live inner handle, connecting first if needed.
    /// On any error the inner is dropped (closing connection and embedder)
    /// so the next call starts from a clean reconnect.
    fn with_inner<R>(
        &self,
        f: impl FnOnce(&mut MirrorInner) -> anyhow::Result<R>,
    ) -> anyhow::Result<R> {
        let mut guard = self.inner.lock().unwrap();
        if guard.is_none() {
            *guard = Some(self.connect()?);
        }
        let inner = guard.as_mut().expect("just connected");
        match f(inner) {
            Ok(value) => Ok(value),
            Err(e) => {
                // Close the prior transport before any reconnect happens.
                *guard = None;
                Err(e)
            }
        }
    }

    fn connect(&self) -> anyhow::Result<MirrorInner> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            CREATE TABLE IF NOT EXISTS mirror_documents (
                collection        TEXT NOT NULL,
                kind              TEXT NOT NULL,
                doc_id            INTEGER NOT NULL,
                text              TEXT NOT NULL,
                embedding         BLOB NOT NULL,
                created_at_epoch  INTEGER NOT NULL,
                PRIMARY KEY (collection, kind, doc_id)
            );
            "#,
        )?;
        Ok(MirrorInner {
            conn,
            backend: EmbeddingBackend::init(),
        })
    }
}

fn observation_text(obs: &ObservationRow) -> String {
    let mut text = obs.title.clone();
    if let Some(subtitle) = &obs.subtitle {
        text.push_str("\n");
        text.push_str(subtitle);
    }
    if let Some(narrative) = &obs.narrative {
        text.push_str("\n");
        text.push_str(narrative);
    }
    if !obs.facts.is_empty() {
        text.push_str("\n");
        text.push_str(&obs.facts.join("\n"));
    }
    text
}

fn summary_text(summary: &SummaryRow) -> String {
    [
        summary.request.as_deref(),
        summary.investigated.as_deref(),
        summary.learned.as_deref(),
        summary.completed.as_deref(),
        summary.next_steps.as_deref(),
    ]
    .iter()
    .flatten()
    .copied()
    .collect::<Vec<_>>()
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = VectorMirror::new(dir.path().join("vectors.db"));
        mirror.close();
        mirror.close();
    }

    #[test]
    fn collection_names_are_project_scoped() {
        assert_eq!(collection_name("demo"), "cm__demo");
    }

    #[test]
    fn degraded_sync_and_search_do_not_error() {
        // Without the local-embeddings feature the backend is NoOp: sync
        // stores nothing and search returns empty, but nothing fails.
        let dir = tempfile::tempdir().unwrap();
        let mirror = VectorMirror::new(dir.path().join("vectors.db"));

        let obs = ObservationRow {
            id: 1,
            memory_session_id: "m1".into(),
            project: "demo".into(),
            observation_type: "discovery".into(),
            title: "T".into(),
            subtitle: None,
            facts: vec![],
            narrative: Some("N".into()),
            concepts: vec![],
            files_read: vec![],
            files_modified: vec![],
            prompt_number: None,
            discovery_tokens: 0,
            content_hash: "0".repeat(16),
            created_at_epoch: 1,
        };
        mirror.sync_observation(&obs);

        let hits = mirror.search("demo", "anything", None, 5).unwrap();
        if !mirror.is_enabled() {
            assert!(hits.is_empty());
        }
    }
}
