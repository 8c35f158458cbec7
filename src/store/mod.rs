//! Relational store
//!
//! Single-file SQLite database holding sessions, observations, summaries,
//! user prompts and the pending-message queue. WAL journaling keeps readers
//! unblocked while agents write; a small r2d2 pool serves the HTTP read
//! path and the agent loops concurrently.
//!
//! # Architecture
//!
//! ```text
//! HTTP handlers ──┐
//! Agent loops ────┼──→ Store (r2d2 pool, max 4)
//! Maintenance ────┘        │
//!                          ├──→ migrations (idempotent, schema_versions)
//!                          ├──→ sessions / observations / summaries / prompts
//!                          └──→ pending_messages (claim-confirm queue)
//! ```

mod migrations;
mod observations;
mod queue;
mod sessions;
mod types;

pub use observations::{content_hash, ProjectStats, StoredBatch};
pub use queue::QueueStats;
pub use types::{
    MessageStatus, MessageType, NewObservation, NewPendingMessage, NewSummary, ObservationRow,
    PendingMessage, SessionRow, SessionStatus, SummaryRow, UserPromptRow,
};

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Connection pool size. One writer at a time is typical; the extra
/// connections serve concurrent HTTP reads under WAL.
const POOL_SIZE: u32 = 4;

/// Pragmas applied to every pooled connection.
fn configure_connection(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA busy_timeout=5000;
        PRAGMA foreign_keys=ON;
        "#,
    )
}

/// Handle to the relational store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: Pool<SqliteConnectionManager>,
    /// False when the runtime lacks the FTS5 extension; search degrades to
    /// structured filters.
    fts_available: Arc<AtomicBool>,
}

impl Store {
    /// Open (creating if needed) the database at `db_path` and run all
    /// migrations. Migration failure aborts startup; the store never
    /// degrades writes silently.
    pub fn open(db_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(db_path)
            .with_init(|conn| configure_connection(conn));
        let pool = Pool::builder().max_size(POOL_SIZE).build(manager)?;

        let store = Self {
            pool,
            fts_available: Arc::new(AtomicBool::new(false)),
        };

        let conn = store.conn()?;
        let fts = migrations::run(&conn)?;
        store.fts_available.store(fts, Ordering::Relaxed);
        if !fts {
            tracing::warn!("FTS5 unavailable; keyword search degrades to structured filters");
        }

        Ok(store)
    }

    /// Open an in-memory-style throwaway store for tests.
    #[cfg(test)]
    pub fn open_temp() -> (tempfile::TempDir, Self) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Self::open(dir.path().join("test.db")).expect("open store");
        (dir, store)
    }

    pub(crate) fn conn(&self) -> anyhow::Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    pub fn fts_available(&self) -> bool {
        self.fts_available.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_schema_and_is_reopenable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mem.db");

        let store = Store::open(&path).unwrap();
        let conn = store.conn().unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
                 ('sdk_sessions','observations','session_summaries','user_prompts','pending_messages','schema_versions')",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(tables, 6);
        drop(conn);
        drop(store);

        // Second open re-runs migrations; must be a clean no-op.
        let store = Store::open(&path).unwrap();
        assert!(store.conn().is_ok());
    }

    #[test]
    fn foreign_keys_are_enforced() {
        let (_dir, store) = Store::open_temp();
        let conn = store.conn().unwrap();
        let err = conn.execute(
            "INSERT INTO observations (memory_session_id, project, type, title, created_at_epoch)
             VALUES ('nope', 'p', 't', 'x', 1)",
            [],
        );
        assert!(err.is_err(), "orphan observation insert must fail");
    }
}
