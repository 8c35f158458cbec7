//! Schema migrations
//!
//! A `schema_versions(version, applied_at)` table records applied numbered
//! migrations. Every migration probes the actual state of the database
//! (`pragma_table_info`, `sqlite_master`, `pragma_foreign_key_list`) before
//! acting, and runs on every process start regardless of the recorded
//! version. That makes three awkward histories safe:
//!
//! - a crash between DDL and the version insert (the probe sees the work
//!   already done and records the version),
//! - a database carrying version rows from an older numbering scheme with
//!   none of the current tables (the probes see nothing and build them),
//! - a leftover `<table>_new` from a crashed rebuild (dropped up front).

use crate::util::now_epoch_ms;
use rusqlite::Connection;

struct Migration {
    version: i64,
    name: &'static str,
    apply: fn(&Connection) -> anyhow::Result<()>,
}

const MIGRATIONS: &[Migration] = &[
    Migration { version: 1, name: "create sdk_sessions", apply: create_sdk_sessions },
    Migration { version: 2, name: "create observations", apply: create_observations },
    Migration { version: 3, name: "create session_summaries", apply: create_session_summaries },
    Migration { version: 4, name: "create user_prompts", apply: create_user_prompts },
    Migration { version: 5, name: "create pending_messages", apply: create_pending_messages },
    Migration { version: 6, name: "add session title/port columns", apply: add_session_columns },
    Migration { version: 7, name: "add observation content_hash", apply: add_content_hash },
    Migration { version: 8, name: "cascade FKs on observations", apply: rebuild_observations_fk },
    Migration { version: 9, name: "cascade FKs on session_summaries", apply: rebuild_summaries_fk },
    Migration { version: 10, name: "observation full-text index", apply: create_observations_fts },
];

/// Run all migrations. Returns whether the FTS index is available.
pub fn run(conn: &Connection) -> anyhow::Result<bool> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_versions (
            version    INTEGER NOT NULL UNIQUE,
            applied_at INTEGER NOT NULL
        );
        "#,
    )?;

    for m in MIGRATIONS {
        (m.apply)(conn).map_err(|e| {
            anyhow::anyhow!("migration {} ({}) failed: {}", m.version, m.name, e)
        })?;

        let recorded = conn.execute(
            "INSERT OR IGNORE INTO schema_versions (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![m.version, now_epoch_ms()],
        )?;
        if recorded > 0 {
            tracing::info!("Applied schema migration {} ({})", m.version, m.name);
        }
    }

    Ok(fts_table_exists(conn)?)
}

// ─────────────────────────────────────────────────────────────────────────────
// Probes
// ─────────────────────────────────────────────────────────────────────────────

fn table_exists(conn: &Connection, name: &str) -> anyhow::Result<bool> {
    Ok(conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name=?1",
        [name],
        |row| row.get(0),
    )?)
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!(
        "SELECT COUNT(*) > 0 FROM pragma_table_info('{table}') WHERE name=?1"
    );
    Ok(conn.query_row(&sql, [column], |row| row.get(0))?)
}

/// True when `table` carries an FK to sdk_sessions with ON UPDATE CASCADE.
fn has_cascading_fk(conn: &Connection, table: &str) -> anyhow::Result<bool> {
    let sql = format!(
        "SELECT COUNT(*) > 0 FROM pragma_foreign_key_list('{table}')
         WHERE \"table\"='sdk_sessions' AND on_update='CASCADE' AND on_delete='CASCADE'"
    );
    Ok(conn.query_row(&sql, [], |row| row.get(0))?)
}

fn fts_table_exists(conn: &Connection) -> anyhow::Result<bool> {
    table_exists(conn, "observations_fts")
}

// ─────────────────────────────────────────────────────────────────────────────
// v1..v5: base tables
// ─────────────────────────────────────────────────────────────────────────────

fn create_sdk_sessions(conn: &Connection) -> anyhow::Result<()> {
    if table_exists(conn, "sdk_sessions")? {
        return Ok(());
    }
    conn.execute_batch(
        r#"
        CREATE TABLE sdk_sessions (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            content_session_id  TEXT NOT NULL UNIQUE,
            memory_session_id   TEXT UNIQUE,
            project             TEXT NOT NULL DEFAULT '',
            user_prompt         TEXT,
            started_at_epoch    INTEGER NOT NULL,
            completed_at_epoch  INTEGER,
            status              TEXT NOT NULL DEFAULT 'active',
            prompt_counter      INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_project ON sdk_sessions(project);
        CREATE INDEX IF NOT EXISTS idx_sessions_status ON sdk_sessions(status);
        "#,
    )?;
    Ok(())
}

fn create_observations(conn: &Connection) -> anyhow::Result<()> {
    if table_exists(conn, "observations")? {
        return Ok(());
    }
    // FK cascade behavior is added by migration 8; older installs created
    // the table with a plain reference.
    conn.execute_batch(
        r#"
        CREATE TABLE observations (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            memory_session_id  TEXT NOT NULL,
            project            TEXT NOT NULL,
            type               TEXT NOT NULL,
            title              TEXT NOT NULL,
            subtitle           TEXT,
            facts              TEXT,
            narrative          TEXT,
            concepts           TEXT,
            files_read         TEXT,
            files_modified     TEXT,
            prompt_number      INTEGER,
            discovery_tokens   INTEGER NOT NULL DEFAULT 0,
            content_hash       TEXT,
            created_at_epoch   INTEGER NOT NULL,
            FOREIGN KEY (memory_session_id) REFERENCES sdk_sessions(memory_session_id)
                ON DELETE CASCADE ON UPDATE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_observations_session ON observations(memory_session_id);
        CREATE INDEX IF NOT EXISTS idx_observations_project_created ON observations(project, created_at_epoch);
        CREATE INDEX IF NOT EXISTS idx_observations_hash ON observations(content_hash);
        "#,
    )?;
    Ok(())
}

fn create_session_summaries(conn: &Connection) -> anyhow::Result<()> {
    if table_exists(conn, "session_summaries")? {
        return Ok(());
    }
    conn.execute_batch(
        r#"
        CREATE TABLE session_summaries (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            memory_session_id  TEXT NOT NULL,
            project            TEXT NOT NULL,
            request            TEXT,
            investigated       TEXT,
            learned            TEXT,
            completed          TEXT,
            next_steps         TEXT,
            files_read         TEXT,
            files_edited       TEXT,
            notes              TEXT,
            prompt_number      INTEGER,
            discovery_tokens   INTEGER NOT NULL DEFAULT 0,
            created_at_epoch   INTEGER NOT NULL,
            FOREIGN KEY (memory_session_id) REFERENCES sdk_sessions(memory_session_id)
                ON DELETE CASCADE ON UPDATE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_summaries_session ON session_summaries(memory_session_id);
        CREATE INDEX IF NOT EXISTS idx_summaries_project_created ON session_summaries(project, created_at_epoch);
        "#,
    )?;
    Ok(())
}

fn create_user_prompts(conn: &Connection) -> anyhow::Result<()> {
    if table_exists(conn, "user_prompts")? {
        return Ok(());
    }
    conn.execute_batch(
        r#"
        CREATE TABLE user_prompts (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            content_session_id  TEXT NOT NULL,
            prompt_number       INTEGER NOT NULL,
            prompt_text         TEXT NOT NULL,
            created_at_epoch    INTEGER NOT NULL,
            FOREIGN KEY (content_session_id) REFERENCES sdk_sessions(content_session_id)
                ON DELETE CASCADE ON UPDATE CASCADE
        );
        CREATE UNIQUE INDEX IF NOT EXISTS uidx_prompts_session_number
            ON user_prompts(content_session_id, prompt_number);
        "#,
    )?;
    Ok(())
}

fn create_pending_messages(conn: &Connection) -> anyhow::Result<()> {
    if table_exists(conn, "pending_messages")? {
        return Ok(());
    }
    conn.execute_batch(
        r#"
        CREATE TABLE pending_messages (
            id                            INTEGER PRIMARY KEY AUTOINCREMENT,
            session_db_id                 INTEGER NOT NULL,
            content_session_id            TEXT NOT NULL,
            message_type                  TEXT NOT NULL,
            tool_name                     TEXT,
            tool_input                    TEXT,
            tool_response                 TEXT,
            cwd                           TEXT,
            last_assistant_message        TEXT,
            prompt_number                 INTEGER,
            status                        TEXT NOT NULL DEFAULT 'pending',
            retry_count                   INTEGER NOT NULL DEFAULT 0,
            created_at_epoch              INTEGER NOT NULL,
            started_processing_at_epoch   INTEGER,
            completed_at_epoch            INTEGER,
            failed_at_epoch               INTEGER,
            FOREIGN KEY (session_db_id) REFERENCES sdk_sessions(id)
                ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_pending_session_status
            ON pending_messages(session_db_id, status);
        CREATE INDEX IF NOT EXISTS idx_pending_status ON pending_messages(status);
        "#,
    )?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// v6..v7: column additions
// ─────────────────────────────────────────────────────────────────────────────

fn add_session_columns(conn: &Connection) -> anyhow::Result<()> {
    if !column_exists(conn, "sdk_sessions", "custom_title")? {
        conn.execute("ALTER TABLE sdk_sessions ADD COLUMN custom_title TEXT", [])?;
    }
    if !column_exists(conn, "sdk_sessions", "worker_port")? {
        conn.execute("ALTER TABLE sdk_sessions ADD COLUMN worker_port INTEGER", [])?;
    }
    Ok(())
}

fn add_content_hash(conn: &Connection) -> anyhow::Result<()> {
    if !column_exists(conn, "observations", "content_hash")? {
        conn.execute("ALTER TABLE observations ADD COLUMN content_hash TEXT", [])?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_observations_hash ON observations(content_hash)",
            [],
        )?;
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// v8..v9: table rebuilds for FK cascades
// ─────────────────────────────────────────────────────────────────────────────
//
// SQLite cannot ALTER an FK clause, so these rebuild via `<table>_new`.
// The leftover `_new` table from a crashed run is dropped first; the whole
// copy-drop-rename runs with FKs off inside one transaction, and dependent
// indexes are re-created before commit.

fn rebuild_observations_fk(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("DROP TABLE IF EXISTS observations_new", [])?;
    if has_cascading_fk(conn, "observations")? {
        return Ok(());
    }

    conn.execute_batch("PRAGMA foreign_keys=OFF")?;
    let result = conn.execute_batch(
        r#"
        BEGIN;
        CREATE TABLE observations_new (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            memory_session_id  TEXT NOT NULL,
            project            TEXT NOT NULL,
            type               TEXT NOT NULL,
            title              TEXT NOT NULL,
            subtitle           TEXT,
            facts              TEXT,
            narrative          TEXT,
            concepts           TEXT,
            files_read         TEXT,
            files_modified     TEXT,
            prompt_number      INTEGER,
            discovery_tokens   INTEGER NOT NULL DEFAULT 0,
            content_hash       TEXT,
            created_at_epoch   INTEGER NOT NULL,
            FOREIGN KEY (memory_session_id) REFERENCES sdk_sessions(memory_session_id)
                ON DELETE CASCADE ON UPDATE CASCADE
        );
        INSERT INTO observations_new
            (id, memory_session_id, project, type, title, subtitle, facts, narrative,
             concepts, files_read, files_modified, prompt_number, discovery_tokens,
             content_hash, created_at_epoch)
            SELECT id, memory_session_id, project, type, title, subtitle, facts, narrative,
                   concepts, files_read, files_modified, prompt_number, discovery_tokens,
                   content_hash, created_at_epoch
            FROM observations;
        DROP TABLE observations;
        ALTER TABLE observations_new RENAME TO observations;
        CREATE INDEX IF NOT EXISTS idx_observations_session ON observations(memory_session_id);
        CREATE INDEX IF NOT EXISTS idx_observations_project_created ON observations(project, created_at_epoch);
        CREATE INDEX IF NOT EXISTS idx_observations_hash ON observations(content_hash);
        COMMIT;
        "#,
    );
    conn.execute_batch("PRAGMA foreign_keys=ON")?;
    result?;
    Ok(())
}

fn rebuild_summaries_fk(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("DROP TABLE IF EXISTS session_summaries_new", [])?;
    if has_cascading_fk(conn, "session_summaries")? {
        return Ok(());
    }

    conn.execute_batch("PRAGMA foreign_keys=OFF")?;
    let result = conn.execute_batch(
        r#"
        BEGIN;
        CREATE TABLE session_summaries_new (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            memory_session_id  TEXT NOT NULL,
            project            TEXT NOT NULL,
            request            TEXT,
            investigated       TEXT,
            learned            TEXT,
            completed          TEXT,
            next_steps         TEXT,
            files_read         TEXT,
            files_edited       TEXT,
            notes              TEXT,
            prompt_number      INTEGER,
            discovery_tokens   INTEGER NOT NULL DEFAULT 0,
            created_at_epoch   INTEGER NOT NULL,
            FOREIGN KEY (memory_session_id) REFERENCES sdk_sessions(memory_session_id)
                ON DELETE CASCADE ON UPDATE CASCADE
        );
        INSERT INTO session_summaries_new
            (id, memory_session_id, project, request, investigated, learned, completed,
             next_steps, files_read, files_edited, notes, prompt_number, discovery_tokens,
             created_at_epoch)
            SELECT id, memory_session_id, project, request, investigated, learned, completed,
                   next_steps, files_read, files_edited, notes, prompt_number, discovery_tokens,
                   created_at_epoch
            FROM session_summaries;
        DROP TABLE session_summaries;
        ALTER TABLE session_summaries_new RENAME TO session_summaries;
        CREATE INDEX IF NOT EXISTS idx_summaries_session ON session_summaries(memory_session_id);
        CREATE INDEX IF NOT EXISTS idx_summaries_project_created ON session_summaries(project, created_at_epoch);
        COMMIT;
        "#,
    );
    conn.execute_batch("PRAGMA foreign_keys=ON")?;
    result?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// v10: FTS (best-effort)
// ─────────────────────────────────────────────────────────────────────────────

fn create_observations_fts(conn: &Connection) -> anyhow::Result<()> {
    if fts_table_exists(conn)? {
        return Ok(());
    }
    let created = conn.execute_batch(
        r#"
        CREATE VIRTUAL TABLE observations_fts USING fts5(
            title, narrative,
            content=observations,
            content_rowid=id,
            tokenize='porter unicode61'
        );
        "#,
    );
    if let Err(e) = created {
        // FTS5 missing from the runtime: search degrades, writes continue.
        tracing::warn!("Could not create observations_fts: {}", e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_raw() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON").unwrap();
        conn
    }

    fn recorded_versions(conn: &Connection) -> Vec<i64> {
        let mut stmt = conn
            .prepare("SELECT version FROM schema_versions ORDER BY version")
            .unwrap();
        stmt.query_map([], |r| r.get(0))
            .unwrap()
            .map(|v| v.unwrap())
            .collect()
    }

    #[test]
    fn migrations_run_twice_identically() {
        let conn = open_raw();
        run(&conn).unwrap();
        let first_versions = recorded_versions(&conn);
        let first_objects: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE name NOT LIKE 'sqlite_%' ORDER BY name")
                .unwrap();
            stmt.query_map([], |r| r.get(0)).unwrap().map(|v| v.unwrap()).collect()
        };

        run(&conn).unwrap();
        assert_eq!(recorded_versions(&conn), first_versions);
        let second_objects: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE name NOT LIKE 'sqlite_%' ORDER BY name")
                .unwrap();
            stmt.query_map([], |r| r.get(0)).unwrap().map(|v| v.unwrap()).collect()
        };
        assert_eq!(first_objects, second_objects);
    }

    #[test]
    fn migrations_preserve_existing_rows() {
        let conn = open_raw();
        run(&conn).unwrap();
        conn.execute(
            "INSERT INTO sdk_sessions (content_session_id, project, started_at_epoch) VALUES ('c1', 'demo', 1)",
            [],
        )
        .unwrap();

        run(&conn).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM sdk_sessions WHERE content_session_id='c1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn legacy_version_rows_without_tables_recover() {
        // Old numbering scheme recorded versions 1-7, but none of the
        // current tables exist.
        let conn = open_raw();
        conn.execute_batch(
            "CREATE TABLE schema_versions (version INTEGER NOT NULL UNIQUE, applied_at INTEGER NOT NULL);",
        )
        .unwrap();
        for v in 1..=7 {
            conn.execute(
                "INSERT INTO schema_versions (version, applied_at) VALUES (?1, 0)",
                [v],
            )
            .unwrap();
        }

        run(&conn).unwrap();

        for table in [
            "sdk_sessions",
            "observations",
            "session_summaries",
            "user_prompts",
            "pending_messages",
        ] {
            assert!(table_exists(&conn, table).unwrap(), "{table} missing");
        }
        assert!(column_exists(&conn, "observations", "content_hash").unwrap());
    }

    #[test]
    fn leftover_rebuild_table_is_cleared() {
        let conn = open_raw();
        run(&conn).unwrap();

        // Simulate a crash mid-rebuild: a stray observations_new and the
        // version row removed.
        conn.execute("CREATE TABLE observations_new (id INTEGER)", []).unwrap();
        conn.execute("DELETE FROM schema_versions WHERE version=8", []).unwrap();

        run(&conn).unwrap();
        assert!(!table_exists(&conn, "observations_new").unwrap());
        assert!(recorded_versions(&conn).contains(&8));
    }

    #[test]
    fn observation_fk_cascades_on_update() {
        let conn = open_raw();
        run(&conn).unwrap();

        conn.execute(
            "INSERT INTO sdk_sessions (content_session_id, memory_session_id, project, started_at_epoch)
             VALUES ('c1', 'm1', 'demo', 1)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO observations (memory_session_id, project, type, title, created_at_epoch)
             VALUES ('m1', 'demo', 'discovery', 'T', 1)",
            [],
        )
        .unwrap();

        conn.execute(
            "UPDATE sdk_sessions SET memory_session_id='m2' WHERE content_session_id='c1'",
            [],
        )
        .unwrap();
        let child: String = conn
            .query_row("SELECT memory_session_id FROM observations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(child, "m2");
    }
}
