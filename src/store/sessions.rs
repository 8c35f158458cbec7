//! Session and user-prompt operations

use super::types::{SessionRow, SessionStatus, UserPromptRow};
use super::Store;
use crate::util::now_epoch_ms;
use rusqlite::{params, OptionalExtension, Row};

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<SessionRow> {
    let status: String = row.get("status")?;
    let worker_port: Option<i64> = row.get("worker_port")?;
    Ok(SessionRow {
        id: row.get("id")?,
        content_session_id: row.get("content_session_id")?,
        memory_session_id: row.get("memory_session_id")?,
        project: row.get("project")?,
        user_prompt: row.get("user_prompt")?,
        custom_title: row.get("custom_title")?,
        started_at_epoch: row.get("started_at_epoch")?,
        completed_at_epoch: row.get("completed_at_epoch")?,
        status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Active),
        worker_port: worker_port.map(|p| p as u16),
        prompt_counter: row.get("prompt_counter")?,
    })
}

const SESSION_COLUMNS: &str = "id, content_session_id, memory_session_id, project, user_prompt, \
     custom_title, started_at_epoch, completed_at_epoch, status, worker_port, prompt_counter";

impl Store {
    /// Get-or-create the session for `content_session_id`.
    ///
    /// Idempotent: a second call returns the existing row id. An existing
    /// row only has its empty project or null title backfilled, never
    /// overwritten.
    pub fn create_session(
        &self,
        content_session_id: &str,
        project: &str,
        user_prompt: Option<&str>,
        custom_title: Option<&str>,
        worker_port: Option<u16>,
    ) -> anyhow::Result<i64> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM sdk_sessions WHERE content_session_id=?1",
                [content_session_id],
                |r| r.get(0),
            )
            .optional()?;

        let id = match existing {
            Some(id) => {
                tx.execute(
                    "UPDATE sdk_sessions SET
                         project = CASE WHEN project='' THEN ?2 ELSE project END,
                         custom_title = COALESCE(custom_title, ?3),
                         user_prompt = COALESCE(user_prompt, ?4)
                     WHERE id=?1",
                    params![id, project, custom_title, user_prompt],
                )?;
                id
            }
            None => {
                tx.execute(
                    "INSERT INTO sdk_sessions
                         (content_session_id, project, user_prompt, custom_title,
                          started_at_epoch, status, worker_port)
                     VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6)",
                    params![
                        content_session_id,
                        project,
                        user_prompt,
                        custom_title,
                        now_epoch_ms(),
                        worker_port.map(|p| p as i64),
                    ],
                )?;
                tx.last_insert_rowid()
            }
        };

        tx.commit()?;
        Ok(id)
    }

    /// Record the memory agent's own provider-side session id.
    ///
    /// The FK cascade rewrites any children already keyed to a previous
    /// memory id in the same statement's transaction. Mixing the two id
    /// spaces would inject memory turns into the user's transcript, so an
    /// id equal to the session's content id is rejected.
    pub fn register_memory_session_id(
        &self,
        session_db_id: i64,
        memory_session_id: &str,
    ) -> anyhow::Result<()> {
        let conn = self.conn()?;
        let content: String = conn.query_row(
            "SELECT content_session_id FROM sdk_sessions WHERE id=?1",
            [session_db_id],
            |r| r.get(0),
        )?;
        if content == memory_session_id {
            anyhow::bail!(
                "memory_session_id must differ from content_session_id ({})",
                memory_session_id
            );
        }
        let changed = conn.execute(
            "UPDATE sdk_sessions SET memory_session_id=?2 WHERE id=?1",
            params![session_db_id, memory_session_id],
        )?;
        if changed == 0 {
            anyhow::bail!("session {} not found", session_db_id);
        }
        Ok(())
    }

    pub fn get_session(&self, session_db_id: i64) -> anyhow::Result<Option<SessionRow>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sdk_sessions WHERE id=?1");
        Ok(conn
            .query_row(&sql, [session_db_id], session_from_row)
            .optional()?)
    }

    pub fn get_session_by_content_id(
        &self,
        content_session_id: &str,
    ) -> anyhow::Result<Option<SessionRow>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sdk_sessions WHERE content_session_id=?1");
        Ok(conn
            .query_row(&sql, [content_session_id], session_from_row)
            .optional()?)
    }

    /// Most recent sessions for a project, newest first.
    pub fn recent_sessions(&self, project: &str, limit: usize) -> anyhow::Result<Vec<SessionRow>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sdk_sessions WHERE project=?1
             ORDER BY started_at_epoch DESC LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![project, limit as i64], session_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Distinct non-empty project names, most recently active first.
    pub fn distinct_projects(&self) -> anyhow::Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT project FROM sdk_sessions WHERE project != ''
             GROUP BY project ORDER BY MAX(started_at_epoch) DESC",
        )?;
        let rows = stmt.query_map([], |r| r.get(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn set_session_status(
        &self,
        session_db_id: i64,
        status: SessionStatus,
    ) -> anyhow::Result<()> {
        let conn = self.conn()?;
        let completed_at = match status {
            SessionStatus::Active => None,
            _ => Some(now_epoch_ms()),
        };
        conn.execute(
            "UPDATE sdk_sessions SET status=?2, completed_at_epoch=COALESCE(?3, completed_at_epoch)
             WHERE id=?1",
            params![session_db_id, status.as_str(), completed_at],
        )?;
        Ok(())
    }

    /// Reserve and return the next prompt number for a session.
    pub fn next_prompt_number(&self, content_session_id: &str) -> anyhow::Result<i64> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE sdk_sessions SET prompt_counter = prompt_counter + 1
             WHERE content_session_id=?1",
            [content_session_id],
        )?;
        let n: i64 = tx.query_row(
            "SELECT prompt_counter FROM sdk_sessions WHERE content_session_id=?1",
            [content_session_id],
            |r| r.get(0),
        )?;
        tx.commit()?;
        Ok(n)
    }

    /// Append a numbered user prompt. Fails only on the
    /// `(content_session_id, prompt_number)` uniqueness violation.
    pub fn append_prompt(
        &self,
        content_session_id: &str,
        prompt_number: i64,
        text: &str,
    ) -> anyhow::Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO user_prompts (content_session_id, prompt_number, prompt_text, created_at_epoch)
             VALUES (?1, ?2, ?3, ?4)",
            params![content_session_id, prompt_number, text, now_epoch_ms()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Prompts for a session, in prompt order.
    #[allow(dead_code)] // Reserved for a per-session prompts endpoint
    pub fn prompts_for_session(
        &self,
        content_session_id: &str,
    ) -> anyhow::Result<Vec<UserPromptRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, content_session_id, prompt_number, prompt_text, created_at_epoch
             FROM user_prompts WHERE content_session_id=?1 ORDER BY prompt_number",
        )?;
        let rows = stmt.query_map([content_session_id], |row| {
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_session_is_idempotent_and_backfills() {
        let (_dir, store) = Store::open_temp();

        let a = store.create_session("c1", "", None, None, Some(4000)).unwrap();
        let b = store
            .create_session("c1", "demo", Some("hello"), Some("Title"), Some(4000))
            .unwrap();
        assert_eq!(a, b);

        let row = store.get_session(a).unwrap().unwrap();
        assert_eq!(row.project, "demo"); // backfilled from ''
        assert_eq!(row.custom_title.as_deref(), Some("Title"));
        assert_eq!(row.status, SessionStatus::Active);
    }

    #[test]
    fn existing_project_is_not_overwritten() {
        let (_dir, store) = Store::open_temp();
        let id = store.create_session("c1", "orig", None, None, None).unwrap();
        store.create_session("c1", "other", None, None, None).unwrap();
        assert_eq!(store.get_session(id).unwrap().unwrap().project, "orig");
    }

    #[test]
    fn memory_id_must_differ_from_content_id() {
        let (_dir, store) = Store::open_temp();
        let id = store.create_session("c1", "demo", None, None, None).unwrap();
        assert!(store.register_memory_session_id(id, "c1").is_err());
        store.register_memory_session_id(id, "m1").unwrap();
        let row = store.get_session(id).unwrap().unwrap();
        assert_eq!(row.memory_session_id.as_deref(), Some("m1"));
    }

    #[test]
    fn prompt_numbers_are_unique_per_session() {
        let (_dir, store) = Store::open_temp();
        store.create_session("c1", "demo", None, None, None).unwrap();

        let n1 = store.next_prompt_number("c1").unwrap();
        let n2 = store.next_prompt_number("c1").unwrap();
        assert_eq!((n1, n2), (1, 2));

        store.append_prompt("c1", n1, "first").unwrap();
        assert!(store.append_prompt("c1", n1, "dup").is_err());
        store.append_prompt("c1", n2, "second").unwrap();

        let prompts = store.prompts_for_session("c1").unwrap();
        assert_eq!(prompts.len(), 2);
        assert_eq!(prompts[0].prompt_text, "first");
    }

    #[test]
    fn status_transition_records_completion_time() {
        let (_dir, store) = Store::open_temp();
        let id = store.create_session("c1", "demo", None, None, None).unwrap();
        store.set_session_status(id, SessionStatus::Completed).unwrap();
        let row = store.get_session(id).unwrap().unwrap();
        assert_eq!(row.status, SessionStatus::Completed);
        assert!(row.completed_at_epoch.is_some());
    }
}
