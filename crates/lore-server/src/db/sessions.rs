// crates/lore-server/src/db/sessions.rs
// Session registry: idempotent creation and the monotonic prompt counter

use lore_types::{Session, SessionStatus};
use rusqlite::{params, Connection};
use std::str::FromStr;

use super::now_ms;

/// Parse a Session from the standard column order:
/// (id, external_session_id, project, status, started_at_epoch,
///  completed_at_epoch, prompt_counter, initial_prompt)
pub fn parse_session_row(row: &rusqlite::Row) -> rusqlite::Result<Session> {
    let status_str: String = row.get(3)?;
    Ok(Session {
        id: row.get(0)?,
        external_session_id: row.get(1)?,
        project: row.get(2)?,
        status: SessionStatus::from_str(&status_str).unwrap_or(SessionStatus::Active),
        started_at_epoch: row.get(4)?,
        completed_at_epoch: row.get(5)?,
        prompt_counter: row.get(6)?,
        initial_prompt: row.get(7)?,
    })
}

const SESSION_COLUMNS: &str = "id, external_session_id, project, status, started_at_epoch, \
                               completed_at_epoch, prompt_counter, initial_prompt";

/// Ensure a session row exists for the external id, returning its surrogate
/// id. Idempotent: a second call with the same id updates the project only
/// when the new value is non-empty.
pub fn ensure_session_sync(
    conn: &Connection,
    external_session_id: &str,
    project: &str,
) -> rusqlite::Result<i64> {
    conn.query_row(
        "INSERT INTO sdk_sessions (external_session_id, project, status, started_at_epoch)
         VALUES (?1, ?2, 'active', ?3)
         ON CONFLICT(external_session_id) DO UPDATE SET
             project = CASE WHEN excluded.project != '' THEN excluded.project
                            ELSE sdk_sessions.project END
         RETURNING id",
        params![external_session_id, project, now_ms()],
        |row| row.get(0),
    )
}

/// Create (or revisit) a session with an optional initial user prompt.
/// On conflict only the non-empty fields are updated; the existing row is
/// returned either way.
pub fn create_session_sync(
    conn: &Connection,
    external_session_id: &str,
    project: &str,
    initial_prompt: Option<&str>,
) -> rusqlite::Result<Session> {
    conn.query_row(
        &format!(
            "INSERT INTO sdk_sessions
                (external_session_id, project, status, started_at_epoch, initial_prompt)
             VALUES (?1, ?2, 'active', ?3, ?4)
             ON CONFLICT(external_session_id) DO UPDATE SET
                 project = CASE WHEN excluded.project != '' THEN excluded.project
                                ELSE sdk_sessions.project END,
                 initial_prompt = COALESCE(NULLIF(excluded.initial_prompt, ''),
                                           sdk_sessions.initial_prompt)
             RETURNING {SESSION_COLUMNS}"
        ),
        params![external_session_id, project, now_ms(), initial_prompt],
        parse_session_row,
    )
}

/// Look up a session by external id. None when missing.
pub fn get_session_sync(
    conn: &Connection,
    external_session_id: &str,
) -> rusqlite::Result<Option<Session>> {
    match conn.query_row(
        &format!("SELECT {SESSION_COLUMNS} FROM sdk_sessions WHERE external_session_id = ?1"),
        [external_session_id],
        parse_session_row,
    ) {
        Ok(s) => Ok(Some(s)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Atomically increment the prompt counter and return the post-increment
/// value. None when the session does not exist.
///
/// Primary path is a single UPDATE .. RETURNING statement; databases without
/// RETURNING support fall back to update-then-select inside one transaction.
pub fn increment_prompt_counter_sync(
    conn: &Connection,
    session_id: i64,
) -> rusqlite::Result<Option<i64>> {
    match conn.query_row(
        "UPDATE sdk_sessions SET prompt_counter = prompt_counter + 1
         WHERE id = ?1
         RETURNING prompt_counter",
        [session_id],
        |row| row.get(0),
    ) {
        Ok(v) => Ok(Some(v)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) if error_mentions_returning(&e) => {
            increment_prompt_counter_fallback(conn, session_id)
        }
        Err(e) => Err(e),
    }
}

fn error_mentions_returning(err: &rusqlite::Error) -> bool {
    err.to_string().contains("RETURNING")
}

fn increment_prompt_counter_fallback(
    conn: &Connection,
    session_id: i64,
) -> rusqlite::Result<Option<i64>> {
    let tx = conn.unchecked_transaction()?;
    let updated = tx.execute(
        "UPDATE sdk_sessions SET prompt_counter = prompt_counter + 1 WHERE id = ?1",
        [session_id],
    )?;
    if updated == 0 {
        tx.commit()?;
        return Ok(None);
    }
    let value: i64 = tx.query_row(
        "SELECT prompt_counter FROM sdk_sessions WHERE id = ?1",
        [session_id],
        |row| row.get(0),
    )?;
    tx.commit()?;
    Ok(Some(value))
}

/// Mark a session completed or failed, stamping completed_at_epoch.
/// Returns false when the session does not exist.
pub fn close_session_sync(
    conn: &Connection,
    external_session_id: &str,
    status: SessionStatus,
) -> rusqlite::Result<bool> {
    let updated = conn.execute(
        "UPDATE sdk_sessions SET status = ?1, completed_at_epoch = ?2
         WHERE external_session_id = ?3",
        params![status.as_str(), now_ms(), external_session_id],
    )?;
    Ok(updated > 0)
}
