// crates/lore-server/src/db/prompts.rs
// User prompts, unique per (session, prompt number), with a global cap
// enforced asynchronously by the retention worker.

use lore_types::UserPrompt;
use rusqlite::{params, Connection};

use super::{log_and_discard, now_ms};

const PROMPT_COLUMNS: &str =
    "id, session_external_id, prompt_number, prompt_text, matched_observations, created_at_epoch";

pub fn parse_prompt_row(row: &rusqlite::Row) -> rusqlite::Result<UserPrompt> {
    let matched: String = row.get(4)?;
    Ok(UserPrompt {
        id: row.get(0)?,
        session_external_id: row.get(1)?,
        prompt_number: row.get(2)?,
        prompt_text: row.get(3)?,
        matched_observations: serde_json::from_str(&matched).unwrap_or_default(),
        created_at_epoch: row.get(5)?,
    })
}

/// Save a prompt. Returns (id, created): re-inserting a duplicate
/// (session, prompt_number) returns the existing id with created = false,
/// and callers must not trigger cap cleanup for duplicates.
pub fn save_prompt_sync(
    conn: &Connection,
    session_external_id: &str,
    prompt_number: i64,
    prompt_text: &str,
    matched_observations: &[i64],
) -> rusqlite::Result<(i64, bool)> {
    let inserted = conn.execute(
        "INSERT INTO user_prompts
            (session_external_id, prompt_number, prompt_text, matched_observations, created_at_epoch)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(session_external_id, prompt_number) DO NOTHING",
        params![
            session_external_id,
            prompt_number,
            prompt_text,
            serde_json::to_string(matched_observations).unwrap_or_else(|_| "[]".into()),
            now_ms(),
        ],
    )?;
    if inserted > 0 {
        return Ok((conn.last_insert_rowid(), true));
    }
    let id = conn.query_row(
        "SELECT id FROM user_prompts WHERE session_external_id = ?1 AND prompt_number = ?2",
        params![session_external_id, prompt_number],
        |row| row.get(0),
    )?;
    Ok((id, false))
}

/// Fetch one prompt. None when missing.
pub fn get_prompt_sync(
    conn: &Connection,
    session_external_id: &str,
    prompt_number: i64,
) -> rusqlite::Result<Option<UserPrompt>> {
    match conn.query_row(
        &format!(
            "SELECT {PROMPT_COLUMNS} FROM user_prompts
             WHERE session_external_id = ?1 AND prompt_number = ?2"
        ),
        params![session_external_id, prompt_number],
        parse_prompt_row,
    ) {
        Ok(p) => Ok(Some(p)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Prompts of one session in prompt-number order.
pub fn get_prompts_for_session_sync(
    conn: &Connection,
    session_external_id: &str,
) -> rusqlite::Result<Vec<UserPrompt>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PROMPT_COLUMNS} FROM user_prompts
         WHERE session_external_id = ?1
         ORDER BY prompt_number ASC"
    ))?;
    let rows = stmt
        .query_map([session_external_id], parse_prompt_row)?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

/// Full-text search over prompt text.
pub fn search_prompts_sync(
    conn: &Connection,
    query: &str,
    limit: usize,
) -> rusqlite::Result<Vec<UserPrompt>> {
    let fts_query = query
        .split_whitespace()
        .map(|word| format!("\"{}\"", word.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ");
    if fts_query.is_empty() {
        return Ok(Vec::new());
    }

    let qualified = PROMPT_COLUMNS
        .split(", ")
        .map(|c| format!("p.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ");
    let result = conn
        .prepare(&format!(
            "SELECT {qualified} FROM user_prompts_fts f
             JOIN user_prompts p ON p.id = f.rowid
             WHERE user_prompts_fts MATCH ?1
             ORDER BY bm25(user_prompts_fts) ASC
             LIMIT ?2"
        ))
        .and_then(|mut stmt| {
            stmt.query_map(params![fts_query, limit as i64], parse_prompt_row)
                .map(|rows| rows.filter_map(log_and_discard).collect::<Vec<_>>())
        });
    match result {
        Ok(rows) => Ok(rows),
        Err(e) => {
            tracing::debug!("prompt FTS search failed: {}", e);
            Ok(Vec::new())
        }
    }
}

/// Total stored prompts (cap invariant probe).
pub fn count_prompts_sync(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM user_prompts", [], |row| row.get(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::setup_test_connection;

    #[test]
    fn save_is_idempotent_per_session_and_number() {
        let conn = setup_test_connection();

        let (id1, created1) = save_prompt_sync(&conn, "claude-1", 1, "fix the bug", &[4, 7]).unwrap();
        assert!(created1);

        let (id2, created2) =
            save_prompt_sync(&conn, "claude-1", 1, "different text", &[]).unwrap();
        assert_eq!(id1, id2);
        assert!(!created2, "duplicate must not report a fresh insert");

        // Original text is kept
        let prompt = get_prompt_sync(&conn, "claude-1", 1).unwrap().unwrap();
        assert_eq!(prompt.prompt_text, "fix the bug");
        assert_eq!(prompt.matched_observations, vec![4, 7]);

        // Same number in another session is a separate row
        let (id3, created3) = save_prompt_sync(&conn, "claude-2", 1, "other", &[]).unwrap();
        assert_ne!(id1, id3);
        assert!(created3);
        assert_eq!(count_prompts_sync(&conn).unwrap(), 2);
    }

    #[test]
    fn session_listing_is_ordered_by_number() {
        let conn = setup_test_connection();
        save_prompt_sync(&conn, "claude-1", 3, "third", &[]).unwrap();
        save_prompt_sync(&conn, "claude-1", 1, "first", &[]).unwrap();
        save_prompt_sync(&conn, "claude-1", 2, "second", &[]).unwrap();

        let prompts = get_prompts_for_session_sync(&conn, "claude-1").unwrap();
        let numbers: Vec<i64> = prompts.iter().map(|p| p.prompt_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn fts_search_over_prompt_text() {
        let conn = setup_test_connection();
        save_prompt_sync(&conn, "claude-1", 1, "investigate flaky websocket test", &[]).unwrap();
        save_prompt_sync(&conn, "claude-1", 2, "rename the config module", &[]).unwrap();

        let hits = search_prompts_sync(&conn, "websocket", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].prompt_number, 1);
    }
}
