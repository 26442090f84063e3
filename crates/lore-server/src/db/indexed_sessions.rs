// crates/lore-server/src/db/indexed_sessions.rs
// Snapshots of parsed JSONL session files, keyed by the
// workstation:project:session composite and searchable by content.

use lore_types::IndexedSession;
use rusqlite::{params, Connection};

use super::{log_and_discard, now_ms};

const INDEXED_COLUMNS: &str = "id, workstation_id, project_id, session_id, exchange_count, \
                               tool_call_count, file_mtime, content, indexed_at_epoch";

pub fn parse_indexed_session_row(row: &rusqlite::Row) -> rusqlite::Result<IndexedSession> {
    Ok(IndexedSession {
        id: row.get(0)?,
        workstation_id: row.get(1)?,
        project_id: row.get(2)?,
        session_id: row.get(3)?,
        exchange_count: row.get(4)?,
        tool_call_count: row.get(5)?,
        file_mtime: row.get(6)?,
        content: row.get(7)?,
        indexed_at_epoch: row.get(8)?,
    })
}

/// A parsed session ready for indexing.
#[derive(Debug, Clone)]
pub struct IndexedSessionInsert {
    pub workstation_id: String,
    pub project_id: String,
    pub session_id: String,
    pub exchange_count: i64,
    pub tool_call_count: i64,
    pub file_mtime: Option<i64>,
    pub content: String,
}

/// Upsert the snapshot for a composite key, refreshing counts, content, and
/// the source file mtime. Returns the row id.
pub fn upsert_indexed_session_sync(
    conn: &Connection,
    insert: &IndexedSessionInsert,
) -> rusqlite::Result<i64> {
    conn.query_row(
        "INSERT INTO indexed_sessions
            (workstation_id, project_id, session_id, exchange_count, tool_call_count,
             file_mtime, content, indexed_at_epoch)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(workstation_id, project_id, session_id) DO UPDATE SET
             exchange_count = excluded.exchange_count,
             tool_call_count = excluded.tool_call_count,
             file_mtime = excluded.file_mtime,
             content = excluded.content,
             indexed_at_epoch = excluded.indexed_at_epoch
         RETURNING id",
        params![
            insert.workstation_id,
            insert.project_id,
            insert.session_id,
            insert.exchange_count,
            insert.tool_call_count,
            insert.file_mtime,
            insert.content,
            now_ms(),
        ],
        |row| row.get(0),
    )
}

/// Fetch one snapshot by composite key. None when missing.
pub fn get_indexed_session_sync(
    conn: &Connection,
    workstation_id: &str,
    project_id: &str,
    session_id: &str,
) -> rusqlite::Result<Option<IndexedSession>> {
    match conn.query_row(
        &format!(
            "SELECT {INDEXED_COLUMNS} FROM indexed_sessions
             WHERE workstation_id = ?1 AND project_id = ?2 AND session_id = ?3"
        ),
        params![workstation_id, project_id, session_id],
        parse_indexed_session_row,
    ) {
        Ok(s) => Ok(Some(s)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Stored file mtime for a composite key, used to skip unchanged files.
pub fn indexed_session_mtime_sync(
    conn: &Connection,
    workstation_id: &str,
    project_id: &str,
    session_id: &str,
) -> Option<i64> {
    conn.query_row(
        "SELECT file_mtime FROM indexed_sessions
         WHERE workstation_id = ?1 AND project_id = ?2 AND session_id = ?3",
        params![workstation_id, project_id, session_id],
        |row| row.get(0),
    )
    .ok()
    .flatten()
}

/// Full-text search over indexed session content, optionally scoped to one
/// project id.
pub fn search_indexed_sessions_sync(
    conn: &Connection,
    query: &str,
    project_id: Option<&str>,
    limit: usize,
) -> rusqlite::Result<Vec<IndexedSession>> {
    let fts_query = query
        .split_whitespace()
        .map(|word| format!("\"{}\"", word.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ");
    if fts_query.is_empty() {
        return Ok(Vec::new());
    }

    let qualified = INDEXED_COLUMNS
        .split(", ")
        .map(|c| format!("s.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ");
    let result = conn
        .prepare(&format!(
            "SELECT {qualified} FROM indexed_sessions_fts f
             JOIN indexed_sessions s ON s.id = f.rowid
             WHERE indexed_sessions_fts MATCH ?1
               AND (?2 IS NULL OR s.project_id = ?2)
             ORDER BY bm25(indexed_sessions_fts) ASC
             LIMIT ?3",
        ))
        .and_then(|mut stmt| {
            stmt.query_map(
                params![fts_query, project_id, limit as i64],
                parse_indexed_session_row,
            )
            .map(|rows| rows.filter_map(log_and_discard).collect::<Vec<_>>())
        });
    match result {
        Ok(rows) => Ok(rows),
        Err(e) => {
            tracing::debug!("indexed session FTS search failed: {}", e);
            Ok(Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::setup_test_connection;

    fn sample(session: &str, content: &str) -> IndexedSessionInsert {
        IndexedSessionInsert {
            workstation_id: "aabbccdd".to_string(),
            project_id: "11223344".to_string(),
            session_id: session.to_string(),
            exchange_count: 3,
            tool_call_count: 7,
            file_mtime: Some(1_000),
            content: content.to_string(),
        }
    }

    #[test]
    fn upsert_refreshes_in_place() {
        let conn = setup_test_connection();
        let id1 = upsert_indexed_session_sync(&conn, &sample("s1", "first pass")).unwrap();

        let mut updated = sample("s1", "second pass with more text");
        updated.exchange_count = 5;
        updated.file_mtime = Some(2_000);
        let id2 = upsert_indexed_session_sync(&conn, &updated).unwrap();
        assert_eq!(id1, id2);

        let row = get_indexed_session_sync(&conn, "aabbccdd", "11223344", "s1")
            .unwrap()
            .unwrap();
        assert_eq!(row.exchange_count, 5);
        assert_eq!(row.content, "second pass with more text");
        assert_eq!(
            indexed_session_mtime_sync(&conn, "aabbccdd", "11223344", "s1"),
            Some(2_000)
        );
    }

    #[test]
    fn composite_key_isolates_workstations() {
        let conn = setup_test_connection();
        upsert_indexed_session_sync(&conn, &sample("s1", "machine one")).unwrap();
        let mut other = sample("s1", "machine two");
        other.workstation_id = "eeff0011".to_string();
        upsert_indexed_session_sync(&conn, &other).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM indexed_sessions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn content_search_scopes_by_project() {
        let conn = setup_test_connection();
        upsert_indexed_session_sync(&conn, &sample("s1", "refactored the websocket relay"))
            .unwrap();
        let mut other = sample("s2", "websocket handshake notes");
        other.project_id = "99999999".to_string();
        upsert_indexed_session_sync(&conn, &other).unwrap();

        let all = search_indexed_sessions_sync(&conn, "websocket", None, 10).unwrap();
        assert_eq!(all.len(), 2);

        let scoped =
            search_indexed_sessions_sync(&conn, "websocket", Some("11223344"), 10).unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].session_id, "s1");
    }
}
