// crates/lore-server/src/db/summaries.rs
// Session summaries: six parsed text fields with full-text search.

use lore_types::{SessionSummary, SummaryFields};
use rusqlite::{params, Connection};

use super::{log_and_discard, now_ms};

const SUMMARY_COLUMNS: &str =
    "id, session_id, project, request, investigated, learned, completed, next_steps, notes, \
     created_at_epoch";

pub fn parse_summary_row(row: &rusqlite::Row) -> rusqlite::Result<SessionSummary> {
    Ok(SessionSummary {
        id: row.get(0)?,
        session_id: row.get(1)?,
        project: row.get(2)?,
        fields: SummaryFields {
            request: row.get(3)?,
            investigated: row.get(4)?,
            learned: row.get(5)?,
            completed: row.get(6)?,
            next_steps: row.get(7)?,
            notes: row.get(8)?,
        },
        created_at_epoch: row.get(9)?,
    })
}

/// Store one summary for a session. Returns the assigned id.
pub fn store_summary_sync(
    conn: &Connection,
    session_id: i64,
    project: &str,
    fields: &SummaryFields,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO session_summaries
            (session_id, project, request, investigated, learned, completed, next_steps, notes,
             created_at_epoch)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            session_id,
            project,
            fields.request,
            fields.investigated,
            fields.learned,
            fields.completed,
            fields.next_steps,
            fields.notes,
            now_ms(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Summaries for one session, newest first.
pub fn get_summaries_for_session_sync(
    conn: &Connection,
    session_id: i64,
) -> rusqlite::Result<Vec<SessionSummary>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SUMMARY_COLUMNS} FROM session_summaries
         WHERE session_id = ?1
         ORDER BY created_at_epoch DESC"
    ))?;
    let rows = stmt
        .query_map([session_id], parse_summary_row)?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

/// Recent summaries for a project, newest first.
pub fn get_recent_summaries_sync(
    conn: &Connection,
    project: &str,
    limit: usize,
) -> rusqlite::Result<Vec<SessionSummary>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SUMMARY_COLUMNS} FROM session_summaries
         WHERE project = ?1
         ORDER BY created_at_epoch DESC
         LIMIT ?2"
    ))?;
    let rows = stmt
        .query_map(params![project, limit as i64], parse_summary_row)?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

/// Full-text search over the six summary fields, project-scoped.
pub fn search_summaries_sync(
    conn: &Connection,
    query: &str,
    project: &str,
    limit: usize,
) -> rusqlite::Result<Vec<SessionSummary>> {
    let fts_query = query
        .split_whitespace()
        .map(|word| format!("\"{}\"", word.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ");
    if fts_query.is_empty() {
        return Ok(Vec::new());
    }

    let qualified = SUMMARY_COLUMNS
        .split(", ")
        .map(|c| format!("s.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ");
    let result = conn
        .prepare(&format!(
            "SELECT {qualified} FROM session_summaries_fts f
             JOIN session_summaries s ON s.id = f.rowid
             WHERE session_summaries_fts MATCH ?1 AND s.project = ?2
             ORDER BY bm25(session_summaries_fts) ASC
             LIMIT ?3"
        ))
        .and_then(|mut stmt| {
            stmt.query_map(params![fts_query, project, limit as i64], parse_summary_row)
                .map(|rows| rows.filter_map(log_and_discard).collect::<Vec<_>>())
        });
    match result {
        Ok(rows) => Ok(rows),
        Err(e) => {
            tracing::debug!("summary FTS search failed: {}", e);
            Ok(Vec::new())
        }
    }
}
