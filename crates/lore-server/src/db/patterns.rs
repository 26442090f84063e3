// crates/lore-server/src/db/patterns.rs
// Pattern store: persisted recurring signatures with FTS search, stats, and
// merge. The in-memory candidate pool lives in the detector module.

use std::collections::HashMap;
use std::str::FromStr;

use lore_types::{Pattern, PatternStats, PatternStatus, PatternType};
use rusqlite::{params, Connection};

use super::{log_and_discard, now_ms};

const PATTERN_COLUMNS: &str = "id, name, pattern_type, description, recommendation, signature, \
     frequency, projects, observation_ids, status, merged_into_id, confidence, \
     last_seen_at_epoch, created_at_epoch";

pub fn parse_pattern_row(row: &rusqlite::Row) -> rusqlite::Result<Pattern> {
    let pattern_type: String = row.get(2)?;
    let signature: String = row.get(5)?;
    let projects: String = row.get(7)?;
    let observation_ids: String = row.get(8)?;
    let status: String = row.get(9)?;
    Ok(Pattern {
        id: row.get(0)?,
        name: row.get(1)?,
        pattern_type: PatternType::from_str(&pattern_type).unwrap_or(PatternType::Architecture),
        description: row.get(3)?,
        recommendation: row.get(4)?,
        signature: serde_json::from_str(&signature).unwrap_or_default(),
        frequency: row.get(6)?,
        projects: serde_json::from_str(&projects).unwrap_or_default(),
        observation_ids: serde_json::from_str(&observation_ids).unwrap_or_default(),
        status: PatternStatus::from_str(&status).unwrap_or(PatternStatus::Active),
        merged_into_id: row.get(10)?,
        confidence: row.get(11)?,
        last_seen_at_epoch: row.get(12)?,
        created_at_epoch: row.get(13)?,
    })
}

/// A pattern ready for insertion (promotion from a candidate).
#[derive(Debug, Clone)]
pub struct PatternInsert {
    pub name: String,
    pub pattern_type: PatternType,
    pub description: Option<String>,
    pub recommendation: Option<String>,
    pub signature: Vec<String>,
    pub projects: Vec<String>,
    pub observation_ids: Vec<i64>,
    pub confidence: f64,
}

/// Insert a new active pattern; frequency starts at the number of backing
/// observations. Returns the stored row.
pub fn insert_pattern_sync(conn: &Connection, insert: &PatternInsert) -> rusqlite::Result<Pattern> {
    let now = now_ms();
    conn.query_row(
        &format!(
            "INSERT INTO patterns
                (name, pattern_type, description, recommendation, signature, frequency,
                 projects, observation_ids, status, confidence, last_seen_at_epoch, created_at_epoch)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'active', ?9, ?10, ?10)
             RETURNING {PATTERN_COLUMNS}"
        ),
        params![
            insert.name,
            insert.pattern_type.as_str(),
            insert.description,
            insert.recommendation,
            serde_json::to_string(&insert.signature).unwrap_or_else(|_| "[]".into()),
            insert.observation_ids.len() as i64,
            serde_json::to_string(&insert.projects).unwrap_or_else(|_| "[]".into()),
            serde_json::to_string(&insert.observation_ids).unwrap_or_else(|_| "[]".into()),
            insert.confidence.clamp(0.0, 1.0),
            now,
        ],
        parse_pattern_row,
    )
}

/// Get one pattern. None when missing.
pub fn get_pattern_sync(conn: &Connection, id: i64) -> rusqlite::Result<Option<Pattern>> {
    match conn.query_row(
        &format!("SELECT {PATTERN_COLUMNS} FROM patterns WHERE id = ?1"),
        [id],
        parse_pattern_row,
    ) {
        Ok(p) => Ok(Some(p)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Write back a pattern's mutable columns. False when missing.
pub fn update_pattern_sync(conn: &Connection, pattern: &Pattern) -> rusqlite::Result<bool> {
    let updated = conn.execute(
        "UPDATE patterns SET
            name = ?1, pattern_type = ?2, description = ?3, recommendation = ?4,
            signature = ?5, frequency = ?6, projects = ?7, observation_ids = ?8,
            status = ?9, merged_into_id = ?10, confidence = ?11, last_seen_at_epoch = ?12
         WHERE id = ?13",
        params![
            pattern.name,
            pattern.pattern_type.as_str(),
            pattern.description,
            pattern.recommendation,
            serde_json::to_string(&pattern.signature).unwrap_or_else(|_| "[]".into()),
            pattern.frequency,
            serde_json::to_string(&pattern.projects).unwrap_or_else(|_| "[]".into()),
            serde_json::to_string(&pattern.observation_ids).unwrap_or_else(|_| "[]".into()),
            pattern.status.as_str(),
            pattern.merged_into_id,
            pattern.confidence.clamp(0.0, 1.0),
            pattern.last_seen_at_epoch,
            pattern.id,
        ],
    )?;
    Ok(updated > 0)
}

/// Active patterns, most recently seen first.
pub fn get_active_patterns_sync(conn: &Connection, limit: usize) -> rusqlite::Result<Vec<Pattern>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PATTERN_COLUMNS} FROM patterns
         WHERE status = 'active'
         ORDER BY last_seen_at_epoch DESC
         LIMIT ?1"
    ))?;
    let rows = stmt
        .query_map([limit as i64], parse_pattern_row)?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

/// Patterns whose project set contains the given project (JSON-contains
/// predicate over the stored array).
pub fn get_patterns_by_project_sync(
    conn: &Connection,
    project: &str,
    limit: usize,
) -> rusqlite::Result<Vec<Pattern>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PATTERN_COLUMNS} FROM patterns
         WHERE status = 'active'
           AND EXISTS (SELECT 1 FROM json_each(patterns.projects) WHERE json_each.value = ?1)
         ORDER BY frequency DESC, confidence DESC
         LIMIT ?2"
    ))?;
    let rows = stmt
        .query_map(params![project, limit as i64], parse_pattern_row)?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

/// Active patterns of one type.
pub fn get_patterns_by_type_sync(
    conn: &Connection,
    pattern_type: PatternType,
    limit: usize,
) -> rusqlite::Result<Vec<Pattern>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PATTERN_COLUMNS} FROM patterns
         WHERE status = 'active' AND pattern_type = ?1
         ORDER BY frequency DESC, confidence DESC
         LIMIT ?2"
    ))?;
    let rows = stmt
        .query_map(params![pattern_type.as_str(), limit as i64], parse_pattern_row)?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

/// Active pattern by exact name. None when missing or not active.
pub fn get_pattern_by_name_sync(
    conn: &Connection,
    name: &str,
) -> rusqlite::Result<Option<Pattern>> {
    match conn.query_row(
        &format!(
            "SELECT {PATTERN_COLUMNS} FROM patterns
             WHERE status = 'active' AND name = ?1
             LIMIT 1"
        ),
        [name],
        parse_pattern_row,
    ) {
        Ok(p) => Ok(Some(p)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Full-text search over name/description/recommendation.
pub fn search_patterns_fts_sync(
    conn: &Connection,
    query: &str,
    limit: usize,
) -> rusqlite::Result<Vec<Pattern>> {
    let fts_query = query
        .split_whitespace()
        .map(|word| format!("\"{}\"", word.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ");
    if fts_query.is_empty() {
        return Ok(Vec::new());
    }

    let qualified = PATTERN_COLUMNS
        .split(", ")
        .map(|c| format!("p.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ");
    let result = conn
        .prepare(&format!(
            "SELECT {qualified} FROM patterns_fts f
             JOIN patterns p ON p.id = f.rowid
             WHERE patterns_fts MATCH ?1 AND p.status = 'active'
             ORDER BY bm25(patterns_fts) ASC
             LIMIT ?2"
        ))
        .and_then(|mut stmt| {
            stmt.query_map(params![fts_query, limit as i64], parse_pattern_row)
                .map(|rows| rows.filter_map(log_and_discard).collect::<Vec<_>>())
        });
    match result {
        Ok(rows) => Ok(rows),
        Err(e) => {
            tracing::debug!("pattern FTS search failed: {}", e);
            Ok(Vec::new())
        }
    }
}

/// Hard-delete a pattern. False when missing.
pub fn delete_pattern_sync(conn: &Connection, id: i64) -> rusqlite::Result<bool> {
    Ok(conn.execute("DELETE FROM patterns WHERE id = ?1", [id])? > 0)
}

/// Totals by status and type, frequency sum, average confidence.
pub fn pattern_stats_sync(conn: &Connection) -> rusqlite::Result<PatternStats> {
    let (total, total_frequency, avg_confidence): (i64, i64, f64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(frequency), 0), COALESCE(AVG(confidence), 0.0)
         FROM patterns",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;

    let mut by_status: HashMap<String, i64> = HashMap::new();
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM patterns GROUP BY status")?;
    for row in stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .filter_map(log_and_discard)
    {
        by_status.insert(row.0, row.1);
    }

    let mut by_type: HashMap<String, i64> = HashMap::new();
    let mut stmt = conn.prepare("SELECT pattern_type, COUNT(*) FROM patterns GROUP BY pattern_type")?;
    for row in stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .filter_map(log_and_discard)
    {
        by_type.insert(row.0, row.1);
    }

    Ok(PatternStats {
        total,
        by_status,
        by_type,
        total_frequency,
        avg_confidence,
    })
}

/// Merge `source` into `target` in one transaction: frequencies sum,
/// projects and observation ids union, target keeps its identity, source is
/// marked merged with a pointer to the target. Returns the updated target
/// (None when either side is missing).
pub fn merge_patterns_sync(
    conn: &Connection,
    source_id: i64,
    target_id: i64,
) -> rusqlite::Result<Option<Pattern>> {
    let tx = conn.unchecked_transaction()?;

    let source = match get_pattern_in_tx(&tx, source_id)? {
        Some(p) => p,
        None => return Ok(None),
    };
    let mut target = match get_pattern_in_tx(&tx, target_id)? {
        Some(p) => p,
        None => return Ok(None),
    };

    target.frequency += source.frequency;
    for project in &source.projects {
        if !target.projects.contains(project) {
            target.projects.push(project.clone());
        }
    }
    for obs_id in &source.observation_ids {
        if !target.observation_ids.contains(obs_id) {
            target.observation_ids.push(*obs_id);
        }
    }
    target.last_seen_at_epoch = target.last_seen_at_epoch.max(source.last_seen_at_epoch);

    tx.execute(
        "UPDATE patterns SET frequency = ?1, projects = ?2, observation_ids = ?3,
                last_seen_at_epoch = ?4
         WHERE id = ?5",
        params![
            target.frequency,
            serde_json::to_string(&target.projects).unwrap_or_else(|_| "[]".into()),
            serde_json::to_string(&target.observation_ids).unwrap_or_else(|_| "[]".into()),
            target.last_seen_at_epoch,
            target.id,
        ],
    )?;
    tx.execute(
        "UPDATE patterns SET status = 'merged', merged_into_id = ?1 WHERE id = ?2",
        params![target_id, source_id],
    )?;

    tx.commit()?;
    Ok(Some(target))
}

fn get_pattern_in_tx(
    tx: &rusqlite::Transaction<'_>,
    id: i64,
) -> rusqlite::Result<Option<Pattern>> {
    match tx.query_row(
        &format!("SELECT {PATTERN_COLUMNS} FROM patterns WHERE id = ?1"),
        [id],
        parse_pattern_row,
    ) {
        Ok(p) => Ok(Some(p)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}
