// crates/lore-server/src/db/observations.rs
// Observation storage: inserts with scope derivation, patch updates, ordered
// reads, supersession/archival, and FTS search with a LIKE fallback.

use std::collections::HashMap;
use std::str::FromStr;

use lore_types::{Observation, ObservationDraft, ObservationPatch, ObservationType, OrderBy, Scope};
use rusqlite::{params, Connection, ToSql};

use super::{log_and_discard, now_ms};

/// Concepts that lift an observation to global scope on insert.
pub const GLOBAL_CONCEPTS: [&str; 6] = [
    "security",
    "best-practice",
    "gotcha",
    "anti-pattern",
    "performance",
    "portability",
];

/// Stop words dropped during keyword extraction. Everything of length <= 3
/// is dropped before this list applies, so only longer words appear here.
const STOP_WORDS: [&str; 18] = [
    "the", "this", "that", "with", "from", "have", "what", "when", "where", "which", "their",
    "will", "would", "about", "into", "them", "then", "they",
];

/// Maximum keywords used by the LIKE fallback (cost bound).
const LIKE_FALLBACK_KEYWORDS: usize = 2;

const OBS_COLUMNS: &str = "id, session_id, project, scope, obs_type, title, subtitle, narrative, \
     facts, concepts, files_read, files_modified, file_mtimes, prompt_number, created_at_epoch, \
     importance_score, user_feedback, retrieval_count, last_retrieved_at_epoch, \
     score_updated_at_epoch, is_superseded, is_archived, archived_at_epoch, archived_reason";

/// Predicate matching rows visible to a project: the project's own rows
/// (scope NULL or 'project') plus every global row.
const SCOPE_PREDICATE: &str =
    "((project = ?1 AND (scope IS NULL OR scope = 'project')) OR scope = 'global')";

fn parse_json_vec(text: &str) -> Vec<String> {
    serde_json::from_str(text).unwrap_or_default()
}

fn parse_json_map(text: &str) -> HashMap<String, i64> {
    serde_json::from_str(text).unwrap_or_default()
}

/// Parse an Observation from the standard OBS_COLUMNS order.
pub fn parse_observation_row(row: &rusqlite::Row) -> rusqlite::Result<Observation> {
    let scope: Option<String> = row.get(3)?;
    let obs_type: String = row.get(4)?;
    let facts: String = row.get(8)?;
    let concepts: String = row.get(9)?;
    let files_read: String = row.get(10)?;
    let files_modified: String = row.get(11)?;
    let file_mtimes: String = row.get(12)?;
    Ok(Observation {
        id: row.get(0)?,
        session_id: row.get(1)?,
        project: row.get(2)?,
        scope: scope.and_then(|s| Scope::from_str(&s).ok()),
        obs_type: ObservationType::from_str(&obs_type).unwrap_or(ObservationType::Discovery),
        title: row.get(5)?,
        subtitle: row.get(6)?,
        narrative: row.get(7)?,
        facts: parse_json_vec(&facts),
        concepts: parse_json_vec(&concepts),
        files_read: parse_json_vec(&files_read),
        files_modified: parse_json_vec(&files_modified),
        file_mtimes: parse_json_map(&file_mtimes),
        prompt_number: row.get(13)?,
        created_at_epoch: row.get(14)?,
        importance_score: row.get(15)?,
        user_feedback: row.get(16)?,
        retrieval_count: row.get(17)?,
        last_retrieved_at_epoch: row.get(18)?,
        score_updated_at_epoch: row.get(19)?,
        is_superseded: row.get::<_, i64>(20)? != 0,
        is_archived: row.get::<_, i64>(21)? != 0,
        archived_at_epoch: row.get(22)?,
        archived_reason: row.get(23)?,
    })
}

/// Derive scope per the insert rule: an explicit scope wins; otherwise any
/// global concept makes the observation global, else project-local.
pub fn derive_scope(explicit: Option<Scope>, concepts: &[String]) -> Scope {
    if let Some(scope) = explicit {
        return scope;
    }
    let global = concepts
        .iter()
        .any(|c| GLOBAL_CONCEPTS.contains(&c.to_lowercase().as_str()));
    if global {
        Scope::Global
    } else {
        Scope::Project
    }
}

/// Insert one observation, deriving scope when the draft has none.
/// Returns (assigned id, created_at_epoch).
pub fn insert_observation_sync(
    conn: &Connection,
    session_id: i64,
    project: &str,
    draft: &ObservationDraft,
    prompt_number: Option<i64>,
) -> rusqlite::Result<(i64, i64)> {
    let scope = derive_scope(draft.scope, &draft.concepts);
    let obs_type = draft.obs_type.unwrap_or(ObservationType::Discovery);
    let epoch = now_ms();
    conn.execute(
        "INSERT INTO observations
            (session_id, project, scope, obs_type, title, subtitle, narrative,
             facts, concepts, files_read, files_modified, file_mtimes,
             prompt_number, created_at_epoch)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            session_id,
            project,
            scope.as_str(),
            obs_type.as_str(),
            draft.title,
            draft.subtitle,
            draft.narrative,
            serde_json::to_string(&draft.facts).unwrap_or_else(|_| "[]".into()),
            serde_json::to_string(&draft.concepts).unwrap_or_else(|_| "[]".into()),
            serde_json::to_string(&draft.files_read).unwrap_or_else(|_| "[]".into()),
            serde_json::to_string(&draft.files_modified).unwrap_or_else(|_| "[]".into()),
            serde_json::to_string(&draft.file_mtimes).unwrap_or_else(|_| "{}".into()),
            prompt_number,
            epoch,
        ],
    )?;
    Ok((conn.last_insert_rowid(), epoch))
}

/// Get one observation. None when missing.
pub fn get_observation_sync(conn: &Connection, id: i64) -> rusqlite::Result<Option<Observation>> {
    match conn.query_row(
        &format!("SELECT {OBS_COLUMNS} FROM observations WHERE id = ?1"),
        [id],
        parse_observation_row,
    ) {
        Ok(obs) => Ok(Some(obs)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Apply a partial update. Absent fields are left untouched;
/// score_updated_at_epoch is stamped on any change. Returns false when the
/// observation does not exist. Callers validate the patch is non-empty.
pub fn update_observation_sync(
    conn: &Connection,
    id: i64,
    patch: &ObservationPatch,
) -> rusqlite::Result<bool> {
    let mut sets: Vec<&'static str> = Vec::new();
    let mut values: Vec<Box<dyn ToSql>> = Vec::new();

    if let Some(ref title) = patch.title {
        sets.push("title = ?");
        values.push(Box::new(title.clone()));
    }
    if let Some(ref subtitle) = patch.subtitle {
        sets.push("subtitle = ?");
        values.push(Box::new(subtitle.clone()));
    }
    if let Some(ref narrative) = patch.narrative {
        sets.push("narrative = ?");
        values.push(Box::new(narrative.clone()));
    }
    if let Some(ref facts) = patch.facts {
        sets.push("facts = ?");
        values.push(Box::new(
            serde_json::to_string(facts).unwrap_or_else(|_| "[]".into()),
        ));
    }
    if let Some(ref concepts) = patch.concepts {
        sets.push("concepts = ?");
        values.push(Box::new(
            serde_json::to_string(concepts).unwrap_or_else(|_| "[]".into()),
        ));
    }
    if let Some(scope) = patch.scope {
        sets.push("scope = ?");
        values.push(Box::new(scope.as_str()));
    }
    if let Some(score) = patch.importance_score {
        sets.push("importance_score = ?");
        values.push(Box::new(score));
    }
    if let Some(feedback) = patch.user_feedback {
        sets.push("user_feedback = ?");
        values.push(Box::new(feedback));
    }

    sets.push("score_updated_at_epoch = ?");
    values.push(Box::new(now_ms()));
    values.push(Box::new(id));

    let sql = format!(
        "UPDATE observations SET {} WHERE id = ?",
        sets.join(", ")
    );
    let refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
    let updated = conn.execute(&sql, refs.as_slice())?;
    Ok(updated > 0)
}

/// Recent observations visible to a project (own rows plus global),
/// importance first, recency as tiebreak.
pub fn get_recent_sync(
    conn: &Connection,
    project: &str,
    limit: usize,
) -> rusqlite::Result<Vec<Observation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {OBS_COLUMNS} FROM observations
         WHERE {SCOPE_PREDICATE}
         ORDER BY importance_score DESC, created_at_epoch DESC
         LIMIT ?2"
    ))?;
    let rows = stmt
        .query_map(params![project, limit as i64], parse_observation_row)?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

/// Like get_recent but excluding superseded and archived rows.
pub fn get_active_sync(
    conn: &Connection,
    project: &str,
    limit: usize,
) -> rusqlite::Result<Vec<Observation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {OBS_COLUMNS} FROM observations
         WHERE {SCOPE_PREDICATE} AND is_superseded = 0 AND is_archived = 0
         ORDER BY importance_score DESC, created_at_epoch DESC
         LIMIT ?2"
    ))?;
    let rows = stmt
        .query_map(params![project, limit as i64], parse_observation_row)?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

fn id_list(ids: &[i64]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Fetch a set of observations in the requested order.
pub fn get_by_ids_sync(
    conn: &Connection,
    ids: &[i64],
    order_by: OrderBy,
    limit: usize,
) -> rusqlite::Result<Vec<Observation>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let order = match order_by {
        OrderBy::DateAsc => "created_at_epoch ASC",
        OrderBy::DateDesc => "created_at_epoch DESC",
        OrderBy::Importance => "importance_score DESC, created_at_epoch DESC",
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT {OBS_COLUMNS} FROM observations
         WHERE id IN ({})
         ORDER BY {}
         LIMIT ?1",
        id_list(ids),
        order
    ))?;
    let rows = stmt
        .query_map([limit as i64], parse_observation_row)?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

/// Fetch observations in one query and return them aligned with the input
/// order; ids not found are skipped.
pub fn get_by_ids_preserve_order_sync(
    conn: &Connection,
    ids: &[i64],
) -> rusqlite::Result<Vec<Observation>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(&format!(
        "SELECT {OBS_COLUMNS} FROM observations WHERE id IN ({})",
        id_list(ids)
    ))?;
    let mut by_id: HashMap<i64, Observation> = stmt
        .query_map([], parse_observation_row)?
        .filter_map(log_and_discard)
        .map(|obs| (obs.id, obs))
        .collect();
    Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
}

/// The newest observations across all projects (detector analysis input).
pub fn get_latest_observations_sync(
    conn: &Connection,
    limit: usize,
) -> rusqlite::Result<Vec<Observation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {OBS_COLUMNS} FROM observations
         ORDER BY created_at_epoch DESC, id DESC
         LIMIT ?1"
    ))?;
    let rows = stmt
        .query_map([limit as i64], parse_observation_row)?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

/// One page of the full scan, ascending id with keyset pagination.
/// The consumer passes the last id seen (0 to start) and may stop early.
pub fn get_page_sync(
    conn: &Connection,
    after_id: i64,
    batch_size: usize,
) -> rusqlite::Result<Vec<Observation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {OBS_COLUMNS} FROM observations
         WHERE id > ?1
         ORDER BY id ASC
         LIMIT ?2"
    ))?;
    let rows = stmt
        .query_map(params![after_id, batch_size as i64], parse_observation_row)?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

/// Mark one observation superseded. Idempotent; false when missing.
pub fn mark_superseded_sync(conn: &Connection, id: i64) -> rusqlite::Result<bool> {
    let updated = conn.execute(
        "UPDATE observations SET is_superseded = 1 WHERE id = ?1",
        [id],
    )?;
    Ok(updated > 0)
}

/// Mark several observations superseded. Returns the number of rows touched.
pub fn mark_superseded_batch_sync(conn: &Connection, ids: &[i64]) -> rusqlite::Result<usize> {
    if ids.is_empty() {
        return Ok(0);
    }
    conn.execute(
        &format!(
            "UPDATE observations SET is_superseded = 1 WHERE id IN ({})",
            id_list(ids)
        ),
        [],
    )
}

/// Soft-delete an observation. Idempotent; false when missing.
pub fn archive_sync(conn: &Connection, id: i64, reason: &str) -> rusqlite::Result<bool> {
    let updated = conn.execute(
        "UPDATE observations SET is_archived = 1, archived_at_epoch = ?1, archived_reason = ?2
         WHERE id = ?3",
        params![now_ms(), reason, id],
    )?;
    Ok(updated > 0)
}

/// Archive every non-archived observation in a project older than the
/// cutoff. Select-then-update in a single transaction; returns archived ids.
pub fn archive_old_sync(
    conn: &Connection,
    project: &str,
    max_age_days: i64,
    reason: &str,
) -> rusqlite::Result<Vec<i64>> {
    let cutoff = now_ms() - max_age_days * 24 * 60 * 60 * 1000;
    let tx = conn.unchecked_transaction()?;

    let ids: Vec<i64> = {
        let mut stmt = tx.prepare(
            "SELECT id FROM observations
             WHERE project = ?1 AND is_archived = 0 AND created_at_epoch < ?2",
        )?;
        let rows = stmt
            .query_map(params![project, cutoff], |row| row.get(0))?
            .filter_map(log_and_discard)
            .collect();
        rows
    };

    if !ids.is_empty() {
        tx.execute(
            &format!(
                "UPDATE observations
                 SET is_archived = 1, archived_at_epoch = ?1, archived_reason = ?2
                 WHERE id IN ({})",
                id_list(&ids)
            ),
            params![now_ms(), reason],
        )?;
    }
    tx.commit()?;
    Ok(ids)
}

/// Restore an archived observation. Idempotent; false when missing.
pub fn unarchive_sync(conn: &Connection, id: i64) -> rusqlite::Result<bool> {
    let updated = conn.execute(
        "UPDATE observations
         SET is_archived = 0, archived_at_epoch = NULL, archived_reason = NULL
         WHERE id = ?1",
        [id],
    )?;
    Ok(updated > 0)
}

/// Hard-delete one observation plus its conflicts, relations, and vector
/// rows in a single transaction (the FTS row goes via trigger).
pub fn delete_observation_sync(conn: &Connection, id: i64) -> rusqlite::Result<bool> {
    let tx = conn.unchecked_transaction()?;
    super::conflicts::delete_conflicts_by_observation_sync(&tx, id)?;
    super::relations::delete_relations_by_observation_sync(&tx, id)?;
    tx.execute(
        "DELETE FROM vectors WHERE doc_type = 'observation' AND source_row_id = ?1",
        [id],
    )?;
    let deleted = tx.execute("DELETE FROM observations WHERE id = ?1", [id])?;
    tx.commit()?;
    Ok(deleted > 0)
}

// ============================================================================
// Keyword extraction & FTS search
// ============================================================================

/// Lowercase the query, split on whitespace, drop short tokens and stop
/// words. Order is preserved.
pub fn extract_keywords(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split_whitespace()
        .filter(|t| t.len() > 3 && !STOP_WORDS.contains(t))
        .map(|t| t.to_string())
        .collect()
}

/// Quote each term for FTS5 so punctuation in user queries cannot break the
/// MATCH expression.
fn build_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|word| format!("\"{}\"", word.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Full-text search over title/subtitle/narrative, ranked by bm25 then
/// importance. Falls back to a LIKE scan (capped at 2 keywords) when the
/// index errors or matches nothing.
pub fn search_fts_sync(
    conn: &Connection,
    query: &str,
    project: &str,
    limit: usize,
) -> rusqlite::Result<Vec<Observation>> {
    let scored = search_fts_scored_sync(conn, query, project, limit)?;
    Ok(scored.into_iter().map(|(obs, _)| obs).collect())
}

/// Like search_fts but returning the raw relevance value for rank fusion.
/// The relevance is negated bm25 (bm25 returns "lower is better"), so
/// higher values rank first. LIKE-fallback rows carry relevance 0.
pub fn search_fts_scored_sync(
    conn: &Connection,
    query: &str,
    project: &str,
    limit: usize,
) -> rusqlite::Result<Vec<(Observation, f64)>> {
    let fts_query = build_fts_query(query);
    if fts_query.is_empty() {
        return Ok(Vec::new());
    }

    let fts_result = conn
        .prepare(&format!(
            "SELECT {}, bm25(observations_fts) AS rank
             FROM observations_fts f
             JOIN observations o ON o.id = f.rowid
             WHERE observations_fts MATCH ?2
               AND ((o.project = ?1 AND (o.scope IS NULL OR o.scope = 'project'))
                    OR o.scope = 'global')
               AND o.is_archived = 0
             ORDER BY rank ASC, o.importance_score DESC
             LIMIT ?3",
            qualified_obs_columns("o")
        ))
        .and_then(|mut stmt| {
            stmt.query_map(params![project, fts_query, limit as i64], |row| {
                let obs = parse_observation_row(row)?;
                let rank: f64 = row.get(24)?;
                Ok((obs, -rank))
            })
            .map(|rows| rows.filter_map(log_and_discard).collect::<Vec<_>>())
        });

    match fts_result {
        Ok(rows) if !rows.is_empty() => Ok(rows),
        Ok(_) => Ok(search_like_sync(conn, query, project, limit)),
        Err(e) => {
            tracing::debug!("FTS search failed, using LIKE fallback: {}", e);
            Ok(search_like_sync(conn, query, project, limit))
        }
    }
}

fn qualified_obs_columns(alias: &str) -> String {
    OBS_COLUMNS
        .split(", ")
        .map(|c| format!("{}.{}", alias, c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// LIKE fallback over title/subtitle/narrative, capped at 2 keywords.
fn search_like_sync(
    conn: &Connection,
    query: &str,
    project: &str,
    limit: usize,
) -> Vec<(Observation, f64)> {
    let keywords: Vec<String> = extract_keywords(query)
        .into_iter()
        .take(LIKE_FALLBACK_KEYWORDS)
        .collect();
    if keywords.is_empty() {
        return Vec::new();
    }

    let clauses: Vec<String> = (0..keywords.len())
        .map(|i| {
            let p = i + 3;
            format!(
                "(o.title LIKE ?{p} ESCAPE '\\' OR o.subtitle LIKE ?{p} ESCAPE '\\' \
                 OR o.narrative LIKE ?{p} ESCAPE '\\')"
            )
        })
        .collect();
    let sql = format!(
        "SELECT {} FROM observations o
         WHERE ((o.project = ?1 AND (o.scope IS NULL OR o.scope = 'project'))
                OR o.scope = 'global')
           AND o.is_archived = 0
           AND ({})
         ORDER BY o.importance_score DESC, o.created_at_epoch DESC
         LIMIT ?2",
        qualified_obs_columns("o"),
        clauses.join(" OR ")
    );

    let mut values: Vec<Box<dyn ToSql>> = vec![
        Box::new(project.to_string()),
        Box::new(limit as i64),
    ];
    for kw in &keywords {
        let escaped = kw
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        values.push(Box::new(format!("%{}%", escaped)));
    }
    let refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();

    conn.prepare(&sql)
        .and_then(|mut stmt| {
            stmt.query_map(refs.as_slice(), |row| {
                Ok((parse_observation_row(row)?, 0.0))
            })
            .map(|rows| rows.filter_map(log_and_discard).collect())
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sessions::ensure_session_sync;
    use crate::db::test_support::{seed_observation, setup_test_connection};

    #[test]
    fn scope_derivation() {
        assert_eq!(
            derive_scope(None, &["coding-style".into()]),
            Scope::Project
        );
        assert_eq!(derive_scope(None, &["security".into()]), Scope::Global);
        assert_eq!(
            derive_scope(None, &["tabs".into(), "gotcha".into()]),
            Scope::Global
        );
        // Explicit scope wins over concepts
        assert_eq!(
            derive_scope(Some(Scope::Project), &["security".into()]),
            Scope::Project
        );
        assert_eq!(derive_scope(None, &[]), Scope::Project);
    }

    #[test]
    fn insert_and_get_roundtrip() {
        let conn = setup_test_connection();
        let session_id = ensure_session_sync(&conn, "s1", "proj-a").unwrap();

        let draft = ObservationDraft {
            obs_type: Some(ObservationType::Discovery),
            title: Some("Uses tabs".into()),
            concepts: vec!["coding-style".into()],
            facts: vec!["indentation is tabs".into()],
            ..Default::default()
        };
        let (id, epoch) =
            insert_observation_sync(&conn, session_id, "proj-a", &draft, Some(1)).unwrap();
        assert!(id > 0);
        assert!(epoch > 0);

        let obs = get_observation_sync(&conn, id).unwrap().unwrap();
        assert_eq!(obs.scope, Some(Scope::Project));
        assert_eq!(obs.title.as_deref(), Some("Uses tabs"));
        assert_eq!(obs.facts, vec!["indentation is tabs".to_string()]);
        assert_eq!(obs.prompt_number, Some(1));
        assert!((obs.importance_score - 1.0).abs() < f64::EPSILON);
        assert!(!obs.is_superseded);
        assert!(get_observation_sync(&conn, 9999).unwrap().is_none());
    }

    #[test]
    fn global_rows_are_visible_from_other_projects() {
        let conn = setup_test_connection();
        let session_id = ensure_session_sync(&conn, "s1", "proj-a").unwrap();

        let draft = ObservationDraft {
            obs_type: Some(ObservationType::Discovery),
            title: Some("Never log tokens".into()),
            concepts: vec!["security".into()],
            ..Default::default()
        };
        insert_observation_sync(&conn, session_id, "proj-a", &draft, None).unwrap();

        let rows = get_recent_sync(&conn, "proj-b", 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].scope, Some(Scope::Global));

        // Project-scoped rows stay invisible elsewhere
        let local = ObservationDraft {
            obs_type: Some(ObservationType::Discovery),
            title: Some("Uses tabs".into()),
            concepts: vec!["coding-style".into()],
            ..Default::default()
        };
        insert_observation_sync(&conn, session_id, "proj-a", &local, None).unwrap();
        assert_eq!(get_recent_sync(&conn, "proj-b", 10).unwrap().len(), 1);
        assert_eq!(get_recent_sync(&conn, "proj-a", 10).unwrap().len(), 2);
    }

    #[test]
    fn active_excludes_superseded_and_archived() {
        let conn = setup_test_connection();
        let session_id = ensure_session_sync(&conn, "s1", "p").unwrap();
        let a = seed_observation(&conn, session_id, "p", "one");
        let b = seed_observation(&conn, session_id, "p", "two");
        let c = seed_observation(&conn, session_id, "p", "three");

        assert!(mark_superseded_sync(&conn, a).unwrap());
        assert!(archive_sync(&conn, b, "stale").unwrap());

        let active = get_active_sync(&conn, "p", 10).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, c);

        let recent = get_recent_sync(&conn, "p", 10).unwrap();
        assert_eq!(recent.len(), 3);
    }

    #[test]
    fn preserve_order_returns_subsequence_of_input() {
        let conn = setup_test_connection();
        let session_id = ensure_session_sync(&conn, "s1", "p").unwrap();
        let a = seed_observation(&conn, session_id, "p", "one");
        let b = seed_observation(&conn, session_id, "p", "two");
        let c = seed_observation(&conn, session_id, "p", "three");

        let rows = get_by_ids_preserve_order_sync(&conn, &[c, 777, a, b]).unwrap();
        let ids: Vec<i64> = rows.iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![c, a, b]);

        assert!(get_by_ids_preserve_order_sync(&conn, &[]).unwrap().is_empty());
    }

    #[test]
    fn get_by_ids_orderings() {
        let conn = setup_test_connection();
        let session_id = ensure_session_sync(&conn, "s1", "p").unwrap();
        let a = seed_observation(&conn, session_id, "p", "one");
        let b = seed_observation(&conn, session_id, "p", "two");
        conn.execute(
            "UPDATE observations SET importance_score = 5.0 WHERE id = ?1",
            [a],
        )
        .unwrap();
        conn.execute(
            "UPDATE observations SET created_at_epoch = created_at_epoch + 1000 WHERE id = ?1",
            [b],
        )
        .unwrap();

        let by_importance = get_by_ids_sync(&conn, &[a, b], OrderBy::Importance, 10).unwrap();
        assert_eq!(by_importance[0].id, a);

        let by_date = get_by_ids_sync(&conn, &[a, b], OrderBy::DateDesc, 10).unwrap();
        assert_eq!(by_date[0].id, b);

        let by_date_asc = get_by_ids_sync(&conn, &[a, b], OrderBy::DateAsc, 10).unwrap();
        assert_eq!(by_date_asc[0].id, a);
    }

    #[test]
    fn keyset_pagination_walks_all_rows() {
        let conn = setup_test_connection();
        let session_id = ensure_session_sync(&conn, "s1", "p").unwrap();
        for i in 0..7 {
            seed_observation(&conn, session_id, "p", &format!("obs {}", i));
        }

        let mut cursor = 0;
        let mut seen = Vec::new();
        loop {
            let page = get_page_sync(&conn, cursor, 3).unwrap();
            if page.is_empty() {
                break;
            }
            cursor = page.last().unwrap().id;
            seen.extend(page.into_iter().map(|o| o.id));
        }
        assert_eq!(seen.len(), 7);
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen, sorted, "keyset scan yields ascending ids");
    }

    #[test]
    fn update_patch_touches_only_present_fields() {
        let conn = setup_test_connection();
        let session_id = ensure_session_sync(&conn, "s1", "p").unwrap();
        let id = seed_observation(&conn, session_id, "p", "before");

        let patch = ObservationPatch {
            title: Some("after".into()),
            importance_score: Some(2.5),
            ..Default::default()
        };
        assert!(update_observation_sync(&conn, id, &patch).unwrap());

        let obs = get_observation_sync(&conn, id).unwrap().unwrap();
        assert_eq!(obs.title.as_deref(), Some("after"));
        assert!((obs.importance_score - 2.5).abs() < f64::EPSILON);
        assert!(obs.score_updated_at_epoch.is_some());
        // Narrative untouched
        assert!(obs.narrative.is_none());

        assert!(!update_observation_sync(&conn, 9999, &patch).unwrap());
    }

    #[test]
    fn archive_lifecycle() {
        let conn = setup_test_connection();
        let session_id = ensure_session_sync(&conn, "s1", "p").unwrap();
        let id = seed_observation(&conn, session_id, "p", "to archive");

        assert!(archive_sync(&conn, id, "manual").unwrap());
        let obs = get_observation_sync(&conn, id).unwrap().unwrap();
        assert!(obs.is_archived);
        assert_eq!(obs.archived_reason.as_deref(), Some("manual"));

        assert!(unarchive_sync(&conn, id).unwrap());
        let obs = get_observation_sync(&conn, id).unwrap().unwrap();
        assert!(!obs.is_archived);
        assert!(obs.archived_at_epoch.is_none());

        assert!(!archive_sync(&conn, 9999, "x").unwrap());
        assert!(!unarchive_sync(&conn, 9999).unwrap());
    }

    #[test]
    fn archive_old_respects_cutoff() {
        let conn = setup_test_connection();
        let session_id = ensure_session_sync(&conn, "s1", "p").unwrap();
        let old = seed_observation(&conn, session_id, "p", "old");
        let fresh = seed_observation(&conn, session_id, "p", "fresh");
        // Push one row 100 days into the past
        conn.execute(
            "UPDATE observations SET created_at_epoch = created_at_epoch - 8640000000 WHERE id = ?1",
            [old],
        )
        .unwrap();

        let archived = archive_old_sync(&conn, "p", 90, "age").unwrap();
        assert_eq!(archived, vec![old]);

        let obs = get_observation_sync(&conn, fresh).unwrap().unwrap();
        assert!(!obs.is_archived);
    }

    #[test]
    fn delete_purges_dependents() {
        let conn = setup_test_connection();
        let session_id = ensure_session_sync(&conn, "s1", "p").unwrap();
        let a = seed_observation(&conn, session_id, "p", "a");
        let b = seed_observation(&conn, session_id, "p", "b");
        conn.execute(
            "INSERT INTO observation_conflicts
                (newer_obs_id, older_obs_id, conflict_type, resolution, detected_at_epoch)
             VALUES (?1, ?2, 'superseded', 'prefer_newer', 0)",
            [b, a],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO observation_relations
                (source_id, target_id, relation_type, confidence, detection_source, created_at_epoch)
             VALUES (?1, ?2, 'supersedes', 0.9, 'manual', 0)",
            [b, a],
        )
        .unwrap();

        assert!(delete_observation_sync(&conn, a).unwrap());
        assert!(!delete_observation_sync(&conn, a).unwrap());

        let conflicts: i64 = conn
            .query_row("SELECT COUNT(*) FROM observation_conflicts", [], |r| r.get(0))
            .unwrap();
        let relations: i64 = conn
            .query_row("SELECT COUNT(*) FROM observation_relations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(conflicts, 0);
        assert_eq!(relations, 0);
    }

    #[test]
    fn keyword_extraction_rules() {
        let keywords = extract_keywords("How does the Parser handle NULL bytes from input");
        assert_eq!(
            keywords,
            vec!["does", "parser", "handle", "null", "bytes", "input"]
        );
        // <= 3 chars and stop words are dropped; order preserved
        assert!(extract_keywords("a an the of").is_empty());
    }

    #[test]
    fn fts_search_ranks_matches() {
        let conn = setup_test_connection();
        let session_id = ensure_session_sync(&conn, "s1", "p").unwrap();
        seed_observation(&conn, session_id, "p", "parser rejects null bytes");
        seed_observation(&conn, session_id, "p", "renderer caches glyphs");

        let hits = search_fts_sync(&conn, "parser null", "p", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title.as_deref(), Some("parser rejects null bytes"));
    }

    #[test]
    fn fts_falls_back_to_like_on_no_match() {
        let conn = setup_test_connection();
        let session_id = ensure_session_sync(&conn, "s1", "p").unwrap();
        let id = seed_observation(&conn, session_id, "p", "tokenizer internals");

        // "tokeniz" is not a full FTS token but matches via LIKE
        let hits = search_fts_sync(&conn, "tokeniz internals", "p", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id);
    }

    #[test]
    fn fts_excludes_archived_rows() {
        let conn = setup_test_connection();
        let session_id = ensure_session_sync(&conn, "s1", "p").unwrap();
        let id = seed_observation(&conn, session_id, "p", "archived finding");
        archive_sync(&conn, id, "old").unwrap();

        let hits = search_fts_sync(&conn, "archived finding", "p", 10).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn scored_search_orders_by_relevance() {
        let conn = setup_test_connection();
        let session_id = ensure_session_sync(&conn, "s1", "p").unwrap();
        seed_observation(&conn, session_id, "p", "cache eviction policy");
        seed_observation(&conn, session_id, "p", "cache");

        let scored = search_fts_scored_sync(&conn, "cache", "p", 10).unwrap();
        assert_eq!(scored.len(), 2);
        assert!(scored[0].1 >= scored[1].1, "results ordered by relevance");
    }
}
