// crates/lore-server/src/db/scoring.rs
// Importance scoring: feedback, retrieval counters, batched score updates,
// and tunable concept weights with an in-memory default fallback.

use std::collections::HashMap;

use lore_types::Observation;
use rusqlite::{params, Connection, ToSql};
use serde::Serialize;

use super::observations::parse_observation_row;
use super::{log_and_discard, now_ms};

/// Below this many entries a score update runs as per-row statements inside
/// one transaction; above it, one CASE statement.
const CASE_UPDATE_THRESHOLD: usize = 5;

/// Fallback weights used when the concept_weights table is empty or
/// unreadable.
pub const DEFAULT_CONCEPT_WEIGHTS: [(&str, f64); 7] = [
    ("security", 0.30),
    ("gotcha", 0.25),
    ("anti-pattern", 0.20),
    ("best-practice", 0.15),
    ("performance", 0.10),
    ("architecture", 0.10),
    ("convention", 0.05),
];

/// Record user feedback (-1, 0, +1) and stamp score_updated_at_epoch.
/// False when the observation does not exist.
pub fn set_feedback_sync(conn: &Connection, id: i64, feedback: i64) -> rusqlite::Result<bool> {
    let updated = conn.execute(
        "UPDATE observations SET user_feedback = ?1, score_updated_at_epoch = ?2 WHERE id = ?3",
        params![feedback, now_ms(), id],
    )?;
    Ok(updated > 0)
}

/// Increment retrieval_count and stamp last_retrieved_at_epoch for a batch
/// of ids in one statement. Returns the number of rows touched.
pub fn increment_retrieval_count_sync(conn: &Connection, ids: &[i64]) -> rusqlite::Result<usize> {
    if ids.is_empty() {
        return Ok(0);
    }
    let id_list = ids
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    conn.execute(
        &format!(
            "UPDATE observations
             SET retrieval_count = retrieval_count + 1, last_retrieved_at_epoch = ?1
             WHERE id IN ({id_list})"
        ),
        [now_ms()],
    )
}

/// Apply a batch of importance scores. Small batches run per-row inside one
/// transaction; larger ones collapse into a single CASE statement bounded by
/// WHERE id IN (...). Returns the number of rows touched.
pub fn update_importance_scores_sync(
    conn: &Connection,
    scores: &HashMap<i64, f64>,
) -> rusqlite::Result<usize> {
    if scores.is_empty() {
        return Ok(0);
    }
    let now = now_ms();

    if scores.len() <= CASE_UPDATE_THRESHOLD {
        let tx = conn.unchecked_transaction()?;
        let mut touched = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE observations SET importance_score = ?1, score_updated_at_epoch = ?2
                 WHERE id = ?3",
            )?;
            for (id, score) in scores {
                touched += stmt.execute(params![score, now, id])?;
            }
        }
        tx.commit()?;
        return Ok(touched);
    }

    let mut case_arms = String::new();
    let mut values: Vec<Box<dyn ToSql>> = Vec::new();
    for (id, score) in scores {
        case_arms.push_str("WHEN ? THEN ? ");
        values.push(Box::new(*id));
        values.push(Box::new(*score));
    }
    values.push(Box::new(now));

    let id_list = scores
        .keys()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE observations
         SET importance_score = CASE id {case_arms}END,
             score_updated_at_epoch = ?
         WHERE id IN ({id_list})"
    );
    let refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
    conn.execute(&sql, refs.as_slice())
}

/// Observations whose score is stale: never scored, or scored before
/// now - threshold. Most recent first.
pub fn observations_needing_score_update_sync(
    conn: &Connection,
    threshold_ms: i64,
    limit: usize,
) -> rusqlite::Result<Vec<Observation>> {
    let cutoff = now_ms() - threshold_ms;
    let mut stmt = conn.prepare(
        "SELECT id, session_id, project, scope, obs_type, title, subtitle, narrative,
                facts, concepts, files_read, files_modified, file_mtimes, prompt_number,
                created_at_epoch, importance_score, user_feedback, retrieval_count,
                last_retrieved_at_epoch, score_updated_at_epoch, is_superseded, is_archived,
                archived_at_epoch, archived_reason
         FROM observations
         WHERE score_updated_at_epoch IS NULL OR score_updated_at_epoch < ?1
         ORDER BY created_at_epoch DESC
         LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![cutoff, limit as i64], parse_observation_row)?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

fn default_weights() -> HashMap<String, f64> {
    DEFAULT_CONCEPT_WEIGHTS
        .iter()
        .map(|(concept, weight)| (concept.to_string(), *weight))
        .collect()
}

/// Read all concept weights. An empty or unreadable table yields the
/// built-in defaults instead of an error.
pub fn get_concept_weights_sync(conn: &Connection) -> HashMap<String, f64> {
    let result = conn
        .prepare("SELECT concept, weight FROM concept_weights")
        .and_then(|mut stmt| {
            stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)))
                .map(|rows| rows.filter_map(log_and_discard).collect::<HashMap<_, _>>())
        });
    match result {
        Ok(weights) if !weights.is_empty() => weights,
        Ok(_) => default_weights(),
        Err(e) => {
            tracing::debug!("concept_weights read failed, using defaults: {}", e);
            default_weights()
        }
    }
}

/// Replace-or-insert a full weight map in one transaction.
pub fn set_concept_weights_sync(
    conn: &Connection,
    weights: &HashMap<String, f64>,
) -> rusqlite::Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let mut touched = 0;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO concept_weights (concept, weight, updated_at_epoch)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(concept) DO UPDATE SET
                 weight = excluded.weight, updated_at_epoch = excluded.updated_at_epoch",
        )?;
        for (concept, weight) in weights {
            touched += stmt.execute(params![concept, weight, now_ms()])?;
        }
    }
    tx.commit()?;
    Ok(touched)
}

/// Upsert one concept weight.
pub fn update_concept_weight_sync(
    conn: &Connection,
    concept: &str,
    weight: f64,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO concept_weights (concept, weight, updated_at_epoch)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(concept) DO UPDATE SET
             weight = excluded.weight, updated_at_epoch = excluded.updated_at_epoch",
        params![concept, weight, now_ms()],
    )?;
    Ok(())
}

/// Feedback/retrieval aggregates, optionally scoped to one project.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FeedbackStats {
    pub total: i64,
    pub positive: i64,
    pub negative: i64,
    pub neutral: i64,
    pub avg_importance: f64,
    pub avg_retrieval_count: f64,
}

/// Compute feedback stats in a single aggregation query.
pub fn feedback_stats_sync(
    conn: &Connection,
    project: Option<&str>,
) -> rusqlite::Result<FeedbackStats> {
    conn.query_row(
        "SELECT COUNT(*),
                COALESCE(SUM(CASE WHEN user_feedback = 1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN user_feedback = -1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN user_feedback = 0 THEN 1 ELSE 0 END), 0),
                COALESCE(AVG(importance_score), 0.0),
                COALESCE(AVG(retrieval_count), 0.0)
         FROM observations
         WHERE ?1 IS NULL OR project = ?1",
        [project],
        |row| {
            Ok(FeedbackStats {
                total: row.get(0)?,
                positive: row.get(1)?,
                negative: row.get(2)?,
                neutral: row.get(3)?,
                avg_importance: row.get(4)?,
                avg_retrieval_count: row.get(5)?,
            })
        },
    )
}

/// Reset every importance score to the default 1.0 and clear the score
/// stamps. Returns the number of rows touched.
pub fn reset_scores_sync(conn: &Connection) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE observations SET importance_score = 1.0, score_updated_at_epoch = NULL",
        [],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::observations::get_observation_sync;
    use crate::db::sessions::ensure_session_sync;
    use crate::db::test_support::{seed_observation, setup_test_connection};

    #[test]
    fn feedback_update_stamps_epoch() {
        let conn = setup_test_connection();
        let session = ensure_session_sync(&conn, "s1", "p").unwrap();
        let id = seed_observation(&conn, session, "p", "obs");

        assert!(set_feedback_sync(&conn, id, 1).unwrap());
        let obs = get_observation_sync(&conn, id).unwrap().unwrap();
        assert_eq!(obs.user_feedback, 1);
        assert!(obs.score_updated_at_epoch.is_some());

        assert!(!set_feedback_sync(&conn, 9999, -1).unwrap());
    }

    #[test]
    fn retrieval_counts_increment_in_one_statement() {
        let conn = setup_test_connection();
        let session = ensure_session_sync(&conn, "s1", "p").unwrap();
        let a = seed_observation(&conn, session, "p", "a");
        let b = seed_observation(&conn, session, "p", "b");

        assert_eq!(increment_retrieval_count_sync(&conn, &[a, b]).unwrap(), 2);
        assert_eq!(increment_retrieval_count_sync(&conn, &[a]).unwrap(), 1);
        assert_eq!(increment_retrieval_count_sync(&conn, &[]).unwrap(), 0);

        let obs_a = get_observation_sync(&conn, a).unwrap().unwrap();
        assert_eq!(obs_a.retrieval_count, 2);
        assert!(obs_a.last_retrieved_at_epoch.is_some());
        let obs_b = get_observation_sync(&conn, b).unwrap().unwrap();
        assert_eq!(obs_b.retrieval_count, 1);
    }

    #[test]
    fn small_score_batch_uses_per_row_updates() {
        let conn = setup_test_connection();
        let session = ensure_session_sync(&conn, "s1", "p").unwrap();
        let a = seed_observation(&conn, session, "p", "a");
        let b = seed_observation(&conn, session, "p", "b");

        let mut scores = HashMap::new();
        scores.insert(a, 3.0);
        scores.insert(b, 0.5);
        assert_eq!(update_importance_scores_sync(&conn, &scores).unwrap(), 2);

        let obs = get_observation_sync(&conn, a).unwrap().unwrap();
        assert!((obs.importance_score - 3.0).abs() < f64::EPSILON);
        assert!(obs.score_updated_at_epoch.is_some());
    }

    #[test]
    fn large_score_batch_uses_case_statement() {
        let conn = setup_test_connection();
        let session = ensure_session_sync(&conn, "s1", "p").unwrap();
        let mut scores = HashMap::new();
        for i in 0..8 {
            let id = seed_observation(&conn, session, "p", &format!("obs {}", i));
            scores.insert(id, 1.0 + i as f64);
        }
        assert_eq!(update_importance_scores_sync(&conn, &scores).unwrap(), 8);

        for (id, score) in &scores {
            let obs = get_observation_sync(&conn, *id).unwrap().unwrap();
            assert!((obs.importance_score - score).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn stale_scores_query() {
        let conn = setup_test_connection();
        let session = ensure_session_sync(&conn, "s1", "p").unwrap();
        let never = seed_observation(&conn, session, "p", "never scored");
        let fresh = seed_observation(&conn, session, "p", "fresh");
        set_feedback_sync(&conn, fresh, 1).unwrap();

        let stale = observations_needing_score_update_sync(&conn, 60_000, 10).unwrap();
        let ids: Vec<i64> = stale.iter().map(|o| o.id).collect();
        assert!(ids.contains(&never));
        assert!(!ids.contains(&fresh));
    }

    #[test]
    fn concept_weights_default_fallback_and_upsert() {
        let conn = setup_test_connection();

        // Empty table -> defaults
        let weights = get_concept_weights_sync(&conn);
        assert_eq!(weights.get("security"), Some(&0.30));
        assert_eq!(weights.get("gotcha"), Some(&0.25));

        update_concept_weight_sync(&conn, "security", 0.9).unwrap();
        let weights = get_concept_weights_sync(&conn);
        assert_eq!(weights.get("security"), Some(&0.9));
        // Only the stored rows come back once the table is non-empty
        assert_eq!(weights.len(), 1);

        let mut all = HashMap::new();
        all.insert("security".to_string(), 0.4);
        all.insert("gotcha".to_string(), 0.3);
        set_concept_weights_sync(&conn, &all).unwrap();
        let weights = get_concept_weights_sync(&conn);
        assert_eq!(weights.get("security"), Some(&0.4));
        assert_eq!(weights.get("gotcha"), Some(&0.3));
    }

    #[test]
    fn feedback_stats_aggregate_and_project_filter() {
        let conn = setup_test_connection();
        let session = ensure_session_sync(&conn, "s1", "p").unwrap();
        let other = ensure_session_sync(&conn, "s2", "q").unwrap();
        let a = seed_observation(&conn, session, "p", "a");
        let b = seed_observation(&conn, session, "p", "b");
        let c = seed_observation(&conn, other, "q", "c");
        set_feedback_sync(&conn, a, 1).unwrap();
        set_feedback_sync(&conn, b, -1).unwrap();
        let _ = c;

        let stats = feedback_stats_sync(&conn, Some("p")).unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.positive, 1);
        assert_eq!(stats.negative, 1);
        assert_eq!(stats.neutral, 0);

        let all = feedback_stats_sync(&conn, None).unwrap();
        assert_eq!(all.total, 3);
        assert_eq!(all.neutral, 1);
    }

    #[test]
    fn reset_scores_clears_stamps() {
        let conn = setup_test_connection();
        let session = ensure_session_sync(&conn, "s1", "p").unwrap();
        let id = seed_observation(&conn, session, "p", "a");
        let mut scores = HashMap::new();
        scores.insert(id, 7.0);
        update_importance_scores_sync(&conn, &scores).unwrap();

        assert_eq!(reset_scores_sync(&conn).unwrap(), 1);
        let obs = get_observation_sync(&conn, id).unwrap().unwrap();
        assert!((obs.importance_score - 1.0).abs() < f64::EPSILON);
        assert!(obs.score_updated_at_epoch.is_none());
    }
}
