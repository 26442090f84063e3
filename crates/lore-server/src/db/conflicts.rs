// crates/lore-server/src/db/conflicts.rs
// Conflict records and the supersession retention sweep.
//
// A superseded observation is never deleted before its detecting conflict is
// at least the retention window old; the sweep deletes the loser, the
// conflict rows, and the loser's dependents in one transaction.

use lore_types::{Conflict, ConflictResolution, ConflictType};
use rusqlite::{params, Connection};
use std::str::FromStr;

use super::{log_and_discard, now_ms};

const CONFLICT_COLUMNS: &str = "id, newer_obs_id, older_obs_id, conflict_type, resolution, \
                                reason, detected_at_epoch, resolved, resolved_at_epoch";

pub fn parse_conflict_row(row: &rusqlite::Row) -> rusqlite::Result<Conflict> {
    let conflict_type: String = row.get(3)?;
    let resolution: String = row.get(4)?;
    Ok(Conflict {
        id: row.get(0)?,
        newer_obs_id: row.get(1)?,
        older_obs_id: row.get(2)?,
        conflict_type: ConflictType::from_str(&conflict_type)
            .unwrap_or(ConflictType::Superseded),
        resolution: ConflictResolution::from_str(&resolution)
            .unwrap_or(ConflictResolution::PreferNewer),
        reason: row.get(5)?,
        detected_at_epoch: row.get(6)?,
        resolved: row.get::<_, i64>(7)? != 0,
        resolved_at_epoch: row.get(8)?,
    })
}

/// Record a conflict. Idempotent on (newer, older, conflict_type): storing
/// the same tuple again returns the existing row's id. `detected_at` lets
/// backfills carry their original detection time; None means now.
pub fn store_conflict_sync(
    conn: &Connection,
    newer_obs_id: i64,
    older_obs_id: i64,
    conflict_type: ConflictType,
    resolution: ConflictResolution,
    reason: Option<&str>,
    detected_at: Option<i64>,
) -> rusqlite::Result<i64> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM observation_conflicts
             WHERE newer_obs_id = ?1 AND older_obs_id = ?2 AND conflict_type = ?3",
            params![newer_obs_id, older_obs_id, conflict_type.as_str()],
            |row| row.get(0),
        )
        .ok();
    if let Some(id) = existing {
        return Ok(id);
    }

    conn.execute(
        "INSERT INTO observation_conflicts
            (newer_obs_id, older_obs_id, conflict_type, resolution, reason, detected_at_epoch)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            newer_obs_id,
            older_obs_id,
            conflict_type.as_str(),
            resolution.as_str(),
            reason,
            detected_at.unwrap_or_else(now_ms),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Conflicts touching an observation on either side, newest detection first.
pub fn get_conflicts_for_observation_sync(
    conn: &Connection,
    obs_id: i64,
) -> rusqlite::Result<Vec<Conflict>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CONFLICT_COLUMNS} FROM observation_conflicts
         WHERE newer_obs_id = ?1 OR older_obs_id = ?1
         ORDER BY detected_at_epoch DESC"
    ))?;
    let rows = stmt
        .query_map([obs_id], parse_conflict_row)?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

/// Mark a conflict resolved. Idempotent; false when missing.
pub fn resolve_conflict_sync(conn: &Connection, id: i64) -> rusqlite::Result<bool> {
    let updated = conn.execute(
        "UPDATE observation_conflicts SET resolved = 1, resolved_at_epoch = ?1 WHERE id = ?2",
        params![now_ms(), id],
    )?;
    Ok(updated > 0)
}

/// Delete conflict rows referencing an observation on either side.
/// Called from observation deletes to keep referential cleanliness.
pub fn delete_conflicts_by_observation_sync(
    conn: &Connection,
    obs_id: i64,
) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM observation_conflicts WHERE newer_obs_id = ?1 OR older_obs_id = ?1",
        [obs_id],
    )
}

/// Delete superseded observations in a project whose prefer-newer conflict
/// is older than the retention window. One transaction: find the losers,
/// delete the conflicts referencing them, then the observations with their
/// relation/vector dependents. Returns the deleted ids.
pub fn cleanup_superseded_sync(
    conn: &Connection,
    project: &str,
    retention_days: i64,
) -> rusqlite::Result<Vec<i64>> {
    let cutoff = now_ms() - retention_days * 24 * 60 * 60 * 1000;
    let tx = conn.unchecked_transaction()?;

    let victims: Vec<i64> = {
        let mut stmt = tx.prepare(
            "SELECT DISTINCT o.id FROM observations o
             JOIN observation_conflicts c ON c.older_obs_id = o.id
             WHERE o.project = ?1
               AND o.is_superseded = 1
               AND c.resolution = 'prefer_newer'
               AND c.detected_at_epoch < ?2",
        )?;
        let rows = stmt
            .query_map(params![project, cutoff], |row| row.get(0))?
            .filter_map(log_and_discard)
            .collect::<Vec<i64>>();
        rows
    };

    if !victims.is_empty() {
        let id_list = victims
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        tx.execute(
            &format!(
                "DELETE FROM observation_conflicts
                 WHERE newer_obs_id IN ({id_list}) OR older_obs_id IN ({id_list})"
            ),
            [],
        )?;
        tx.execute(
            &format!(
                "DELETE FROM observation_relations
                 WHERE source_id IN ({id_list}) OR target_id IN ({id_list})"
            ),
            [],
        )?;
        tx.execute(
            &format!(
                "DELETE FROM vectors
                 WHERE doc_type = 'observation' AND source_row_id IN ({id_list})"
            ),
            [],
        )?;
        tx.execute(
            &format!("DELETE FROM observations WHERE id IN ({id_list})"),
            [],
        )?;
    }

    tx.commit()?;
    Ok(victims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::observations::{get_observation_sync, mark_superseded_sync};
    use crate::db::sessions::ensure_session_sync;
    use crate::db::test_support::{seed_observation, setup_test_connection};

    const DAY_MS: i64 = 24 * 60 * 60 * 1000;

    #[test]
    fn store_conflict_is_idempotent_on_tuple() {
        let conn = setup_test_connection();
        let session = ensure_session_sync(&conn, "s1", "p").unwrap();
        let newer = seed_observation(&conn, session, "p", "newer");
        let older = seed_observation(&conn, session, "p", "older");

        let id1 = store_conflict_sync(
            &conn,
            newer,
            older,
            ConflictType::Superseded,
            ConflictResolution::PreferNewer,
            Some("replaced"),
            None,
        )
        .unwrap();
        let id2 = store_conflict_sync(
            &conn,
            newer,
            older,
            ConflictType::Superseded,
            ConflictResolution::PreferNewer,
            None,
            None,
        )
        .unwrap();
        assert_eq!(id1, id2);

        // A different type is a different tuple
        let id3 = store_conflict_sync(
            &conn,
            newer,
            older,
            ConflictType::Contradicts,
            ConflictResolution::Manual,
            None,
            None,
        )
        .unwrap();
        assert_ne!(id1, id3);
    }

    #[test]
    fn self_conflict_is_rejected_by_schema() {
        let conn = setup_test_connection();
        let session = ensure_session_sync(&conn, "s1", "p").unwrap();
        let id = seed_observation(&conn, session, "p", "only");
        let result = store_conflict_sync(
            &conn,
            id,
            id,
            ConflictType::Superseded,
            ConflictResolution::PreferNewer,
            None,
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn conflicts_query_and_resolution() {
        let conn = setup_test_connection();
        let session = ensure_session_sync(&conn, "s1", "p").unwrap();
        let newer = seed_observation(&conn, session, "p", "newer");
        let older = seed_observation(&conn, session, "p", "older");

        let id = store_conflict_sync(
            &conn,
            newer,
            older,
            ConflictType::Contradicts,
            ConflictResolution::Manual,
            Some("disagrees"),
            None,
        )
        .unwrap();

        let for_older = get_conflicts_for_observation_sync(&conn, older).unwrap();
        assert_eq!(for_older.len(), 1);
        assert_eq!(for_older[0].conflict_type, ConflictType::Contradicts);
        assert!(!for_older[0].resolved);

        assert!(resolve_conflict_sync(&conn, id).unwrap());
        let for_older = get_conflicts_for_observation_sync(&conn, older).unwrap();
        assert!(for_older[0].resolved);
        assert!(for_older[0].resolved_at_epoch.is_some());

        assert!(!resolve_conflict_sync(&conn, 9999).unwrap());
    }

    #[test]
    fn sweep_deletes_only_expired_prefer_newer_losers() {
        let conn = setup_test_connection();
        let session = ensure_session_sync(&conn, "s1", "proj").unwrap();
        let o1 = seed_observation(&conn, session, "proj", "newer fact");
        let o2 = seed_observation(&conn, session, "proj", "older fact");
        let o3 = seed_observation(&conn, session, "proj", "recently superseded");

        // o2: superseded 4 days ago -> eligible
        store_conflict_sync(
            &conn,
            o1,
            o2,
            ConflictType::Superseded,
            ConflictResolution::PreferNewer,
            None,
            Some(now_ms() - 4 * DAY_MS),
        )
        .unwrap();
        mark_superseded_sync(&conn, o2).unwrap();

        // o3: superseded an hour ago -> retained
        store_conflict_sync(
            &conn,
            o1,
            o3,
            ConflictType::Superseded,
            ConflictResolution::PreferNewer,
            None,
            Some(now_ms() - 60 * 60 * 1000),
        )
        .unwrap();
        mark_superseded_sync(&conn, o3).unwrap();

        let deleted = cleanup_superseded_sync(&conn, "proj", 3).unwrap();
        assert_eq!(deleted, vec![o2]);

        assert!(get_observation_sync(&conn, o1).unwrap().is_some());
        assert!(get_observation_sync(&conn, o2).unwrap().is_none());
        assert!(get_observation_sync(&conn, o3).unwrap().is_some());

        // The expired conflict rows are gone with the observation
        assert!(get_conflicts_for_observation_sync(&conn, o2).unwrap().is_empty());
    }

    #[test]
    fn sweep_skips_manual_resolutions() {
        let conn = setup_test_connection();
        let session = ensure_session_sync(&conn, "s1", "proj").unwrap();
        let newer = seed_observation(&conn, session, "proj", "newer");
        let older = seed_observation(&conn, session, "proj", "older");

        store_conflict_sync(
            &conn,
            newer,
            older,
            ConflictType::Contradicts,
            ConflictResolution::Manual,
            None,
            Some(now_ms() - 10 * DAY_MS),
        )
        .unwrap();
        mark_superseded_sync(&conn, older).unwrap();

        let deleted = cleanup_superseded_sync(&conn, "proj", 3).unwrap();
        assert!(deleted.is_empty());
        assert!(get_observation_sync(&conn, older).unwrap().is_some());
    }

    #[test]
    fn delete_by_observation_clears_both_sides() {
        let conn = setup_test_connection();
        let session = ensure_session_sync(&conn, "s1", "p").unwrap();
        let a = seed_observation(&conn, session, "p", "a");
        let b = seed_observation(&conn, session, "p", "b");
        let c = seed_observation(&conn, session, "p", "c");

        store_conflict_sync(
            &conn,
            a,
            b,
            ConflictType::Superseded,
            ConflictResolution::PreferNewer,
            None,
            None,
        )
        .unwrap();
        store_conflict_sync(
            &conn,
            c,
            a,
            ConflictType::Contradicts,
            ConflictResolution::Manual,
            None,
            None,
        )
        .unwrap();

        let deleted = delete_conflicts_by_observation_sync(&conn, a).unwrap();
        assert_eq!(deleted, 2);
    }
}
