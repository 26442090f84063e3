// crates/lore-server/src/db/relations.rs
// Typed directed edges between observations, plus BFS graph expansion.

use std::collections::HashSet;
use std::str::FromStr;

use lore_types::{DetectionSource, ObservationType, Relation, RelationDetail, RelationType};
use rusqlite::{params, Connection};

use super::{log_and_discard, now_ms};

const RELATION_COLUMNS: &str = "id, source_id, target_id, relation_type, confidence, \
                                detection_source, reason, created_at_epoch";

pub fn parse_relation_row(row: &rusqlite::Row) -> rusqlite::Result<Relation> {
    let relation_type: String = row.get(3)?;
    let detection_source: String = row.get(5)?;
    Ok(Relation {
        id: row.get(0)?,
        source_id: row.get(1)?,
        target_id: row.get(2)?,
        relation_type: RelationType::from_str(&relation_type)
            .unwrap_or(RelationType::RelatesTo),
        confidence: row.get(4)?,
        detection_source: DetectionSource::from_str(&detection_source)
            .unwrap_or(DetectionSource::Manual),
        reason: row.get(6)?,
        created_at_epoch: row.get(7)?,
    })
}

/// Insert a relation. Idempotent on (source, target, type): re-inserting the
/// same edge returns the existing id with its stored confidence untouched.
pub fn store_relation_sync(
    conn: &Connection,
    source_id: i64,
    target_id: i64,
    relation_type: RelationType,
    confidence: f64,
    detection_source: DetectionSource,
    reason: Option<&str>,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO observation_relations
            (source_id, target_id, relation_type, confidence, detection_source, reason, created_at_epoch)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(source_id, target_id, relation_type) DO NOTHING",
        params![
            source_id,
            target_id,
            relation_type.as_str(),
            confidence.clamp(0.0, 1.0),
            detection_source.as_str(),
            reason,
            now_ms(),
        ],
    )?;
    conn.query_row(
        "SELECT id FROM observation_relations
         WHERE source_id = ?1 AND target_id = ?2 AND relation_type = ?3",
        params![source_id, target_id, relation_type.as_str()],
        |row| row.get(0),
    )
}

/// A relation ready for bulk insert.
#[derive(Debug, Clone)]
pub struct RelationInsert {
    pub source_id: i64,
    pub target_id: i64,
    pub relation_type: RelationType,
    pub confidence: f64,
    pub detection_source: DetectionSource,
    pub reason: Option<String>,
}

/// Insert a batch of relations in one transaction. Duplicate edges are
/// skipped. Returns the number of rows actually inserted.
pub fn store_relations_batch_sync(
    conn: &Connection,
    relations: &[RelationInsert],
) -> rusqlite::Result<usize> {
    if relations.is_empty() {
        return Ok(0);
    }
    let tx = conn.unchecked_transaction()?;
    let mut inserted = 0;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO observation_relations
                (source_id, target_id, relation_type, confidence, detection_source, reason, created_at_epoch)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(source_id, target_id, relation_type) DO NOTHING",
        )?;
        for r in relations {
            inserted += stmt.execute(params![
                r.source_id,
                r.target_id,
                r.relation_type.as_str(),
                r.confidence.clamp(0.0, 1.0),
                r.detection_source.as_str(),
                r.reason,
                now_ms(),
            ])?;
        }
    }
    tx.commit()?;
    Ok(inserted)
}

/// Outgoing edges of an observation.
pub fn get_outgoing_sync(conn: &Connection, source_id: i64) -> rusqlite::Result<Vec<Relation>> {
    query_relations(
        conn,
        &format!("SELECT {RELATION_COLUMNS} FROM observation_relations WHERE source_id = ?1"),
        source_id,
    )
}

/// Incoming edges of an observation.
pub fn get_incoming_sync(conn: &Connection, target_id: i64) -> rusqlite::Result<Vec<Relation>> {
    query_relations(
        conn,
        &format!("SELECT {RELATION_COLUMNS} FROM observation_relations WHERE target_id = ?1"),
        target_id,
    )
}

/// Edges touching an observation in either direction.
pub fn get_relations_sync(conn: &Connection, obs_id: i64) -> rusqlite::Result<Vec<Relation>> {
    query_relations(
        conn,
        &format!(
            "SELECT {RELATION_COLUMNS} FROM observation_relations
             WHERE source_id = ?1 OR target_id = ?1"
        ),
        obs_id,
    )
}

fn query_relations(conn: &Connection, sql: &str, id: i64) -> rusqlite::Result<Vec<Relation>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([id], parse_relation_row)?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

/// Edges of a given type touching an observation.
pub fn get_relations_by_type_sync(
    conn: &Connection,
    obs_id: i64,
    relation_type: RelationType,
) -> rusqlite::Result<Vec<Relation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RELATION_COLUMNS} FROM observation_relations
         WHERE (source_id = ?1 OR target_id = ?1) AND relation_type = ?2"
    ))?;
    let rows = stmt
        .query_map(params![obs_id, relation_type.as_str()], parse_relation_row)?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

/// Relations with endpoint titles and types joined in, for display.
pub fn get_relations_with_details_sync(
    conn: &Connection,
    obs_id: i64,
) -> rusqlite::Result<Vec<RelationDetail>> {
    let mut stmt = conn.prepare(
        "SELECT r.id, r.source_id, r.target_id, r.relation_type, r.confidence,
                r.detection_source, r.reason, r.created_at_epoch,
                s.title, s.obs_type, t.title, t.obs_type
         FROM observation_relations r
         JOIN observations s ON s.id = r.source_id
         JOIN observations t ON t.id = r.target_id
         WHERE r.source_id = ?1 OR r.target_id = ?1",
    )?;
    let rows = stmt
        .query_map([obs_id], |row| {
            let relation = parse_relation_row(row)?;
            let source_type: String = row.get(9)?;
            let target_type: String = row.get(11)?;
            Ok(RelationDetail {
                relation,
                source_title: row.get(8)?,
                source_type: ObservationType::from_str(&source_type)
                    .unwrap_or(ObservationType::Discovery),
                target_title: row.get(10)?,
                target_type: ObservationType::from_str(&target_type)
                    .unwrap_or(ObservationType::Discovery),
            })
        })?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

/// Update an edge's confidence post-hoc. False when missing.
pub fn update_relation_confidence_sync(
    conn: &Connection,
    relation_id: i64,
    confidence: f64,
) -> rusqlite::Result<bool> {
    let updated = conn.execute(
        "UPDATE observation_relations SET confidence = ?1 WHERE id = ?2",
        params![confidence.clamp(0.0, 1.0), relation_id],
    )?;
    Ok(updated > 0)
}

/// Delete edges touching an observation on either side.
pub fn delete_relations_by_observation_sync(
    conn: &Connection,
    obs_id: i64,
) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM observation_relations WHERE source_id = ?1 OR target_id = ?1",
        [obs_id],
    )
}

/// The result of a graph expansion from one root.
#[derive(Debug, Clone, Default)]
pub struct GraphExpansion {
    /// Every observation reached, root included, in BFS order.
    pub observation_ids: Vec<i64>,
    /// Every distinct relation crossed.
    pub relations: Vec<Relation>,
}

/// Breadth-first expansion to `max_depth` hops, deduplicating observation
/// and relation ids. A read failure on one node logs and continues; the
/// traversal never aborts as a whole.
pub fn expand_graph_sync(
    conn: &Connection,
    root_id: i64,
    max_depth: usize,
) -> GraphExpansion {
    let mut visited: HashSet<i64> = HashSet::new();
    let mut seen_relations: HashSet<i64> = HashSet::new();
    let mut result = GraphExpansion::default();

    visited.insert(root_id);
    result.observation_ids.push(root_id);
    let mut frontier = vec![root_id];

    for _ in 0..max_depth {
        if frontier.is_empty() {
            break;
        }
        let mut next_frontier = Vec::new();
        for node in frontier {
            let edges = match get_relations_sync(conn, node) {
                Ok(edges) => edges,
                Err(e) => {
                    tracing::warn!("graph expansion: failed to read edges of {}: {}", node, e);
                    continue;
                }
            };
            for edge in edges {
                let neighbor = if edge.source_id == node {
                    edge.target_id
                } else {
                    edge.source_id
                };
                if seen_relations.insert(edge.id) {
                    result.relations.push(edge);
                }
                if visited.insert(neighbor) {
                    result.observation_ids.push(neighbor);
                    next_frontier.push(neighbor);
                }
            }
        }
        frontier = next_frontier;
    }

    result
}
