// crates/lore-server/src/db/vectors.rs
// Embedding rows keyed by doc_id, with dimension validation at the write
// boundary. ANN reads are cosine-distance scans ordered by distance.

use rusqlite::{params, Connection};

use super::log_and_discard;
use crate::error::{LoreError, Result};
use crate::search::embedding_to_bytes;

/// One embedding row tied to a source artifact.
#[derive(Debug, Clone)]
pub struct VectorInsert {
    /// "{doc_type}:{source_row_id}:{field_type}" by convention; unique.
    pub doc_id: String,
    pub source_row_id: i64,
    pub doc_type: String,
    pub field_type: String,
    pub project: String,
    pub scope: String,
    pub model_version: String,
    pub embedding: Vec<f32>,
}

/// Reject vectors whose length differs from the configured dimension.
/// Mismatches fail fast; nothing is truncated or padded.
fn check_dim(expected: usize, embedding: &[f32]) -> Result<()> {
    if embedding.len() != expected {
        return Err(LoreError::DimensionMismatch {
            expected,
            actual: embedding.len(),
        });
    }
    Ok(())
}

/// Insert or replace the vector for a doc_id. Delete-then-insert inside one
/// transaction keeps doc_id unique in the vec0 table.
pub fn upsert_vector_sync(conn: &Connection, insert: &VectorInsert, dim: usize) -> Result<()> {
    check_dim(dim, &insert.embedding)?;
    let tx = conn.unchecked_transaction().map_err(LoreError::from)?;
    tx.execute("DELETE FROM vectors WHERE doc_id = ?1", [&insert.doc_id])
        .map_err(LoreError::from)?;
    tx.execute(
        "INSERT INTO vectors
            (embedding, doc_id, source_row_id, doc_type, field_type, project, scope, model_version)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            embedding_to_bytes(&insert.embedding),
            insert.doc_id,
            insert.source_row_id,
            insert.doc_type,
            insert.field_type,
            insert.project,
            insert.scope,
            insert.model_version,
        ],
    )
    .map_err(LoreError::from)?;
    tx.commit().map_err(LoreError::from)?;
    Ok(())
}

/// Delete vectors by doc id. Returns rows removed.
pub fn delete_vectors_by_doc_ids_sync(
    conn: &Connection,
    doc_ids: &[String],
) -> rusqlite::Result<usize> {
    let mut total = 0;
    for doc_id in doc_ids {
        total += conn.execute("DELETE FROM vectors WHERE doc_id = ?1", [doc_id])?;
    }
    Ok(total)
}

/// Delete every vector of one source row (all field types).
pub fn delete_vectors_by_source_sync(
    conn: &Connection,
    doc_type: &str,
    source_row_id: i64,
) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM vectors WHERE doc_type = ?1 AND source_row_id = ?2",
        params![doc_type, source_row_id],
    )
}

/// A scored ANN hit.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub source_row_id: i64,
    pub doc_id: String,
    /// Cosine distance; lower is closer.
    pub distance: f64,
}

/// Cosine-distance scan over one doc type, scoped to a project (its own rows
/// plus global ones), closest first.
pub fn search_vectors_sync(
    conn: &Connection,
    embedding: &[f32],
    doc_type: &str,
    project: &str,
    limit: usize,
    dim: usize,
) -> Result<Vec<VectorHit>> {
    check_dim(dim, embedding)?;
    let mut stmt = conn
        .prepare(
            "SELECT source_row_id, doc_id, vec_distance_cosine(embedding, ?1) AS distance
             FROM vectors
             WHERE doc_type = ?2 AND (project = ?3 OR scope = 'global')
             ORDER BY distance
             LIMIT ?4",
        )
        .map_err(LoreError::from)?;
    let rows = stmt
        .query_map(
            params![
                embedding_to_bytes(embedding),
                doc_type,
                project,
                limit as i64
            ],
            |row| {
                Ok(VectorHit {
                    source_row_id: row.get(0)?,
                    doc_id: row.get(1)?,
                    distance: row.get(2)?,
                })
            },
        )
        .map_err(LoreError::from)?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

/// Total stored vectors (observability probe).
pub fn count_vectors_sync(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM vectors", [], |row| row.get(0))
}
