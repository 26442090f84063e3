// crates/lore-server/src/db/documents.rs
// Content-addressed document storage: immutable bodies keyed by SHA-256,
// documents mapping (collection, path) onto a hash, and per-chunk embeddings.

use lore_types::{ChunkHit, ChunkInsert, Document};
use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};

use super::{log_and_discard, now_ms};
use crate::error::{LoreError, Result};
use crate::search::embedding_to_bytes;

const DOCUMENT_COLUMNS: &str =
    "id, collection, path, hash, title, active, created_at_epoch, updated_at_epoch";

/// Lowercase hex SHA-256 of the body's UTF-8 bytes.
pub fn content_hash(body: &str) -> String {
    let digest = Sha256::digest(body.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn parse_document_row(row: &rusqlite::Row) -> rusqlite::Result<Document> {
    Ok(Document {
        id: row.get(0)?,
        collection: row.get(1)?,
        path: row.get(2)?,
        hash: row.get(3)?,
        title: row.get(4)?,
        active: row.get::<_, i64>(5)? != 0,
        created_at_epoch: row.get(6)?,
        updated_at_epoch: row.get(7)?,
    })
}

/// Store a document body and point (collection, path) at it.
///
/// The content row is insert-or-ignore (an existing hash means the body is
/// already stored; bodies are immutable). The documents row upserts on
/// (collection, path), refreshing hash, title, active flag, and updated
/// stamp. Returns the stored document.
pub fn upsert_document_sync(
    conn: &Connection,
    collection: &str,
    path: &str,
    title: Option<&str>,
    body: &str,
) -> rusqlite::Result<Document> {
    let hash = content_hash(body);
    let now = now_ms();
    let tx = conn.unchecked_transaction()?;

    tx.execute(
        "INSERT INTO content (hash, doc, created_at_epoch) VALUES (?1, ?2, ?3)
         ON CONFLICT(hash) DO NOTHING",
        params![hash, body, now],
    )?;

    let document = tx.query_row(
        &format!(
            "INSERT INTO documents
                (collection, path, hash, title, active, created_at_epoch, updated_at_epoch)
             VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)
             ON CONFLICT(collection, path) DO UPDATE SET
                 hash = excluded.hash,
                 title = excluded.title,
                 active = 1,
                 updated_at_epoch = excluded.updated_at_epoch
             RETURNING {DOCUMENT_COLUMNS}"
        ),
        params![collection, path, hash, title, now],
        parse_document_row,
    )?;

    tx.commit()?;
    Ok(document)
}

/// Look up a document by (collection, path). None when missing.
pub fn get_document_sync(
    conn: &Connection,
    collection: &str,
    path: &str,
) -> rusqlite::Result<Option<Document>> {
    match conn.query_row(
        &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE collection = ?1 AND path = ?2"),
        params![collection, path],
        parse_document_row,
    ) {
        Ok(d) => Ok(Some(d)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Fetch a stored body by hash. None when missing.
pub fn get_content_sync(conn: &Connection, hash: &str) -> rusqlite::Result<Option<String>> {
    match conn.query_row("SELECT doc FROM content WHERE hash = ?1", [hash], |row| {
        row.get(0)
    }) {
        Ok(body) => Ok(Some(body)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Deactivate a document without touching its content. False when missing.
pub fn deactivate_document_sync(
    conn: &Connection,
    collection: &str,
    path: &str,
) -> rusqlite::Result<bool> {
    let updated = conn.execute(
        "UPDATE documents SET active = 0, updated_at_epoch = ?1
         WHERE collection = ?2 AND path = ?3",
        params![now_ms(), collection, path],
    )?;
    Ok(updated > 0)
}

/// Active documents in a collection.
pub fn list_documents_sync(
    conn: &Connection,
    collection: &str,
) -> rusqlite::Result<Vec<Document>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {DOCUMENT_COLUMNS} FROM documents
         WHERE collection = ?1 AND active = 1
         ORDER BY path ASC"
    ))?;
    let rows = stmt
        .query_map([collection], parse_document_row)?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

/// Replace all chunks for a hash in one transaction: chunk metadata rows and
/// their embeddings either all land or none do.
pub fn upsert_chunks_sync(
    conn: &Connection,
    hash: &str,
    chunks: &[ChunkInsert],
    dim: usize,
) -> Result<usize> {
    for chunk in chunks {
        if chunk.embedding.len() != dim {
            return Err(LoreError::DimensionMismatch {
                expected: dim,
                actual: chunk.embedding.len(),
            });
        }
    }

    let tx = conn.unchecked_transaction().map_err(LoreError::from)?;
    tx.execute("DELETE FROM content_chunks WHERE hash = ?1", [hash])
        .map_err(LoreError::from)?;
    tx.execute("DELETE FROM chunk_vectors WHERE hash = ?1", [hash])
        .map_err(LoreError::from)?;
    {
        let mut meta_stmt = tx
            .prepare("INSERT INTO content_chunks (hash, seq, pos, model) VALUES (?1, ?2, ?3, ?4)")
            .map_err(LoreError::from)?;
        let mut vec_stmt = tx
            .prepare("INSERT INTO chunk_vectors (embedding, hash, seq) VALUES (?1, ?2, ?3)")
            .map_err(LoreError::from)?;
        for chunk in chunks {
            meta_stmt
                .execute(params![hash, chunk.seq, chunk.pos, chunk.model])
                .map_err(LoreError::from)?;
            vec_stmt
                .execute(params![
                    embedding_to_bytes(&chunk.embedding),
                    hash,
                    chunk.seq
                ])
                .map_err(LoreError::from)?;
        }
    }
    tx.commit().map_err(LoreError::from)?;
    Ok(chunks.len())
}

/// Cosine-distance chunk search joined to active documents in a collection,
/// closest first.
pub fn search_chunks_sync(
    conn: &Connection,
    embedding: &[f32],
    collection: &str,
    limit: usize,
    dim: usize,
) -> Result<Vec<ChunkHit>> {
    if embedding.len() != dim {
        return Err(LoreError::DimensionMismatch {
            expected: dim,
            actual: embedding.len(),
        });
    }
    let mut stmt = conn
        .prepare(
            "SELECT cv.hash, cv.seq, d.path, d.title,
                    vec_distance_cosine(cv.embedding, ?1) AS distance
             FROM chunk_vectors cv
             JOIN documents d ON d.hash = cv.hash
             WHERE d.collection = ?2 AND d.active = 1
             ORDER BY distance
             LIMIT ?3",
        )
        .map_err(LoreError::from)?;
    let rows = stmt
        .query_map(
            params![embedding_to_bytes(embedding), collection, limit as i64],
            |row| {
                Ok(ChunkHit {
                    hash: row.get(0)?,
                    seq: row.get(1)?,
                    path: row.get(2)?,
                    title: row.get(3)?,
                    distance: row.get(4)?,
                })
            },
        )
        .map_err(LoreError::from)?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

/// Delete a content row. Chunk metadata cascades via FK; chunk embeddings
/// are purged in the same transaction (vec0 tables have no FK support).
/// False when the hash is missing or still referenced by a document.
pub fn delete_content_sync(conn: &Connection, hash: &str) -> rusqlite::Result<bool> {
    let referenced: i64 = conn.query_row(
        "SELECT COUNT(*) FROM documents WHERE hash = ?1",
        [hash],
        |row| row.get(0),
    )?;
    if referenced > 0 {
        return Ok(false);
    }
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM chunk_vectors WHERE hash = ?1", [hash])?;
    let deleted = tx.execute("DELETE FROM content WHERE hash = ?1", [hash])?;
    tx.commit()?;
    Ok(deleted > 0)
}

/// Full-text search over document paths and titles in a collection.
pub fn search_documents_sync(
    conn: &Connection,
    query: &str,
    collection: &str,
    limit: usize,
) -> rusqlite::Result<Vec<Document>> {
    let fts_query = query
        .split_whitespace()
        .map(|word| format!("\"{}\"", word.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ");
    if fts_query.is_empty() {
        return Ok(Vec::new());
    }

    let qualified = DOCUMENT_COLUMNS
        .split(", ")
        .map(|c| format!("d.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ");
    let result = conn
        .prepare(&format!(
            "SELECT {qualified} FROM documents_fts f
             JOIN documents d ON d.id = f.rowid
             WHERE documents_fts MATCH ?1 AND d.collection = ?2 AND d.active = 1
             ORDER BY bm25(documents_fts) ASC
             LIMIT ?3"
        ))
        .and_then(|mut stmt| {
            stmt.query_map(params![fts_query, collection, limit as i64], parse_document_row)
                .map(|rows| rows.filter_map(log_and_discard).collect::<Vec<_>>())
        });
    match result {
        Ok(rows) => Ok(rows),
        Err(e) => {
            tracing::debug!("document FTS search failed: {}", e);
            Ok(Vec::new())
        }
    }
}
