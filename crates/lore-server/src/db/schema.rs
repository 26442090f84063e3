// crates/lore-server/src/db/schema.rs
// Database schema and ordered, idempotent schema steps
//
// The schema here is the target end-state: base tables, external-content
// FTS5 tables kept in sync by triggers, and sqlite-vec vec0 tables created at
// the configured embedding dimension. An earlier generation of this schema
// used a contentless FTS table ("search_index") and a hand-rolled vector
// table ("embeddings_index") that both required manual rebuilds; databases
// still on that generation are rejected at open rather than migrated.

use anyhow::Result;
use rusqlite::Connection;

use super::migration_helpers::{add_column_if_missing, table_exists};

/// Names of the retired first-generation tables. Their presence means the
/// database predates the current schema and must not be opened.
const LEGACY_TABLES: [&str; 2] = ["search_index", "embeddings_index"];

/// Run all schema steps at the given embedding dimension.
///
/// Called during pool creation. Idempotent: every step checks for existing
/// tables/columns before making changes. Fails fast (and the open fails with
/// it) when the database is on the retired legacy schema or was created with
/// a different embedding dimension.
pub fn run_all_migrations(conn: &Connection, embedding_dim: usize) -> Result<()> {
    reject_legacy_schema(conn)?;

    // Base tables
    conn.execute_batch(SCHEMA)?;

    // Steps in order. Column backfills must land before the FTS tables that
    // index them.
    migrate_pattern_recommendation(conn)?;
    create_fts_tables(conn)?;
    create_vector_tables(conn, embedding_dim)?;
    record_embedding_dim(conn, embedding_dim)?;

    Ok(())
}

/// Databases created before patterns carried a recommendation column get it
/// here; CREATE TABLE IF NOT EXISTS never alters an existing table.
fn migrate_pattern_recommendation(conn: &Connection) -> Result<()> {
    if !table_exists(conn, "patterns") {
        return Ok(());
    }
    add_column_if_missing(conn, "patterns", "recommendation", "TEXT")
}

/// Refuse to open a database still on the first-generation schema.
pub fn reject_legacy_schema(conn: &Connection) -> Result<()> {
    for name in LEGACY_TABLES {
        if table_exists(conn, name) {
            anyhow::bail!(
                "database contains retired table '{}'; this build only opens \
                 databases on the trigger-synced FTS schema",
                name
            );
        }
    }
    Ok(())
}

/// The embedding dimension is read once at open and pinned in schema_meta.
/// Opening the same database with a different dimension is an error: vec0
/// tables cannot be altered in place and silently truncating vectors would
/// corrupt every similarity ranking.
fn record_embedding_dim(conn: &Connection, embedding_dim: usize) -> Result<()> {
    let stored: Option<String> = conn
        .query_row(
            "SELECT value FROM schema_meta WHERE key = 'embedding_dim'",
            [],
            |row| row.get(0),
        )
        .ok();

    match stored {
        Some(value) => {
            let stored_dim: usize = value.parse().unwrap_or(0);
            if stored_dim != embedding_dim {
                anyhow::bail!(
                    "database was created with embedding dimension {} but config requests {}",
                    stored_dim,
                    embedding_dim
                );
            }
            Ok(())
        }
        None => {
            conn.execute(
                "INSERT INTO schema_meta (key, value) VALUES ('embedding_dim', ?1)",
                [embedding_dim.to_string()],
            )?;
            Ok(())
        }
    }
}

/// Read the pinned embedding dimension (None before first open completes).
pub fn stored_embedding_dim(conn: &Connection) -> Option<usize> {
    conn.query_row(
        "SELECT value FROM schema_meta WHERE key = 'embedding_dim'",
        [],
        |row| row.get::<_, String>(0),
    )
    .ok()
    .and_then(|v| v.parse().ok())
}

/// Create external-content FTS5 tables and their sync triggers.
///
/// Each searchable base table gets one FTS table over its text columns; the
/// triggers keep the index current inside the same transaction as the base
/// write, which is what lets bm25() ranking stay consistent with reads.
fn create_fts_tables(conn: &Connection) -> Result<()> {
    if !table_exists(conn, "observations_fts") {
        tracing::info!("Creating full-text search tables");
    }
    conn.execute_batch(FTS_SCHEMA)?;
    Ok(())
}

/// Create the vec0 virtual tables at the configured dimension.
///
/// Virtual tables cannot be altered, so the dimension is baked into the
/// CREATE statement; `record_embedding_dim` guards against re-opening with a
/// different value.
fn create_vector_tables(conn: &Connection, embedding_dim: usize) -> Result<()> {
    if !table_exists(conn, "vectors") {
        tracing::info!("Creating vector tables at dimension {}", embedding_dim);
        conn.execute(
            &format!(
                "CREATE VIRTUAL TABLE vectors USING vec0(
                    embedding float[{}],
                    +doc_id TEXT,
                    +source_row_id INTEGER,
                    +doc_type TEXT,
                    +field_type TEXT,
                    +project TEXT,
                    +scope TEXT,
                    +model_version TEXT
                )",
                embedding_dim
            ),
            [],
        )?;
    }

    if !table_exists(conn, "chunk_vectors") {
        conn.execute(
            &format!(
                "CREATE VIRTUAL TABLE chunk_vectors USING vec0(
                    embedding float[{}],
                    +hash TEXT,
                    +seq INTEGER
                )",
                embedding_dim
            ),
            [],
        )?;
    }

    Ok(())
}

/// Base tables. Epoch columns are milliseconds since the UNIX epoch; JSON
/// arrays and maps are stored as TEXT; enum columns carry CHECK constraints
/// matching the string encodings in lore-types.
pub const SCHEMA: &str = r#"
-- ═══════════════════════════════════════
-- META
-- ═══════════════════════════════════════
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- ═══════════════════════════════════════
-- SESSIONS
-- ═══════════════════════════════════════
CREATE TABLE IF NOT EXISTS sdk_sessions (
    id INTEGER PRIMARY KEY,
    external_session_id TEXT UNIQUE NOT NULL,
    project TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'active'
        CHECK (status IN ('active', 'completed', 'failed')),
    started_at_epoch INTEGER NOT NULL,
    completed_at_epoch INTEGER,
    prompt_counter INTEGER NOT NULL DEFAULT 0,
    initial_prompt TEXT
);
CREATE INDEX IF NOT EXISTS idx_sessions_project ON sdk_sessions(project);

-- ═══════════════════════════════════════
-- OBSERVATIONS
-- ═══════════════════════════════════════
CREATE TABLE IF NOT EXISTS observations (
    id INTEGER PRIMARY KEY,
    session_id INTEGER NOT NULL REFERENCES sdk_sessions(id),
    project TEXT NOT NULL DEFAULT '',
    scope TEXT CHECK (scope IN ('project', 'global')),
    obs_type TEXT NOT NULL
        CHECK (obs_type IN ('decision', 'bugfix', 'feature', 'refactor', 'discovery', 'change')),
    title TEXT,
    subtitle TEXT,
    narrative TEXT,
    facts TEXT NOT NULL DEFAULT '[]',
    concepts TEXT NOT NULL DEFAULT '[]',
    files_read TEXT NOT NULL DEFAULT '[]',
    files_modified TEXT NOT NULL DEFAULT '[]',
    file_mtimes TEXT NOT NULL DEFAULT '{}',
    prompt_number INTEGER,
    created_at_epoch INTEGER NOT NULL,
    importance_score REAL NOT NULL DEFAULT 1.0,
    user_feedback INTEGER NOT NULL DEFAULT 0 CHECK (user_feedback IN (-1, 0, 1)),
    retrieval_count INTEGER NOT NULL DEFAULT 0,
    last_retrieved_at_epoch INTEGER,
    score_updated_at_epoch INTEGER,
    is_superseded INTEGER NOT NULL DEFAULT 0,
    is_archived INTEGER NOT NULL DEFAULT 0,
    archived_at_epoch INTEGER,
    archived_reason TEXT
);
CREATE INDEX IF NOT EXISTS idx_obs_project_created
    ON observations(project, created_at_epoch DESC);
CREATE INDEX IF NOT EXISTS idx_obs_project_flags
    ON observations(project, is_archived, is_superseded);
CREATE INDEX IF NOT EXISTS idx_obs_score_updated
    ON observations(score_updated_at_epoch);

-- ═══════════════════════════════════════
-- CONFLICTS & RELATIONS
-- ═══════════════════════════════════════
CREATE TABLE IF NOT EXISTS observation_conflicts (
    id INTEGER PRIMARY KEY,
    newer_obs_id INTEGER NOT NULL,
    older_obs_id INTEGER NOT NULL,
    conflict_type TEXT NOT NULL
        CHECK (conflict_type IN ('superseded', 'contradicts', 'outdated_pattern')),
    resolution TEXT NOT NULL DEFAULT 'prefer_newer'
        CHECK (resolution IN ('prefer_newer', 'prefer_older', 'manual')),
    reason TEXT,
    detected_at_epoch INTEGER NOT NULL,
    resolved INTEGER NOT NULL DEFAULT 0,
    resolved_at_epoch INTEGER,
    CHECK (newer_obs_id != older_obs_id)
);
CREATE INDEX IF NOT EXISTS idx_conflicts_older ON observation_conflicts(older_obs_id);
CREATE INDEX IF NOT EXISTS idx_conflicts_newer ON observation_conflicts(newer_obs_id);
CREATE INDEX IF NOT EXISTS idx_conflicts_detected ON observation_conflicts(detected_at_epoch);

CREATE TABLE IF NOT EXISTS observation_relations (
    id INTEGER PRIMARY KEY,
    source_id INTEGER NOT NULL,
    target_id INTEGER NOT NULL,
    relation_type TEXT NOT NULL
        CHECK (relation_type IN ('causes', 'fixes', 'supersedes', 'depends_on', 'relates_to',
                                 'similar_to', 'contradicts', 'reinforces', 'explains',
                                 'part_of', 'prefers_over')),
    confidence REAL NOT NULL DEFAULT 0.5 CHECK (confidence >= 0.0 AND confidence <= 1.0),
    detection_source TEXT NOT NULL DEFAULT 'manual'
        CHECK (detection_source IN ('concept_overlap', 'file_overlap', 'pattern_analysis', 'manual')),
    reason TEXT,
    created_at_epoch INTEGER NOT NULL,
    UNIQUE(source_id, target_id, relation_type),
    CHECK (source_id != target_id)
);
CREATE INDEX IF NOT EXISTS idx_relations_source ON observation_relations(source_id);
CREATE INDEX IF NOT EXISTS idx_relations_target ON observation_relations(target_id);

-- ═══════════════════════════════════════
-- PATTERNS
-- ═══════════════════════════════════════
CREATE TABLE IF NOT EXISTS patterns (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    pattern_type TEXT NOT NULL
        CHECK (pattern_type IN ('bug', 'refactor', 'architecture', 'anti-pattern', 'best-practice')),
    description TEXT,
    recommendation TEXT,
    signature TEXT NOT NULL DEFAULT '[]',
    frequency INTEGER NOT NULL DEFAULT 1,
    projects TEXT NOT NULL DEFAULT '[]',
    observation_ids TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'active'
        CHECK (status IN ('active', 'deprecated', 'merged')),
    merged_into_id INTEGER,
    confidence REAL NOT NULL DEFAULT 0.5 CHECK (confidence >= 0.0 AND confidence <= 1.0),
    last_seen_at_epoch INTEGER NOT NULL,
    created_at_epoch INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_patterns_status ON patterns(status);
CREATE INDEX IF NOT EXISTS idx_patterns_type ON patterns(pattern_type);
CREATE INDEX IF NOT EXISTS idx_patterns_name ON patterns(name);

-- ═══════════════════════════════════════
-- SCORING
-- ═══════════════════════════════════════
CREATE TABLE IF NOT EXISTS concept_weights (
    concept TEXT PRIMARY KEY,
    weight REAL NOT NULL,
    updated_at_epoch INTEGER NOT NULL
);

-- ═══════════════════════════════════════
-- SUMMARIES & PROMPTS
-- ═══════════════════════════════════════
CREATE TABLE IF NOT EXISTS session_summaries (
    id INTEGER PRIMARY KEY,
    session_id INTEGER NOT NULL REFERENCES sdk_sessions(id),
    project TEXT NOT NULL DEFAULT '',
    request TEXT,
    investigated TEXT,
    learned TEXT,
    completed TEXT,
    next_steps TEXT,
    notes TEXT,
    created_at_epoch INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_summaries_project ON session_summaries(project, created_at_epoch DESC);

CREATE TABLE IF NOT EXISTS user_prompts (
    id INTEGER PRIMARY KEY,
    session_external_id TEXT NOT NULL,
    prompt_number INTEGER NOT NULL,
    prompt_text TEXT NOT NULL,
    matched_observations TEXT NOT NULL DEFAULT '[]',
    created_at_epoch INTEGER NOT NULL,
    UNIQUE(session_external_id, prompt_number)
);
CREATE INDEX IF NOT EXISTS idx_prompts_created ON user_prompts(created_at_epoch DESC);

-- ═══════════════════════════════════════
-- CONTENT-ADDRESSED DOCUMENTS
-- ═══════════════════════════════════════
CREATE TABLE IF NOT EXISTS content (
    hash TEXT PRIMARY KEY,
    doc TEXT NOT NULL,
    created_at_epoch INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS documents (
    id INTEGER PRIMARY KEY,
    collection TEXT NOT NULL,
    path TEXT NOT NULL,
    hash TEXT NOT NULL REFERENCES content(hash),
    title TEXT,
    active INTEGER NOT NULL DEFAULT 1,
    created_at_epoch INTEGER NOT NULL,
    updated_at_epoch INTEGER NOT NULL,
    UNIQUE(collection, path)
);
CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection, active);
CREATE INDEX IF NOT EXISTS idx_documents_hash ON documents(hash);

CREATE TABLE IF NOT EXISTS content_chunks (
    hash TEXT NOT NULL REFERENCES content(hash) ON DELETE CASCADE,
    seq INTEGER NOT NULL,
    pos INTEGER NOT NULL DEFAULT 0,
    model TEXT,
    PRIMARY KEY (hash, seq)
);

-- ═══════════════════════════════════════
-- INDEXED JSONL SESSIONS
-- ═══════════════════════════════════════
CREATE TABLE IF NOT EXISTS indexed_sessions (
    id INTEGER PRIMARY KEY,
    workstation_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    exchange_count INTEGER NOT NULL DEFAULT 0,
    tool_call_count INTEGER NOT NULL DEFAULT 0,
    file_mtime INTEGER,
    content TEXT NOT NULL DEFAULT '',
    indexed_at_epoch INTEGER NOT NULL,
    UNIQUE(workstation_id, project_id, session_id)
);
"#;

/// FTS5 external-content tables and sync triggers. Separate from SCHEMA so
/// the step can log its one-time creation.
const FTS_SCHEMA: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS observations_fts USING fts5(
    title, subtitle, narrative,
    content='observations', content_rowid='id',
    tokenize='porter unicode61 remove_diacritics 1'
);
CREATE TRIGGER IF NOT EXISTS observations_fts_ai AFTER INSERT ON observations BEGIN
    INSERT INTO observations_fts(rowid, title, subtitle, narrative)
    VALUES (new.id, new.title, new.subtitle, new.narrative);
END;
CREATE TRIGGER IF NOT EXISTS observations_fts_ad AFTER DELETE ON observations BEGIN
    INSERT INTO observations_fts(observations_fts, rowid, title, subtitle, narrative)
    VALUES ('delete', old.id, old.title, old.subtitle, old.narrative);
END;
CREATE TRIGGER IF NOT EXISTS observations_fts_au AFTER UPDATE ON observations BEGIN
    INSERT INTO observations_fts(observations_fts, rowid, title, subtitle, narrative)
    VALUES ('delete', old.id, old.title, old.subtitle, old.narrative);
    INSERT INTO observations_fts(rowid, title, subtitle, narrative)
    VALUES (new.id, new.title, new.subtitle, new.narrative);
END;

CREATE VIRTUAL TABLE IF NOT EXISTS session_summaries_fts USING fts5(
    request, investigated, learned, completed, next_steps, notes,
    content='session_summaries', content_rowid='id',
    tokenize='porter unicode61 remove_diacritics 1'
);
CREATE TRIGGER IF NOT EXISTS session_summaries_fts_ai AFTER INSERT ON session_summaries BEGIN
    INSERT INTO session_summaries_fts(rowid, request, investigated, learned, completed, next_steps, notes)
    VALUES (new.id, new.request, new.investigated, new.learned, new.completed, new.next_steps, new.notes);
END;
CREATE TRIGGER IF NOT EXISTS session_summaries_fts_ad AFTER DELETE ON session_summaries BEGIN
    INSERT INTO session_summaries_fts(session_summaries_fts, rowid, request, investigated, learned, completed, next_steps, notes)
    VALUES ('delete', old.id, old.request, old.investigated, old.learned, old.completed, old.next_steps, old.notes);
END;
CREATE TRIGGER IF NOT EXISTS session_summaries_fts_au AFTER UPDATE ON session_summaries BEGIN
    INSERT INTO session_summaries_fts(session_summaries_fts, rowid, request, investigated, learned, completed, next_steps, notes)
    VALUES ('delete', old.id, old.request, old.investigated, old.learned, old.completed, old.next_steps, old.notes);
    INSERT INTO session_summaries_fts(rowid, request, investigated, learned, completed, next_steps, notes)
    VALUES (new.id, new.request, new.investigated, new.learned, new.completed, new.next_steps, new.notes);
END;

CREATE VIRTUAL TABLE IF NOT EXISTS patterns_fts USING fts5(
    name, description, recommendation,
    content='patterns', content_rowid='id',
    tokenize='porter unicode61 remove_diacritics 1'
);
CREATE TRIGGER IF NOT EXISTS patterns_fts_ai AFTER INSERT ON patterns BEGIN
    INSERT INTO patterns_fts(rowid, name, description, recommendation)
    VALUES (new.id, new.name, new.description, new.recommendation);
END;
CREATE TRIGGER IF NOT EXISTS patterns_fts_ad AFTER DELETE ON patterns BEGIN
    INSERT INTO patterns_fts(patterns_fts, rowid, name, description, recommendation)
    VALUES ('delete', old.id, old.name, old.description, old.recommendation);
END;
CREATE TRIGGER IF NOT EXISTS patterns_fts_au AFTER UPDATE ON patterns BEGIN
    INSERT INTO patterns_fts(patterns_fts, rowid, name, description, recommendation)
    VALUES ('delete', old.id, old.name, old.description, old.recommendation);
    INSERT INTO patterns_fts(rowid, name, description, recommendation)
    VALUES (new.id, new.name, new.description, new.recommendation);
END;

CREATE VIRTUAL TABLE IF NOT EXISTS user_prompts_fts USING fts5(
    prompt_text,
    content='user_prompts', content_rowid='id',
    tokenize='porter unicode61 remove_diacritics 1'
);
CREATE TRIGGER IF NOT EXISTS user_prompts_fts_ai AFTER INSERT ON user_prompts BEGIN
    INSERT INTO user_prompts_fts(rowid, prompt_text) VALUES (new.id, new.prompt_text);
END;
CREATE TRIGGER IF NOT EXISTS user_prompts_fts_ad AFTER DELETE ON user_prompts BEGIN
    INSERT INTO user_prompts_fts(user_prompts_fts, rowid, prompt_text)
    VALUES ('delete', old.id, old.prompt_text);
END;
CREATE TRIGGER IF NOT EXISTS user_prompts_fts_au AFTER UPDATE ON user_prompts BEGIN
    INSERT INTO user_prompts_fts(user_prompts_fts, rowid, prompt_text)
    VALUES ('delete', old.id, old.prompt_text);
    INSERT INTO user_prompts_fts(rowid, prompt_text) VALUES (new.id, new.prompt_text);
END;

CREATE VIRTUAL TABLE IF NOT EXISTS documents_fts USING fts5(
    path, title,
    content='documents', content_rowid='id',
    tokenize='porter unicode61 remove_diacritics 1'
);
CREATE TRIGGER IF NOT EXISTS documents_fts_ai AFTER INSERT ON documents BEGIN
    INSERT INTO documents_fts(rowid, path, title) VALUES (new.id, new.path, new.title);
END;
CREATE TRIGGER IF NOT EXISTS documents_fts_ad AFTER DELETE ON documents BEGIN
    INSERT INTO documents_fts(documents_fts, rowid, path, title)
    VALUES ('delete', old.id, old.path, old.title);
END;
CREATE TRIGGER IF NOT EXISTS documents_fts_au AFTER UPDATE ON documents BEGIN
    INSERT INTO documents_fts(documents_fts, rowid, path, title)
    VALUES ('delete', old.id, old.path, old.title);
    INSERT INTO documents_fts(rowid, path, title) VALUES (new.id, new.path, new.title);
END;

CREATE VIRTUAL TABLE IF NOT EXISTS indexed_sessions_fts USING fts5(
    content,
    content='indexed_sessions', content_rowid='id',
    tokenize='porter unicode61 remove_diacritics 1'
);
CREATE TRIGGER IF NOT EXISTS indexed_sessions_fts_ai AFTER INSERT ON indexed_sessions BEGIN
    INSERT INTO indexed_sessions_fts(rowid, content) VALUES (new.id, new.content);
END;
CREATE TRIGGER IF NOT EXISTS indexed_sessions_fts_ad AFTER DELETE ON indexed_sessions BEGIN
    INSERT INTO indexed_sessions_fts(indexed_sessions_fts, rowid, content)
    VALUES ('delete', old.id, old.content);
END;
CREATE TRIGGER IF NOT EXISTS indexed_sessions_fts_au AFTER UPDATE ON indexed_sessions BEGIN
    INSERT INTO indexed_sessions_fts(indexed_sessions_fts, rowid, content)
    VALUES ('delete', old.id, old.content);
    INSERT INTO indexed_sessions_fts(rowid, content) VALUES (new.id, new.content);
END;
"#;
