// crates/lore-types/src/lib.rs

//! Shared data contracts between the Lore storage engine and its clients.
//!
//! This crate provides the core domain model for:
//! - **Sessions**: one assistant conversation and its prompt counter
//! - **Observations**: atomic facts learned during a session
//! - **Conflicts / Relations**: supersession and typed edges between observations
//! - **Patterns**: recurring signatures promoted from in-memory candidates
//! - **Summaries / Prompts / Documents**: the remaining searchable artifacts
//!
//! All enumerations are closed sets with explicit string encodings that match
//! the database CHECK constraints. Types here must stay free of native-only
//! dependencies so ingestion front-ends can share them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ===================================================
// ENUMERATIONS
// ===================================================

/// Lifecycle status of an assistant session.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::IntoStaticStr, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// Visibility of an observation: local to its project or surfaced everywhere.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::IntoStaticStr, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Scope {
    Project,
    Global,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// Kind of fact an observation records.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::IntoStaticStr, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ObservationType {
    Decision,
    Bugfix,
    Feature,
    Refactor,
    Discovery,
    Change,
}

impl ObservationType {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// How two observations conflict.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::IntoStaticStr, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConflictType {
    Superseded,
    Contradicts,
    OutdatedPattern,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// Which side of a conflict wins.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::IntoStaticStr, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConflictResolution {
    PreferNewer,
    PreferOlder,
    Manual,
}

impl ConflictResolution {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// Typed directed edge between observations.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::IntoStaticStr, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RelationType {
    Causes,
    Fixes,
    Supersedes,
    DependsOn,
    RelatesTo,
    SimilarTo,
    Contradicts,
    Reinforces,
    Explains,
    PartOf,
    PrefersOver,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// What produced a relation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::IntoStaticStr, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DetectionSource {
    ConceptOverlap,
    FileOverlap,
    PatternAnalysis,
    Manual,
}

impl DetectionSource {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// Category of a promoted pattern.
///
/// Encodings are kebab-case to match the table CHECK constraint
/// (`'anti-pattern'`, `'best-practice'`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::IntoStaticStr, strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum PatternType {
    Bug,
    Refactor,
    Architecture,
    AntiPattern,
    BestPractice,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// Lifecycle status of a pattern.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::IntoStaticStr, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PatternStatus {
    Active,
    Deprecated,
    Merged,
}

impl PatternStatus {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// Sort order for batched observation fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderBy {
    DateAsc,
    DateDesc,
    /// Importance first, recency as tiebreak. The default.
    Importance,
}

impl Default for OrderBy {
    fn default() -> Self {
        OrderBy::Importance
    }
}

// ===================================================
// SESSIONS
// ===================================================

/// One assistant conversation, keyed externally by the caller's session id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    /// Caller-supplied id; unique for the lifetime of the database.
    pub external_session_id: String,
    pub project: String,
    pub status: SessionStatus,
    pub started_at_epoch: i64,
    pub completed_at_epoch: Option<i64>,
    pub prompt_counter: i64,
    pub initial_prompt: Option<String>,
}

// ===================================================
// OBSERVATIONS
// ===================================================

/// One learned fact, as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub id: i64,
    pub session_id: i64,
    pub project: String,
    /// None means "not derived yet"; readers treat it as project-local.
    pub scope: Option<Scope>,
    pub obs_type: ObservationType,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub narrative: Option<String>,
    pub facts: Vec<String>,
    pub concepts: Vec<String>,
    pub files_read: Vec<String>,
    pub files_modified: Vec<String>,
    pub file_mtimes: HashMap<String, i64>,
    pub prompt_number: Option<i64>,
    pub created_at_epoch: i64,
    pub importance_score: f64,
    /// -1, 0 or +1.
    pub user_feedback: i64,
    pub retrieval_count: i64,
    pub last_retrieved_at_epoch: Option<i64>,
    pub score_updated_at_epoch: Option<i64>,
    pub is_superseded: bool,
    pub is_archived: bool,
    pub archived_at_epoch: Option<i64>,
    pub archived_reason: Option<String>,
}

/// Caller-parsed observation content, before insertion assigns identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservationDraft {
    pub obs_type: Option<ObservationType>,
    /// Explicit scope wins over concept-based derivation.
    pub scope: Option<Scope>,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub narrative: Option<String>,
    #[serde(default)]
    pub facts: Vec<String>,
    #[serde(default)]
    pub concepts: Vec<String>,
    #[serde(default)]
    pub files_read: Vec<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub file_mtimes: HashMap<String, i64>,
}

/// Partial update for an observation. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservationPatch {
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub narrative: Option<String>,
    pub facts: Option<Vec<String>>,
    pub concepts: Option<Vec<String>>,
    pub scope: Option<Scope>,
    pub importance_score: Option<f64>,
    pub user_feedback: Option<i64>,
}

impl ObservationPatch {
    /// True when no field is present.
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.subtitle.is_none()
            && self.narrative.is_none()
            && self.facts.is_none()
            && self.concepts.is_none()
            && self.scope.is_none()
            && self.importance_score.is_none()
            && self.user_feedback.is_none()
    }
}

// ===================================================
// CONFLICTS & RELATIONS
// ===================================================

/// A recorded supersession relationship between two observations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub id: i64,
    pub newer_obs_id: i64,
    pub older_obs_id: i64,
    pub conflict_type: ConflictType,
    pub resolution: ConflictResolution,
    pub reason: Option<String>,
    pub detected_at_epoch: i64,
    pub resolved: bool,
    pub resolved_at_epoch: Option<i64>,
}

/// A typed directed edge between two observations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relation {
    pub id: i64,
    pub source_id: i64,
    pub target_id: i64,
    pub relation_type: RelationType,
    /// In [0, 1].
    pub confidence: f64,
    pub detection_source: DetectionSource,
    pub reason: Option<String>,
    pub created_at_epoch: i64,
}

/// A relation joined with endpoint titles and types for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationDetail {
    pub relation: Relation,
    pub source_title: Option<String>,
    pub source_type: ObservationType,
    pub target_title: Option<String>,
    pub target_type: ObservationType,
}

// ===================================================
// PATTERNS
// ===================================================

/// A recurring signature promoted from the in-memory candidate pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub id: i64,
    pub name: String,
    pub pattern_type: PatternType,
    pub description: Option<String>,
    pub recommendation: Option<String>,
    /// Ordered concept tokens.
    pub signature: Vec<String>,
    pub frequency: i64,
    pub projects: Vec<String>,
    pub observation_ids: Vec<i64>,
    pub status: PatternStatus,
    pub merged_into_id: Option<i64>,
    pub confidence: f64,
    pub last_seen_at_epoch: i64,
    pub created_at_epoch: i64,
}

/// Aggregate pattern statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternStats {
    pub total: i64,
    pub by_status: HashMap<String, i64>,
    pub by_type: HashMap<String, i64>,
    pub total_frequency: i64,
    pub avg_confidence: f64,
}

// ===================================================
// SUMMARIES & PROMPTS
// ===================================================

/// The six parsed fields of a session summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SummaryFields {
    pub request: Option<String>,
    pub investigated: Option<String>,
    pub learned: Option<String>,
    pub completed: Option<String>,
    pub next_steps: Option<String>,
    pub notes: Option<String>,
}

/// A stored session summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: i64,
    pub session_id: i64,
    pub project: String,
    pub fields: SummaryFields,
    pub created_at_epoch: i64,
}

/// A stored user prompt, unique per (session, prompt number).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPrompt {
    pub id: i64,
    pub session_external_id: String,
    pub prompt_number: i64,
    pub prompt_text: String,
    pub matched_observations: Vec<i64>,
    pub created_at_epoch: i64,
}

// ===================================================
// DOCUMENTS
// ===================================================

/// A document in a collection, pointing at content-addressed storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    pub collection: String,
    pub path: String,
    /// Lowercase hex SHA-256 of the body.
    pub hash: String,
    pub title: Option<String>,
    pub active: bool,
    pub created_at_epoch: i64,
    pub updated_at_epoch: i64,
}

/// A chunk of a content body with its embedding position metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkInsert {
    pub seq: i64,
    /// Byte offset of the chunk within the body.
    pub pos: i64,
    pub model: String,
    pub embedding: Vec<f32>,
}

/// A chunk hit from vector search, joined to its active document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkHit {
    pub hash: String,
    pub seq: i64,
    pub path: String,
    pub title: Option<String>,
    /// Cosine distance; lower is closer.
    pub distance: f64,
}

// ===================================================
// INDEXED SESSIONS
// ===================================================

/// Snapshot of a parsed JSONL session file, ready for text search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedSession {
    pub id: i64,
    pub workstation_id: String,
    pub project_id: String,
    pub session_id: String,
    pub exchange_count: i64,
    pub tool_call_count: i64,
    pub file_mtime: Option<i64>,
    /// Concatenated user + assistant text.
    pub content: String,
    pub indexed_at_epoch: i64,
}
