// crates/lore-server/src/store.rs
// The engine facade: owns the pool, the detector, the cleanup worker, and
// the health monitor, and wires the write path (session -> observation ->
// analysis -> links -> cleanup kick) and the hybrid read path.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use lore_types::{
    ChunkHit, ChunkInsert, Conflict, ConflictResolution, ConflictType, DetectionSource, Document,
    IndexedSession, Observation, ObservationDraft, ObservationPatch, OrderBy, Pattern,
    PatternStats, Relation, RelationDetail, RelationType, SessionStatus, SessionSummary,
    SummaryFields, UserPrompt,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::LoreConfig;
use crate::db::health::{HealthMonitor, HealthSnapshot};
use crate::db::pool::{DatabasePool, PoolStatus};
use crate::db::{self, CleanupJob, CleanupQueue, CleanupWorker, DeletedIdsCallback, VectorInsert};
use crate::detector::PatternDetector;
use crate::embedder::Embedder;
use crate::error::{LoreError, Result};
use crate::search::{
    distance_to_score, fuse_ranked, FusionCandidate, SearchHit, DEFAULT_FTS_WEIGHT,
    DEFAULT_VECTOR_WEIGHT,
};
use crate::{identity, jsonl};

/// How many recent same-project observations the write path inspects for
/// conflicts and relations.
const LINK_SCAN_LIMIT: usize = 50;

/// Shared concepts required before two observations are linked similar_to.
const MIN_SHARED_CONCEPTS: usize = 2;

/// The persistent memory store.
///
/// One `Store` owns one database and its background workers. Open it once at
/// startup, share it via `Arc`, and call [`Store::close`] on shutdown so the
/// workers drain their queues.
pub struct Store {
    pool: Arc<DatabasePool>,
    config: LoreConfig,
    detector: Arc<PatternDetector>,
    cleanup: CleanupQueue,
    health: HealthMonitor,
    embedder: Option<Arc<dyn Embedder>>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Store {
    /// Open the store at the configured database path.
    pub async fn open(config: LoreConfig) -> Result<Arc<Self>> {
        let path = config.store.resolved_db_path();
        Self::open_at(config, Some(path.as_path()), None, None).await
    }

    /// Open with an embedder for the vector side of hybrid search, and an
    /// optional callback fired with ids deleted by retention cleanup.
    pub async fn open_with(
        config: LoreConfig,
        embedder: Option<Arc<dyn Embedder>>,
        on_deleted: Option<DeletedIdsCallback>,
    ) -> Result<Arc<Self>> {
        let path = config.store.resolved_db_path();
        Self::open_at(config, Some(path.as_path()), embedder, on_deleted).await
    }

    /// Open an in-memory store (tests and ephemeral use).
    pub async fn open_in_memory(
        config: LoreConfig,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Result<Arc<Self>> {
        Self::open_at(config, None, embedder, None).await
    }

    async fn open_at(
        config: LoreConfig,
        path: Option<&Path>,
        embedder: Option<Arc<dyn Embedder>>,
        on_deleted: Option<DeletedIdsCallback>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let dim = config.store.embedding_dim;
        if let Some(ref e) = embedder {
            if e.dim() != dim {
                return Err(LoreError::Config(format!(
                    "embedder dimension {} does not match configured embedding_dim {}",
                    e.dim(),
                    dim
                )));
            }
        }

        let pool = match path {
            Some(p) => DatabasePool::open(p, config.store.max_conns, dim).await?,
            None => DatabasePool::open_in_memory(config.store.max_conns, dim).await?,
        };
        let pool = Arc::new(pool);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (cleanup, cleanup_rx) = CleanupQueue::new();
        let mut workers = Vec::new();

        workers.push(
            CleanupWorker::new(
                pool.clone(),
                cleanup_rx,
                shutdown_rx.clone(),
                config.store.max_per_project,
                config.store.prompt_global_cap,
                config.store.superseded_retention_days,
                on_deleted,
            )
            .spawn(),
        );

        // Freshly promoted patterns flow through a channel into the vector
        // index when an embedder is available.
        let on_new_pattern = match embedder.clone() {
            Some(embedder_for_patterns) => {
                let (tx, rx) = mpsc::unbounded_channel::<Pattern>();
                workers.push(spawn_pattern_vectorizer(
                    pool.clone(),
                    embedder_for_patterns,
                    dim,
                    rx,
                    shutdown_rx.clone(),
                ));
                Some(Arc::new(move |pattern: &Pattern| {
                    let _ = tx.send(pattern.clone());
                }) as crate::detector::NewPatternCallback)
            }
            None => None,
        };

        let detector = Arc::new(PatternDetector::new(
            pool.clone(),
            config.detector.clone(),
            on_new_pattern,
        ));
        workers.push(detector.spawn(shutdown_rx));

        let health = HealthMonitor::new(pool.clone(), config.store.health_cache_ttl());

        Ok(Arc::new(Self {
            pool,
            config,
            detector,
            cleanup,
            health,
            embedder,
            shutdown_tx,
            workers: Mutex::new(workers),
        }))
    }

    /// Signal shutdown, wait for background workers to drain, close the pool.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        let workers = {
            let mut guard = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::warn!("background worker ended abnormally: {}", e);
            }
        }
        self.pool.close();
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Idempotently ensure a session exists; returns its surrogate id.
    pub async fn ensure_session(&self, external_session_id: &str, project: &str) -> Result<i64> {
        let external = require_external_id(external_session_id)?;
        let project = project.to_string();
        self.pool
            .run_with_retry("ensure_session", move |conn| {
                db::ensure_session_sync(conn, &external, &project).map_err(Into::into)
            })
            .await
    }

    /// Idempotently create a session with an optional initial prompt.
    pub async fn create_session(
        &self,
        external_session_id: &str,
        project: &str,
        initial_prompt: Option<&str>,
    ) -> Result<lore_types::Session> {
        let external = require_external_id(external_session_id)?;
        let project = project.to_string();
        let prompt = initial_prompt.map(|s| s.to_string());
        self.pool
            .run_with_retry("create_session", move |conn| {
                db::create_session_sync(conn, &external, &project, prompt.as_deref())
                    .map_err(Into::into)
            })
            .await
    }

    /// Atomically bump the prompt counter; None when the session is unknown.
    pub async fn increment_prompt_counter(
        &self,
        external_session_id: &str,
    ) -> Result<Option<i64>> {
        let external = require_external_id(external_session_id)?;
        self.pool
            .run_labeled("increment_prompt_counter", move |conn| {
                let session = match db::get_session_sync(conn, &external)? {
                    Some(s) => s,
                    None => return Ok(None),
                };
                db::increment_prompt_counter_sync(conn, session.id).map_err(Into::into)
            })
            .await
    }

    /// Mark a session completed or failed.
    pub async fn close_session(
        &self,
        external_session_id: &str,
        status: SessionStatus,
    ) -> Result<bool> {
        let external = require_external_id(external_session_id)?;
        self.pool
            .run_labeled("close_session", move |conn| {
                db::close_session_sync(conn, &external, status).map_err(Into::into)
            })
            .await
    }

    // ========================================================================
    // Observations: write path
    // ========================================================================

    /// Store one observation: ensure the session, insert the row, analyze it
    /// for patterns, record any detected conflicts/relations, write its
    /// embedding, and kick the retention cleanup. Extra discovery tokens are
    /// folded into the draft's concepts before scope derivation. Returns
    /// (id, epoch).
    pub async fn store_observation(
        &self,
        external_session_id: &str,
        project: &str,
        mut draft: ObservationDraft,
        prompt_number: Option<i64>,
        discovery_tokens: Vec<String>,
    ) -> Result<(i64, i64)> {
        let external = require_external_id(external_session_id)?;
        let project_owned = project.to_string();
        for token in discovery_tokens {
            let token = token.trim().to_lowercase();
            if !token.is_empty() && !draft.concepts.contains(&token) {
                draft.concepts.push(token);
            }
        }
        let draft_for_insert = draft.clone();

        let observation = self
            .pool
            .run_with_retry("store_observation", move |conn| {
                let session = db::ensure_session_sync(conn, &external, &project_owned)?;
                let (id, _) = db::insert_observation_sync(
                    conn,
                    session,
                    &project_owned,
                    &draft_for_insert,
                    prompt_number,
                )?;
                db::get_observation_sync(conn, id)?
                    .ok_or_else(|| LoreError::Other("inserted observation vanished".into()))
            })
            .await?;
        let (id, epoch) = (observation.id, observation.created_at_epoch);

        // Synchronous pattern analysis. A detector failure never loses the
        // observation itself.
        if let Err(e) = self.detector.analyze(&observation).await {
            tracing::warn!("pattern analysis for observation {} failed: {}", id, e);
        }

        if let Err(e) = self.detect_links(&observation).await {
            tracing::warn!("link detection for observation {} failed: {}", id, e);
        }

        if let Err(e) = self.embed_observation(&observation).await {
            tracing::warn!("embedding for observation {} failed: {}", id, e);
        }

        if !project.is_empty() {
            self.cleanup.offer(CleanupJob::ObservationCap {
                project: project.to_string(),
            });
        }

        Ok((id, epoch))
    }

    /// Compare the new observation against recent active rows of the same
    /// project: an identical title+type supersedes the older row; heavy
    /// concept overlap links similar_to; shared modified files link
    /// relates_to.
    async fn detect_links(&self, obs: &Observation) -> Result<()> {
        if obs.project.is_empty() {
            return Ok(());
        }
        let obs = obs.clone();
        self.pool
            .run_labeled("detect_links", move |conn| {
                let recent = db::get_active_sync(conn, &obs.project, LINK_SCAN_LIMIT)?;
                for other in recent.iter().filter(|o| o.id != obs.id) {
                    let same_title = obs.title.is_some()
                        && obs.title == other.title
                        && obs.obs_type == other.obs_type;
                    if same_title {
                        db::store_conflict_sync(
                            conn,
                            obs.id,
                            other.id,
                            ConflictType::Superseded,
                            ConflictResolution::PreferNewer,
                            Some("newer observation with the same title"),
                            None,
                        )?;
                        db::mark_superseded_sync(conn, other.id)?;
                        db::store_relation_sync(
                            conn,
                            obs.id,
                            other.id,
                            RelationType::Supersedes,
                            0.9,
                            DetectionSource::PatternAnalysis,
                            None,
                        )?;
                        continue;
                    }

                    let shared_concepts = obs
                        .concepts
                        .iter()
                        .filter(|c| other.concepts.contains(c))
                        .count();
                    if shared_concepts >= MIN_SHARED_CONCEPTS {
                        let confidence = (0.3 + 0.1 * shared_concepts as f64).min(0.9);
                        db::store_relation_sync(
                            conn,
                            obs.id,
                            other.id,
                            RelationType::SimilarTo,
                            confidence,
                            DetectionSource::ConceptOverlap,
                            None,
                        )?;
                        continue;
                    }

                    let shares_file = obs
                        .files_modified
                        .iter()
                        .any(|f| other.files_modified.contains(f));
                    if shares_file {
                        db::store_relation_sync(
                            conn,
                            obs.id,
                            other.id,
                            RelationType::RelatesTo,
                            0.5,
                            DetectionSource::FileOverlap,
                            None,
                        )?;
                    }
                }
                Ok(())
            })
            .await
    }

    /// Embed the observation's searchable text into the vector index.
    async fn embed_observation(&self, obs: &Observation) -> Result<()> {
        let Some(ref embedder) = self.embedder else {
            return Ok(());
        };
        let text = observation_embed_text(obs);
        if text.is_empty() {
            return Ok(());
        }
        let embedding = embedder.embed(&text).await?;
        let insert = VectorInsert {
            doc_id: format!("observation:{}:summary", obs.id),
            source_row_id: obs.id,
            doc_type: "observation".to_string(),
            field_type: "summary".to_string(),
            project: obs.project.clone(),
            scope: obs
                .scope
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|| "project".to_string()),
            model_version: embedder.model_version().to_string(),
            embedding,
        };
        let dim = self.config.store.embedding_dim;
        self.pool
            .run_labeled("embed_observation", move |conn| {
                db::upsert_vector_sync(conn, &insert, dim)
            })
            .await
    }

    // ========================================================================
    // Observations: reads and lifecycle
    // ========================================================================

    pub async fn get_observation(&self, id: i64) -> Result<Option<Observation>> {
        require_positive_id(id)?;
        self.pool
            .run_labeled("get_observation", move |conn| {
                db::get_observation_sync(conn, id).map_err(Into::into)
            })
            .await
    }

    pub async fn get_recent(&self, project: &str, limit: usize) -> Result<Vec<Observation>> {
        let project = project.to_string();
        self.pool
            .run_labeled("get_recent", move |conn| {
                db::get_recent_sync(conn, &project, limit).map_err(Into::into)
            })
            .await
    }

    pub async fn get_active(&self, project: &str, limit: usize) -> Result<Vec<Observation>> {
        let project = project.to_string();
        self.pool
            .run_labeled("get_active", move |conn| {
                db::get_active_sync(conn, &project, limit).map_err(Into::into)
            })
            .await
    }

    pub async fn get_by_ids(
        &self,
        ids: Vec<i64>,
        order_by: OrderBy,
        limit: usize,
    ) -> Result<Vec<Observation>> {
        self.pool
            .run_labeled("get_by_ids", move |conn| {
                db::get_by_ids_sync(conn, &ids, order_by, limit).map_err(Into::into)
            })
            .await
    }

    pub async fn get_by_ids_preserve_order(&self, ids: Vec<i64>) -> Result<Vec<Observation>> {
        self.pool
            .run_labeled("get_by_ids_preserve_order", move |conn| {
                db::get_by_ids_preserve_order_sync(conn, &ids).map_err(Into::into)
            })
            .await
    }

    /// One page of the full ascending-id scan; pass the last seen id (0 to
    /// start). An empty page means the scan is done.
    pub async fn scan_observations(
        &self,
        after_id: i64,
        batch_size: usize,
    ) -> Result<Vec<Observation>> {
        self.pool
            .run_labeled("scan_observations", move |conn| {
                db::get_page_sync(conn, after_id, batch_size.max(1)).map_err(Into::into)
            })
            .await
    }

    /// Apply a partial update; the patch must carry at least one field.
    pub async fn update_observation(&self, id: i64, patch: ObservationPatch) -> Result<bool> {
        require_positive_id(id)?;
        if patch.is_empty() {
            return Err(LoreError::InvalidInput("empty observation patch".into()));
        }
        if let Some(feedback) = patch.user_feedback {
            require_feedback_range(feedback)?;
        }
        self.pool
            .run_labeled("update_observation", move |conn| {
                db::update_observation_sync(conn, id, &patch).map_err(Into::into)
            })
            .await
    }

    pub async fn mark_superseded(&self, id: i64) -> Result<bool> {
        require_positive_id(id)?;
        self.pool
            .run_labeled("mark_superseded", move |conn| {
                db::mark_superseded_sync(conn, id).map_err(Into::into)
            })
            .await
    }

    pub async fn mark_superseded_batch(&self, ids: Vec<i64>) -> Result<usize> {
        self.pool
            .run_labeled("mark_superseded_batch", move |conn| {
                db::mark_superseded_batch_sync(conn, &ids).map_err(Into::into)
            })
            .await
    }

    pub async fn archive(&self, id: i64, reason: &str) -> Result<bool> {
        require_positive_id(id)?;
        let reason = reason.to_string();
        self.pool
            .run_labeled("archive", move |conn| {
                db::archive_sync(conn, id, &reason).map_err(Into::into)
            })
            .await
    }

    /// Archive everything in a project older than `max_age_days` (defaults
    /// to the configured auto-archive age). Returns the archived ids.
    pub async fn archive_old(
        &self,
        project: &str,
        max_age_days: Option<i64>,
        reason: &str,
    ) -> Result<Vec<i64>> {
        let project = project.to_string();
        let reason = reason.to_string();
        let days = max_age_days.unwrap_or(self.config.store.auto_archive_days);
        self.pool
            .run_labeled("archive_old", move |conn| {
                db::archive_old_sync(conn, &project, days, &reason).map_err(Into::into)
            })
            .await
    }

    pub async fn unarchive(&self, id: i64) -> Result<bool> {
        require_positive_id(id)?;
        self.pool
            .run_labeled("unarchive", move |conn| {
                db::unarchive_sync(conn, id).map_err(Into::into)
            })
            .await
    }

    pub async fn delete_observation(&self, id: i64) -> Result<bool> {
        require_positive_id(id)?;
        self.pool
            .run_labeled("delete_observation", move |conn| {
                db::delete_observation_sync(conn, id).map_err(Into::into)
            })
            .await
    }

    // ========================================================================
    // Hybrid search
    // ========================================================================

    /// Full-text-only search (the keyword path with LIKE fallback).
    pub async fn search_fts(
        &self,
        query: &str,
        project: &str,
        limit: usize,
    ) -> Result<Vec<Observation>> {
        let query = query.to_string();
        let project = project.to_string();
        self.pool
            .run_labeled("search_fts", move |conn| {
                db::search_fts_sync(conn, &query, &project, limit).map_err(Into::into)
            })
            .await
    }

    /// Hybrid search: BM25 text ranking and cosine vector similarity run
    /// concurrently, fuse by weighted min-max normalization, hydrate in rank
    /// order, and bump retrieval counters for what is returned.
    pub async fn search(&self, query: &str, project: &str, limit: usize) -> Result<Vec<SearchHit>> {
        if limit == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }
        // Over-fetch each stream so fusion has real overlap to rank.
        let fetch = limit * 2;
        let dim = self.config.store.embedding_dim;

        let query_owned = query.to_string();
        let project_owned = project.to_string();
        let fts_task = self.pool.run_labeled("hybrid_fts", move |conn| {
            db::search_fts_scored_sync(conn, &query_owned, &project_owned, fetch)
                .map_err(Into::into)
        });

        let vector_task = async {
            let Some(ref embedder) = self.embedder else {
                return Ok(Vec::new());
            };
            let embedding = embedder.embed(query).await?;
            let project = project.to_string();
            self.pool
                .run_labeled("hybrid_vector", move |conn| {
                    db::search_vectors_sync(conn, &embedding, "observation", &project, fetch, dim)
                })
                .await
        };

        let (fts_result, vector_result) = tokio::join!(fts_task, vector_task);
        let fts_scored = fts_result?;
        let vector_hits = vector_result?;

        // Assemble fusion candidates. FTS rows carry their own importance
        // and recency; vector-only ids need a hydration round for theirs.
        let mut candidates: HashMap<i64, FusionCandidate> = HashMap::new();
        for (obs, rank) in &fts_scored {
            candidates.insert(
                obs.id,
                FusionCandidate {
                    id: obs.id,
                    fts_score: Some(*rank),
                    vector_score: None,
                    importance: obs.importance_score,
                    created_at_epoch: obs.created_at_epoch,
                },
            );
        }
        let mut vector_only: Vec<i64> = Vec::new();
        for hit in &vector_hits {
            match candidates.get_mut(&hit.source_row_id) {
                Some(candidate) => {
                    candidate.vector_score = Some(distance_to_score(hit.distance));
                }
                None => vector_only.push(hit.source_row_id),
            }
        }
        if !vector_only.is_empty() {
            let rows = self
                .get_by_ids_preserve_order(vector_only.clone())
                .await?;
            let by_id: HashMap<i64, &Observation> = rows.iter().map(|o| (o.id, o)).collect();
            for hit in &vector_hits {
                if let Some(obs) = by_id.get(&hit.source_row_id) {
                    if obs.is_archived {
                        continue;
                    }
                    candidates.entry(obs.id).or_insert(FusionCandidate {
                        id: obs.id,
                        fts_score: None,
                        vector_score: Some(distance_to_score(hit.distance)),
                        importance: obs.importance_score,
                        created_at_epoch: obs.created_at_epoch,
                    });
                }
            }
        }

        let fused = fuse_ranked(
            candidates.into_values().collect(),
            DEFAULT_FTS_WEIGHT,
            DEFAULT_VECTOR_WEIGHT,
            limit,
        );
        if fused.is_empty() {
            return Ok(Vec::new());
        }

        let ranked_ids: Vec<i64> = fused.iter().map(|f| f.id).collect();
        let rows = self.get_by_ids_preserve_order(ranked_ids.clone()).await?;

        let returned_ids: Vec<i64> = rows.iter().map(|o| o.id).collect();
        self.pool
            .run_labeled("hybrid_retrieval_count", move |conn| {
                db::increment_retrieval_count_sync(conn, &returned_ids).map_err(Into::into)
            })
            .await?;

        let scores: HashMap<i64, f64> = fused.into_iter().map(|f| (f.id, f.score)).collect();
        Ok(rows
            .into_iter()
            .map(|observation| {
                let score = scores.get(&observation.id).copied().unwrap_or(0.0);
                SearchHit {
                    observation,
                    score,
                }
            })
            .collect())
    }

    // ========================================================================
    // Conflicts & relations
    // ========================================================================

    pub async fn store_conflict(
        &self,
        newer_obs_id: i64,
        older_obs_id: i64,
        conflict_type: ConflictType,
        resolution: ConflictResolution,
        reason: Option<String>,
        detected_at: Option<i64>,
    ) -> Result<i64> {
        require_positive_id(newer_obs_id)?;
        require_positive_id(older_obs_id)?;
        if newer_obs_id == older_obs_id {
            return Err(LoreError::InvalidInput(
                "an observation cannot conflict with itself".into(),
            ));
        }
        self.pool
            .run_labeled("store_conflict", move |conn| {
                db::store_conflict_sync(
                    conn,
                    newer_obs_id,
                    older_obs_id,
                    conflict_type,
                    resolution,
                    reason.as_deref(),
                    detected_at,
                )
                .map_err(Into::into)
            })
            .await
    }

    pub async fn conflicts_for(&self, obs_id: i64) -> Result<Vec<Conflict>> {
        require_positive_id(obs_id)?;
        self.pool
            .run_labeled("conflicts_for", move |conn| {
                db::get_conflicts_for_observation_sync(conn, obs_id).map_err(Into::into)
            })
            .await
    }

    /// Delete superseded observations whose prefer-newer conflict is past
    /// the retention window. Returns the deleted ids.
    pub async fn cleanup_superseded(&self, project: &str) -> Result<Vec<i64>> {
        let project = project.to_string();
        let days = self.config.store.superseded_retention_days;
        self.pool
            .run_labeled("cleanup_superseded", move |conn| {
                db::cleanup_superseded_sync(conn, &project, days).map_err(Into::into)
            })
            .await
    }

    pub async fn store_relation(
        &self,
        source_id: i64,
        target_id: i64,
        relation_type: RelationType,
        confidence: f64,
        detection_source: DetectionSource,
        reason: Option<String>,
    ) -> Result<i64> {
        require_positive_id(source_id)?;
        require_positive_id(target_id)?;
        if source_id == target_id {
            return Err(LoreError::InvalidInput(
                "an observation cannot relate to itself".into(),
            ));
        }
        self.pool
            .run_labeled("store_relation", move |conn| {
                db::store_relation_sync(
                    conn,
                    source_id,
                    target_id,
                    relation_type,
                    confidence,
                    detection_source,
                    reason.as_deref(),
                )
                .map_err(Into::into)
            })
            .await
    }

    pub async fn relations_for(&self, obs_id: i64) -> Result<Vec<Relation>> {
        require_positive_id(obs_id)?;
        self.pool
            .run_labeled("relations_for", move |conn| {
                db::get_relations_sync(conn, obs_id).map_err(Into::into)
            })
            .await
    }

    pub async fn relations_with_details(&self, obs_id: i64) -> Result<Vec<RelationDetail>> {
        require_positive_id(obs_id)?;
        self.pool
            .run_labeled("relations_with_details", move |conn| {
                db::get_relations_with_details_sync(conn, obs_id).map_err(Into::into)
            })
            .await
    }

    /// BFS over the relation graph from one root.
    pub async fn expand_graph(&self, root_id: i64, max_depth: usize) -> Result<db::GraphExpansion> {
        require_positive_id(root_id)?;
        self.pool
            .run_labeled("expand_graph", move |conn| {
                Ok(db::expand_graph_sync(conn, root_id, max_depth))
            })
            .await
    }

    // ========================================================================
    // Patterns
    // ========================================================================

    pub async fn get_pattern(&self, id: i64) -> Result<Option<Pattern>> {
        require_positive_id(id)?;
        self.pool
            .run_labeled("get_pattern", move |conn| {
                db::get_pattern_sync(conn, id).map_err(Into::into)
            })
            .await
    }

    pub async fn patterns_for_project(&self, project: &str, limit: usize) -> Result<Vec<Pattern>> {
        let project = project.to_string();
        self.pool
            .run_labeled("patterns_for_project", move |conn| {
                db::get_patterns_by_project_sync(conn, &project, limit).map_err(Into::into)
            })
            .await
    }

    pub async fn patterns_by_type(
        &self,
        pattern_type: lore_types::PatternType,
        limit: usize,
    ) -> Result<Vec<Pattern>> {
        self.pool
            .run_labeled("patterns_by_type", move |conn| {
                db::get_patterns_by_type_sync(conn, pattern_type, limit).map_err(Into::into)
            })
            .await
    }

    /// Active pattern by exact name.
    pub async fn pattern_by_name(&self, name: &str) -> Result<Option<Pattern>> {
        let name = name.to_string();
        self.pool
            .run_labeled("pattern_by_name", move |conn| {
                db::get_pattern_by_name_sync(conn, &name).map_err(Into::into)
            })
            .await
    }

    pub async fn search_patterns(&self, query: &str, limit: usize) -> Result<Vec<Pattern>> {
        let query = query.to_string();
        self.pool
            .run_labeled("search_patterns", move |conn| {
                db::search_patterns_fts_sync(conn, &query, limit).map_err(Into::into)
            })
            .await
    }

    pub async fn pattern_stats(&self) -> Result<PatternStats> {
        self.pool
            .run_labeled("pattern_stats", |conn| {
                db::pattern_stats_sync(conn).map_err(Into::into)
            })
            .await
    }

    pub async fn merge_patterns(&self, source_id: i64, target_id: i64) -> Result<Option<Pattern>> {
        require_positive_id(source_id)?;
        require_positive_id(target_id)?;
        self.pool
            .run_labeled("merge_patterns", move |conn| {
                db::merge_patterns_sync(conn, source_id, target_id).map_err(Into::into)
            })
            .await
    }

    /// Size of the detector's in-memory candidate pool.
    pub async fn candidate_count(&self) -> usize {
        self.detector.candidate_count().await
    }

    // ========================================================================
    // Scoring
    // ========================================================================

    pub async fn set_feedback(&self, id: i64, feedback: i64) -> Result<bool> {
        require_positive_id(id)?;
        require_feedback_range(feedback)?;
        self.pool
            .run_labeled("set_feedback", move |conn| {
                db::set_feedback_sync(conn, id, feedback).map_err(Into::into)
            })
            .await
    }

    pub async fn update_importance_scores(&self, scores: HashMap<i64, f64>) -> Result<usize> {
        self.pool
            .run_labeled("update_importance_scores", move |conn| {
                db::update_importance_scores_sync(conn, &scores).map_err(Into::into)
            })
            .await
    }

    pub async fn observations_needing_score_update(
        &self,
        threshold_ms: i64,
        limit: usize,
    ) -> Result<Vec<Observation>> {
        self.pool
            .run_labeled("observations_needing_score_update", move |conn| {
                db::observations_needing_score_update_sync(conn, threshold_ms, limit)
                    .map_err(Into::into)
            })
            .await
    }

    pub async fn concept_weights(&self) -> Result<HashMap<String, f64>> {
        self.pool
            .run_labeled("concept_weights", |conn| {
                Ok(db::get_concept_weights_sync(conn))
            })
            .await
    }

    pub async fn set_concept_weights(&self, weights: HashMap<String, f64>) -> Result<usize> {
        self.pool
            .run_labeled("set_concept_weights", move |conn| {
                db::set_concept_weights_sync(conn, &weights).map_err(Into::into)
            })
            .await
    }

    pub async fn feedback_stats(&self, project: Option<&str>) -> Result<db::FeedbackStats> {
        let project = project.map(|p| p.to_string());
        self.pool
            .run_labeled("feedback_stats", move |conn| {
                db::feedback_stats_sync(conn, project.as_deref()).map_err(Into::into)
            })
            .await
    }

    pub async fn reset_scores(&self) -> Result<usize> {
        self.pool
            .run_labeled("reset_scores", |conn| {
                db::reset_scores_sync(conn).map_err(Into::into)
            })
            .await
    }

    // ========================================================================
    // Summaries & prompts
    // ========================================================================

    pub async fn store_summary(
        &self,
        external_session_id: &str,
        project: &str,
        fields: SummaryFields,
    ) -> Result<i64> {
        let external = require_external_id(external_session_id)?;
        let project = project.to_string();
        self.pool
            .run_with_retry("store_summary", move |conn| {
                let session = db::ensure_session_sync(conn, &external, &project)?;
                db::store_summary_sync(conn, session, &project, &fields).map_err(Into::into)
            })
            .await
    }

    pub async fn search_summaries(
        &self,
        query: &str,
        project: &str,
        limit: usize,
    ) -> Result<Vec<SessionSummary>> {
        let query = query.to_string();
        let project = project.to_string();
        self.pool
            .run_labeled("search_summaries", move |conn| {
                db::search_summaries_sync(conn, &query, &project, limit).map_err(Into::into)
            })
            .await
    }

    /// Save a prompt; duplicates return the existing id and skip the cap
    /// cleanup kick.
    pub async fn save_prompt(
        &self,
        external_session_id: &str,
        prompt_number: i64,
        prompt_text: &str,
        matched_observations: Vec<i64>,
    ) -> Result<i64> {
        let external = require_external_id(external_session_id)?;
        let text = prompt_text.to_string();
        let (id, created) = self
            .pool
            .run_with_retry("save_prompt", move |conn| {
                db::save_prompt_sync(conn, &external, prompt_number, &text, &matched_observations)
                    .map_err(Into::into)
            })
            .await?;
        if created {
            self.cleanup.offer(CleanupJob::PromptCap);
        }
        Ok(id)
    }

    pub async fn search_prompts(&self, query: &str, limit: usize) -> Result<Vec<UserPrompt>> {
        let query = query.to_string();
        self.pool
            .run_labeled("search_prompts", move |conn| {
                db::search_prompts_sync(conn, &query, limit).map_err(Into::into)
            })
            .await
    }

    // ========================================================================
    // Documents & chunks
    // ========================================================================

    pub async fn upsert_document(
        &self,
        collection: &str,
        path: &str,
        title: Option<&str>,
        body: &str,
    ) -> Result<Document> {
        let collection = collection.to_string();
        let path = path.to_string();
        let title = title.map(|t| t.to_string());
        let body = body.to_string();
        self.pool
            .run_with_retry("upsert_document", move |conn| {
                db::upsert_document_sync(conn, &collection, &path, title.as_deref(), &body)
                    .map_err(Into::into)
            })
            .await
    }

    pub async fn upsert_chunks(&self, hash: &str, chunks: Vec<ChunkInsert>) -> Result<usize> {
        let hash = hash.to_string();
        let dim = self.config.store.embedding_dim;
        self.pool
            .run_labeled("upsert_chunks", move |conn| {
                db::upsert_chunks_sync(conn, &hash, &chunks, dim)
            })
            .await
    }

    pub async fn search_chunks(
        &self,
        embedding: Vec<f32>,
        collection: &str,
        limit: usize,
    ) -> Result<Vec<ChunkHit>> {
        let collection = collection.to_string();
        let dim = self.config.store.embedding_dim;
        self.pool
            .run_labeled("search_chunks", move |conn| {
                db::search_chunks_sync(conn, &embedding, &collection, limit, dim)
            })
            .await
    }

    pub async fn deactivate_document(&self, collection: &str, path: &str) -> Result<bool> {
        let collection = collection.to_string();
        let path = path.to_string();
        self.pool
            .run_labeled("deactivate_document", move |conn| {
                db::deactivate_document_sync(conn, &collection, &path).map_err(Into::into)
            })
            .await
    }

    pub async fn get_content(&self, hash: &str) -> Result<Option<String>> {
        let hash = hash.to_string();
        self.pool
            .run_labeled("get_content", move |conn| {
                db::get_content_sync(conn, &hash).map_err(Into::into)
            })
            .await
    }

    // ========================================================================
    // Indexed JSONL sessions
    // ========================================================================

    /// Parse a session JSONL file and upsert its searchable snapshot,
    /// skipping files whose mtime has not moved since the last pass.
    pub async fn index_session_file(&self, path: &Path) -> Result<Option<i64>> {
        let mtime = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64);

        let parsed = jsonl::parse_session_file(path)?;
        if parsed.session_id.is_none() {
            return Ok(None);
        }
        let insert = jsonl::to_indexed_session(&parsed, &identity::workstation_id(), mtime);

        let unchanged = {
            let (w, p, s) = (
                insert.workstation_id.clone(),
                insert.project_id.clone(),
                insert.session_id.clone(),
            );
            let stored = self
                .pool
                .run_labeled("indexed_session_mtime", move |conn| {
                    Ok(db::indexed_session_mtime_sync(conn, &w, &p, &s))
                })
                .await?;
            stored.is_some() && stored == mtime
        };
        if unchanged {
            return Ok(None);
        }

        let id = self
            .pool
            .run_labeled("index_session_file", move |conn| {
                db::upsert_indexed_session_sync(conn, &insert).map_err(Into::into)
            })
            .await?;
        Ok(Some(id))
    }

    pub async fn search_indexed_sessions(
        &self,
        query: &str,
        project_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<IndexedSession>> {
        let query = query.to_string();
        let project_id = project_id.map(|p| p.to_string());
        self.pool
            .run_labeled("search_indexed_sessions", move |conn| {
                db::search_indexed_sessions_sync(conn, &query, project_id.as_deref(), limit)
                    .map_err(Into::into)
            })
            .await
    }

    // ========================================================================
    // Observability
    // ========================================================================

    /// Cached health snapshot (status, pool stats, probe latency).
    pub async fn health(&self) -> HealthSnapshot {
        self.health.health().await
    }

    /// Fresh snapshot bypassing the cache.
    pub async fn health_forced(&self) -> HealthSnapshot {
        self.health.health_forced().await
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Refresh the query planner's statistics.
    pub async fn optimize(&self) -> Result<()> {
        self.pool.optimize().await.map_err(Into::into)
    }
}

/// Text fed to the embedder for an observation.
fn observation_embed_text(obs: &Observation) -> String {
    let mut parts: Vec<&str> = Vec::new();
    if let Some(ref t) = obs.title {
        parts.push(t);
    }
    if let Some(ref s) = obs.subtitle {
        parts.push(s);
    }
    if let Some(ref n) = obs.narrative {
        parts.push(n);
    }
    let mut text = parts.join("\n");
    for fact in &obs.facts {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(fact);
    }
    text
}

fn require_external_id(external_session_id: &str) -> Result<String> {
    if external_session_id.trim().is_empty() {
        return Err(LoreError::InvalidInput("empty external session id".into()));
    }
    Ok(external_session_id.to_string())
}

fn require_positive_id(id: i64) -> Result<()> {
    if id <= 0 {
        return Err(LoreError::InvalidInput(format!("invalid id {}", id)));
    }
    Ok(())
}

fn require_feedback_range(feedback: i64) -> Result<()> {
    if !(-1..=1).contains(&feedback) {
        return Err(LoreError::InvalidInput(format!(
            "feedback must be -1, 0 or +1 (got {})",
            feedback
        )));
    }
    Ok(())
}

/// Embeds freshly promoted patterns into the vector index. Drains its
/// channel on shutdown.
fn spawn_pattern_vectorizer(
    pool: Arc<DatabasePool>,
    embedder: Arc<dyn Embedder>,
    dim: usize,
    mut rx: mpsc::UnboundedReceiver<Pattern>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        while let Ok(pattern) = rx.try_recv() {
                            vectorize_pattern(&pool, embedder.as_ref(), dim, &pattern).await;
                        }
                        break;
                    }
                }
                pattern = rx.recv() => match pattern {
                    Some(pattern) => vectorize_pattern(&pool, embedder.as_ref(), dim, &pattern).await,
                    None => break,
                },
            }
        }
    })
}

async fn vectorize_pattern(
    pool: &Arc<DatabasePool>,
    embedder: &dyn Embedder,
    dim: usize,
    pattern: &Pattern,
) {
    let mut text = pattern.name.clone();
    if let Some(ref description) = pattern.description {
        text.push('\n');
        text.push_str(description);
    }
    let embedding = match embedder.embed(&text).await {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!("pattern {} embedding failed: {}", pattern.id, e);
            return;
        }
    };
    let insert = VectorInsert {
        doc_id: format!("pattern:{}:summary", pattern.id),
        source_row_id: pattern.id,
        doc_type: "pattern".to_string(),
        field_type: "summary".to_string(),
        project: String::new(),
        scope: "global".to_string(),
        model_version: embedder.model_version().to_string(),
        embedding,
    };
    let result = pool
        .run_labeled("vectorize_pattern", move |conn| {
            db::upsert_vector_sync(conn, &insert, dim)
        })
        .await;
    if let Err(e) = result {
        tracing::warn!("pattern {} vector write failed: {}", pattern.id, e);
    }
}
