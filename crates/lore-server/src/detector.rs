// crates/lore-server/src/detector.rs
// Pattern detector: an in-memory candidate pool fed by every stored
// observation, promoting recurring signatures into persistent patterns.
//
// The candidate map is bounded: inserts evict the least-recently-seen entry
// synchronously when the map is full, so the pool can never outgrow its cap
// between periodic sweeps.

use std::collections::HashMap;
use std::sync::Arc;

use lore_types::{Observation, ObservationType, Pattern, PatternType};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use crate::config::DetectorConfig;
use crate::db::pool::DatabasePool;
use crate::db::{self, PatternInsert};
use crate::error::Result;

/// How many recent observations each periodic pass re-analyzes.
const PERIODIC_ANALYSIS_BATCH: usize = 100;

/// How many active patterns are considered for signature matching.
const MATCH_POOL_LIMIT: usize = 500;

/// Invoked for every freshly promoted pattern (e.g. to add it to the vector
/// index).
pub type NewPatternCallback = Arc<dyn Fn(&Pattern) + Send + Sync>;

/// A pre-pattern accumulator, held only in memory.
#[derive(Debug, Clone)]
struct Candidate {
    signature: Vec<String>,
    observation_ids: Vec<i64>,
    projects: Vec<String>,
    last_seen_epoch: i64,
    tentative_type: PatternType,
    tentative_title: String,
}

pub struct PatternDetector {
    pool: Arc<DatabasePool>,
    config: DetectorConfig,
    candidates: RwLock<HashMap<String, Candidate>>,
    on_new_pattern: Option<NewPatternCallback>,
}

/// Ordered, deduplicated signature tokens: the observation's concepts plus
/// keywords from its title.
fn extract_signature(obs: &Observation) -> Vec<String> {
    let mut signature = Vec::new();
    for concept in &obs.concepts {
        let token = concept.trim().to_lowercase();
        if !token.is_empty() && !signature.contains(&token) {
            signature.push(token);
        }
    }
    if let Some(ref title) = obs.title {
        for token in db::extract_keywords(title) {
            if !signature.contains(&token) {
                signature.push(token);
            }
        }
    }
    signature
}

/// Jaccard similarity over signature token sets.
fn signature_similarity(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.iter().filter(|token| b.contains(token)).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Pattern type guessed from the triggering observation. Signature concepts
/// override the per-type mapping.
fn tentative_type(obs: &Observation, signature: &[String]) -> PatternType {
    if signature.iter().any(|t| t == "anti-pattern") {
        return PatternType::AntiPattern;
    }
    if signature.iter().any(|t| t == "best-practice") {
        return PatternType::BestPractice;
    }
    match obs.obs_type {
        ObservationType::Bugfix => PatternType::Bug,
        ObservationType::Refactor => PatternType::Refactor,
        _ => PatternType::Architecture,
    }
}

fn tentative_title(obs: &Observation, signature: &[String]) -> String {
    if let Some(ref title) = obs.title {
        if !title.trim().is_empty() {
            return title.trim().to_string();
        }
    }
    signature
        .iter()
        .take(3)
        .cloned()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Confidence assigned at promotion; grows with the backing evidence.
fn promotion_confidence(observation_count: usize) -> f64 {
    (0.4 + 0.1 * observation_count as f64).min(0.9)
}

impl PatternDetector {
    pub fn new(
        pool: Arc<DatabasePool>,
        config: DetectorConfig,
        on_new_pattern: Option<NewPatternCallback>,
    ) -> Self {
        Self {
            pool,
            config,
            candidates: RwLock::new(HashMap::new()),
            on_new_pattern,
        }
    }

    /// Current candidate pool size.
    pub async fn candidate_count(&self) -> usize {
        self.candidates.read().await.len()
    }

    /// Analyze one observation.
    ///
    /// Matches against stored active patterns first (best Jaccard score at
    /// or above the configured minimum wins and absorbs the observation);
    /// otherwise updates or creates a candidate, promoting it once it has
    /// accumulated enough observations. Returns the matched or promoted
    /// pattern, if any.
    pub async fn analyze(&self, obs: &Observation) -> Result<Option<Pattern>> {
        let signature = extract_signature(obs);
        if signature.is_empty() {
            return Ok(None);
        }

        if let Some(matched) = self.match_existing(obs, &signature).await? {
            return Ok(Some(matched));
        }

        let promoted = self.accumulate_candidate(obs, &signature).await;
        match promoted {
            Some(candidate) => self.promote(candidate).await.map(Some),
            None => Ok(None),
        }
    }

    /// Try to absorb the observation into the best-matching stored pattern.
    async fn match_existing(
        &self,
        obs: &Observation,
        signature: &[String],
    ) -> Result<Option<Pattern>> {
        let patterns = self
            .pool
            .run_labeled("detector_match", |conn| {
                db::get_active_patterns_sync(conn, MATCH_POOL_LIMIT).map_err(Into::into)
            })
            .await?;

        let mut best: Option<(f64, Pattern)> = None;
        for pattern in patterns {
            let score = signature_similarity(signature, &pattern.signature);
            if score >= self.config.min_match_score
                && best.as_ref().map(|(s, _)| score > *s).unwrap_or(true)
            {
                best = Some((score, pattern));
            }
        }

        let Some((_, mut pattern)) = best else {
            return Ok(None);
        };

        pattern.frequency += 1;
        if !pattern.observation_ids.contains(&obs.id) {
            pattern.observation_ids.push(obs.id);
        }
        if !obs.project.is_empty() && !pattern.projects.contains(&obs.project) {
            pattern.projects.push(obs.project.clone());
        }
        pattern.last_seen_at_epoch = chrono::Utc::now().timestamp_millis();

        let to_store = pattern.clone();
        self.pool
            .run_labeled("detector_update_pattern", move |conn| {
                db::update_pattern_sync(conn, &to_store).map_err(Into::into)
            })
            .await?;
        Ok(Some(pattern))
    }

    /// Update or insert the candidate for this signature. Returns the
    /// candidate when it just crossed the promotion threshold (already
    /// removed from the map).
    async fn accumulate_candidate(
        &self,
        obs: &Observation,
        signature: &[String],
    ) -> Option<Candidate> {
        let key = signature.join("|");
        let now = chrono::Utc::now().timestamp_millis();
        let mut candidates = self.candidates.write().await;

        match candidates.get_mut(&key) {
            Some(existing) => {
                if !existing.observation_ids.contains(&obs.id) {
                    existing.observation_ids.push(obs.id);
                }
                if !obs.project.is_empty() && !existing.projects.contains(&obs.project) {
                    existing.projects.push(obs.project.clone());
                }
                existing.last_seen_epoch = now;
            }
            None => {
                // Synchronous LRU eviction keeps the pool bounded even when
                // the periodic sweep is far away.
                if candidates.len() >= self.config.max_candidates {
                    if let Some(oldest_key) = candidates
                        .iter()
                        .min_by_key(|(_, c)| c.last_seen_epoch)
                        .map(|(k, _)| k.clone())
                    {
                        tracing::debug!("[detector] evicting oldest candidate {}", oldest_key);
                        candidates.remove(&oldest_key);
                    }
                }
                candidates.insert(
                    key.clone(),
                    Candidate {
                        signature: signature.to_vec(),
                        observation_ids: vec![obs.id],
                        projects: if obs.project.is_empty() {
                            Vec::new()
                        } else {
                            vec![obs.project.clone()]
                        },
                        last_seen_epoch: now,
                        tentative_type: tentative_type(obs, signature),
                        tentative_title: tentative_title(obs, signature),
                    },
                );
            }
        }

        let reached_threshold = candidates
            .get(&key)
            .map(|c| c.observation_ids.len() >= self.config.min_frequency_for_pattern)
            .unwrap_or(false);
        if reached_threshold {
            return candidates.remove(&key);
        }
        None
    }

    /// Persist a promoted candidate and notify the callback.
    async fn promote(&self, candidate: Candidate) -> Result<Pattern> {
        let insert = PatternInsert {
            name: candidate.tentative_title.clone(),
            pattern_type: candidate.tentative_type,
            description: None,
            recommendation: None,
            signature: candidate.signature.clone(),
            projects: candidate.projects.clone(),
            observation_ids: candidate.observation_ids.clone(),
            confidence: promotion_confidence(candidate.observation_ids.len()),
        };
        let stored = self
            .pool
            .run_labeled("detector_promote", move |conn| {
                db::insert_pattern_sync(conn, &insert).map_err(Into::into)
            })
            .await;

        match stored {
            Ok(pattern) => {
                tracing::info!(
                    "[detector] promoted pattern '{}' (frequency {})",
                    pattern.name,
                    pattern.frequency
                );
                if let Some(ref callback) = self.on_new_pattern {
                    callback(&pattern);
                }
                Ok(pattern)
            }
            Err(e) => {
                // Put the candidate back so the evidence isn't lost.
                let key = candidate.signature.join("|");
                self.candidates.write().await.insert(key, candidate);
                Err(e)
            }
        }
    }

    /// Drop candidates unseen for the TTL and re-enforce the cap.
    async fn sweep(&self) {
        let ttl_ms = self.config.candidate_ttl_days * 24 * 60 * 60 * 1000;
        let cutoff = chrono::Utc::now().timestamp_millis() - ttl_ms;
        let mut candidates = self.candidates.write().await;

        let before = candidates.len();
        candidates.retain(|_, c| c.last_seen_epoch >= cutoff);

        while candidates.len() > self.config.max_candidates {
            let Some(oldest_key) = candidates
                .iter()
                .min_by_key(|(_, c)| c.last_seen_epoch)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            candidates.remove(&oldest_key);
        }

        let removed = before - candidates.len();
        if removed > 0 {
            tracing::debug!("[detector] swept {} stale candidates", removed);
        }
    }

    /// Re-analyze the most recent observations across all projects.
    async fn periodic_pass(&self) -> Result<()> {
        let recent = self
            .pool
            .run_labeled("detector_periodic_fetch", |conn| {
                db::get_latest_observations_sync(conn, PERIODIC_ANALYSIS_BATCH)
                    .map_err(Into::into)
            })
            .await?;
        for obs in recent {
            if let Err(e) = self.analyze(&obs).await {
                tracing::warn!("[detector] analysis of observation {} failed: {}", obs.id, e);
            }
        }
        Ok(())
    }

    /// Start the periodic analysis loop. Exits cleanly on shutdown.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let detector = Arc::clone(self);
        tokio::spawn(async move { detector.run(shutdown).await })
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.analysis_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup isn't an
        // analysis burst.
        interval.tick().await;

        tracing::debug!("[detector] analysis loop started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.periodic_pass().await {
                        tracing::warn!("[detector] periodic analysis failed: {}", e);
                    }
                    self.sweep().await;
                }
            }
        }
        tracing::debug!("[detector] analysis loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::setup_test_pool;
    use lore_types::{ObservationDraft, PatternStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn stored_observation(
        pool: &Arc<DatabasePool>,
        project: &str,
        title: &str,
        concepts: Vec<String>,
    ) -> Observation {
        let project = project.to_string();
        let title = title.to_string();
        pool.interact(move |conn| {
            let session = db::ensure_session_sync(conn, "det-session", &project)?;
            let draft = ObservationDraft {
                obs_type: Some(ObservationType::Bugfix),
                title: Some(title),
                concepts,
                ..Default::default()
            };
            let (id, _) = db::insert_observation_sync(conn, session, &project, &draft, None)?;
            Ok(db::get_observation_sync(conn, id)?.expect("just inserted"))
        })
        .await
        .unwrap()
    }

    fn detector(pool: &Arc<DatabasePool>, config: DetectorConfig) -> Arc<PatternDetector> {
        Arc::new(PatternDetector::new(pool.clone(), config, None))
    }

    #[test]
    fn signature_is_ordered_and_deduped() {
        let mut obs = Observation {
            id: 1,
            session_id: 1,
            project: "p".into(),
            scope: None,
            obs_type: ObservationType::Bugfix,
            title: Some("Null deref in parser".into()),
            subtitle: None,
            narrative: None,
            facts: vec![],
            concepts: vec!["bug".into(), "null-deref".into(), "bug".into()],
            files_read: vec![],
            files_modified: vec![],
            file_mtimes: Default::default(),
            prompt_number: None,
            created_at_epoch: 0,
            importance_score: 1.0,
            user_feedback: 0,
            retrieval_count: 0,
            last_retrieved_at_epoch: None,
            score_updated_at_epoch: None,
            is_superseded: false,
            is_archived: false,
            archived_at_epoch: None,
            archived_reason: None,
        };
        let signature = extract_signature(&obs);
        assert_eq!(signature, vec!["bug", "null-deref", "null", "deref", "parser"]);

        obs.concepts.clear();
        obs.title = None;
        assert!(extract_signature(&obs).is_empty());
    }

    #[test]
    fn jaccard_similarity_basics() {
        let a = vec!["bug".to_string(), "null-deref".to_string()];
        let b = vec!["bug".to_string(), "null-deref".to_string()];
        assert!((signature_similarity(&a, &b) - 1.0).abs() < 1e-9);

        let c = vec!["bug".to_string(), "race".to_string()];
        assert!((signature_similarity(&a, &c) - (1.0 / 3.0)).abs() < 1e-9);

        assert_eq!(signature_similarity(&a, &[]), 0.0);
    }

    #[tokio::test]
    async fn two_matching_observations_promote_a_pattern() {
        let pool = setup_test_pool().await;
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        let detector = Arc::new(PatternDetector::new(
            pool.clone(),
            DetectorConfig::default(),
            Some(Arc::new(move |_p: &Pattern| {
                counter_clone.fetch_add(1, Ordering::SeqCst);
            })),
        ));

        let o1 = stored_observation(&pool, "proj-a", "", vec!["bug".into(), "null-deref".into()])
            .await;
        let o2 = stored_observation(&pool, "proj-a", "", vec!["bug".into(), "null-deref".into()])
            .await;

        assert!(detector.analyze(&o1).await.unwrap().is_none());
        assert_eq!(detector.candidate_count().await, 1);

        let promoted = detector.analyze(&o2).await.unwrap().expect("promotion");
        assert_eq!(promoted.frequency, 2);
        assert_eq!(promoted.observation_ids, vec![o1.id, o2.id]);
        assert_eq!(promoted.frequency as usize, promoted.observation_ids.len());
        assert_eq!(promoted.status, PatternStatus::Active);
        assert_eq!(promoted.pattern_type, PatternType::Bug);

        // The promoted candidate left the pool and the callback fired once
        assert_eq!(detector.candidate_count().await, 0);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn third_observation_joins_stored_pattern() {
        let pool = setup_test_pool().await;
        let detector = detector(&pool, DetectorConfig::default());

        let o1 = stored_observation(&pool, "proj-a", "", vec!["bug".into(), "leak".into()]).await;
        let o2 = stored_observation(&pool, "proj-a", "", vec!["bug".into(), "leak".into()]).await;
        detector.analyze(&o1).await.unwrap();
        detector.analyze(&o2).await.unwrap();

        // Same signature from another project: absorbed by the stored
        // pattern, not a new candidate.
        let o3 = stored_observation(&pool, "proj-b", "", vec!["bug".into(), "leak".into()]).await;
        let matched = detector.analyze(&o3).await.unwrap().expect("match");
        assert_eq!(matched.frequency, 3);
        assert!(matched.observation_ids.contains(&o3.id));
        assert!(matched.projects.contains(&"proj-b".to_string()));
        assert_eq!(detector.candidate_count().await, 0);
    }

    #[tokio::test]
    async fn empty_signature_is_ignored() {
        let pool = setup_test_pool().await;
        let detector = detector(&pool, DetectorConfig::default());
        let obs = stored_observation(&pool, "proj-a", "", vec![]).await;
        assert!(detector.analyze(&obs).await.unwrap().is_none());
        assert_eq!(detector.candidate_count().await, 0);
    }

    #[tokio::test]
    async fn insert_evicts_oldest_when_full() {
        let pool = setup_test_pool().await;
        let config = DetectorConfig {
            max_candidates: 3,
            min_frequency_for_pattern: 5, // keep everything a candidate
            ..Default::default()
        };
        let detector = detector(&pool, config);

        for i in 0..3 {
            let obs = stored_observation(
                &pool,
                "proj-a",
                "",
                vec![format!("concept-{i}"), "filler".into()],
            )
            .await;
            detector.analyze(&obs).await.unwrap();
            // Distinct last_seen stamps
            tokio::time::sleep(std::time::Duration::from_millis(3)).await;
        }
        assert_eq!(detector.candidate_count().await, 3);

        // A fourth distinct signature evicts the oldest (concept-0)
        let obs =
            stored_observation(&pool, "proj-a", "", vec!["concept-9".into(), "filler".into()])
                .await;
        detector.analyze(&obs).await.unwrap();
        assert_eq!(detector.candidate_count().await, 3);

        let candidates = detector.candidates.read().await;
        assert!(!candidates.keys().any(|k| k.contains("concept-0")));
        assert!(candidates.keys().any(|k| k.contains("concept-9")));
    }

    #[tokio::test]
    async fn sweep_drops_stale_candidates() {
        let pool = setup_test_pool().await;
        let detector = detector(&pool, DetectorConfig::default());

        let obs =
            stored_observation(&pool, "proj-a", "", vec!["old".into(), "memory".into()]).await;
        detector.analyze(&obs).await.unwrap();
        assert_eq!(detector.candidate_count().await, 1);

        // Age the candidate past the TTL by hand
        {
            let mut candidates = detector.candidates.write().await;
            for candidate in candidates.values_mut() {
                candidate.last_seen_epoch -= 8 * 24 * 60 * 60 * 1000;
            }
        }
        detector.sweep().await;
        assert_eq!(detector.candidate_count().await, 0);
    }

    #[tokio::test]
    async fn loop_exits_on_shutdown() {
        let pool = setup_test_pool().await;
        let detector = detector(&pool, DetectorConfig::default());
        let (tx, rx) = watch::channel(false);

        let handle = detector.spawn(rx);
        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("loop should exit promptly")
            .unwrap();
    }
}
