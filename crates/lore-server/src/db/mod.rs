// crates/lore-server/src/db/mod.rs
// Unified database layer with rusqlite + sqlite-vec

mod conflicts;
mod documents;
pub mod health;
mod indexed_sessions;
mod migration_helpers;
mod observations;
mod patterns;
pub mod pool;
mod prompts;
mod relations;
pub mod retention;
mod schema;
mod scoring;
mod sessions;
mod summaries;
#[cfg(test)]
pub(crate) mod test_support;
mod vectors;

pub use conflicts::{
    cleanup_superseded_sync, delete_conflicts_by_observation_sync,
    get_conflicts_for_observation_sync, parse_conflict_row, resolve_conflict_sync,
    store_conflict_sync,
};
pub use documents::{
    content_hash, deactivate_document_sync, delete_content_sync, get_content_sync,
    get_document_sync, list_documents_sync, parse_document_row, search_chunks_sync,
    search_documents_sync, upsert_chunks_sync, upsert_document_sync,
};
pub use indexed_sessions::{
    get_indexed_session_sync, indexed_session_mtime_sync, parse_indexed_session_row,
    search_indexed_sessions_sync, upsert_indexed_session_sync, IndexedSessionInsert,
};
pub use observations::{
    archive_old_sync, archive_sync, delete_observation_sync, derive_scope, extract_keywords,
    get_active_sync, get_by_ids_preserve_order_sync, get_by_ids_sync, get_latest_observations_sync,
    get_observation_sync, get_page_sync, get_recent_sync, insert_observation_sync,
    mark_superseded_batch_sync,
    mark_superseded_sync, parse_observation_row, search_fts_scored_sync, search_fts_sync,
    unarchive_sync, update_observation_sync, GLOBAL_CONCEPTS,
};
pub use patterns::{
    delete_pattern_sync, get_active_patterns_sync, get_pattern_by_name_sync, get_pattern_sync,
    get_patterns_by_project_sync, get_patterns_by_type_sync, insert_pattern_sync,
    merge_patterns_sync, parse_pattern_row, pattern_stats_sync, search_patterns_fts_sync,
    update_pattern_sync, PatternInsert,
};
pub use prompts::{
    count_prompts_sync, get_prompt_sync, get_prompts_for_session_sync, parse_prompt_row,
    save_prompt_sync, search_prompts_sync,
};
pub use relations::{
    delete_relations_by_observation_sync, expand_graph_sync, get_incoming_sync,
    get_outgoing_sync, get_relations_by_type_sync, get_relations_sync,
    get_relations_with_details_sync, parse_relation_row, store_relation_sync,
    store_relations_batch_sync, update_relation_confidence_sync, GraphExpansion, RelationInsert,
};
pub use retention::{
    cleanup_project_sync, cleanup_prompts_sync, count_active_observations_sync,
    projects_with_superseded_sync, CleanupJob, CleanupQueue, CleanupWorker, DeletedIdsCallback,
    CLEANUP_QUEUE_CAPACITY,
};
pub use schema::stored_embedding_dim;
pub use scoring::{
    feedback_stats_sync, get_concept_weights_sync, increment_retrieval_count_sync,
    observations_needing_score_update_sync, reset_scores_sync, set_concept_weights_sync,
    set_feedback_sync, update_concept_weight_sync, update_importance_scores_sync, FeedbackStats,
    DEFAULT_CONCEPT_WEIGHTS,
};
pub use sessions::{
    close_session_sync, create_session_sync, ensure_session_sync, get_session_sync,
    increment_prompt_counter_sync, parse_session_row,
};
pub use summaries::{
    get_recent_summaries_sync, get_summaries_for_session_sync, parse_summary_row,
    search_summaries_sync, store_summary_sync,
};
pub use vectors::{
    count_vectors_sync, delete_vectors_by_doc_ids_sync, delete_vectors_by_source_sync,
    search_vectors_sync, upsert_vector_sync, VectorHit, VectorInsert,
};

/// Current time as milliseconds since the UNIX epoch. Every stored epoch
/// column goes through this.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Log and drop a failed row during result iteration. Used with
/// `filter_map` over `query_map` iterators so one bad row never aborts a
/// whole read.
pub(crate) fn log_and_discard<T>(result: rusqlite::Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("discarding unreadable row: {}", e);
            None
        }
    }
}
