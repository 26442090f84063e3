// crates/lore-server/src/search/utils.rs
// Shared helpers for vector search

/// Convert an f32 embedding to little-endian bytes for sqlite-vec.
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Convert a cosine distance (0 = identical) into a similarity score.
pub fn distance_to_score(distance: f64) -> f64 {
    1.0 - distance.clamp(0.0, 1.0)
}
