// crates/lore-server/src/embedder.rs
// Embedding model seam. The engine never talks to a model directly; callers
// hand in an implementation of this trait at open time.

use async_trait::async_trait;

use crate::error::Result;

/// A dense-embedding model producing fixed-dimension vectors.
///
/// Implementations must return vectors of exactly `dim()` elements; the
/// vector store rejects anything else before it reaches the database.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// The fixed output dimension (must match the configured embedding_dim).
    fn dim(&self) -> usize;

    /// Identifier recorded alongside stored vectors (e.g. "minilm-l6-v2").
    fn model_version(&self) -> &str;

    /// Embed one text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch. The default implementation embeds sequentially;
    /// implementations backed by batched APIs should override.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Deterministic test embedder: hashes tokens into a fixed-dim vector.
    pub struct HashEmbedder {
        pub dim: usize,
    }

    #[async_trait]
    impl Embedder for HashEmbedder {
        fn dim(&self) -> usize {
            self.dim
        }

        fn model_version(&self) -> &str {
            "hash-test-v1"
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let mut v = vec![0.0f32; self.dim];
            for token in text.to_lowercase().split_whitespace() {
                let mut h: u64 = 1469598103934665603;
                for b in token.bytes() {
                    h ^= b as u64;
                    h = h.wrapping_mul(1099511628211);
                }
                v[(h % self.dim as u64) as usize] += 1.0;
            }
            let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 0.0 {
                for x in v.iter_mut() {
                    *x /= norm;
                }
            }
            Ok(v)
        }
    }

    #[tokio::test]
    async fn hash_embedder_is_deterministic_and_normalized() {
        let e = HashEmbedder { dim: 384 };
        let a = e.embed("null pointer deref").await.unwrap();
        let b = e.embed("null pointer deref").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 384);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }
}
