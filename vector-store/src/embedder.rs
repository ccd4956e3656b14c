//! Embedding provider seam and the caching, normalizing implementation.
//!
//! The pipeline depends on [`EmbeddingsProvider`] only; the production
//! implementation wraps the shared Ollama profiles, L2-normalizes every
//! vector (so cosine similarity equals dot product), and memoizes results
//! in a bounded LRU keyed by `(model, SHA256(text))`. The cache never
//! changes semantics: a hit returns exactly the vector a miss would have.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use futures::stream::{self, StreamExt};
use lru::LruCache;
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use llm_service::LlmServiceProfiles;

use crate::errors::VectorError;

/// Async embedding backend seam.
pub trait EmbeddingsProvider: Send + Sync {
    /// Model identifier, part of every cache key.
    fn model(&self) -> &str;

    fn embed<'a>(
        &'a self,
        text: &'a str,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Vec<f32>, VectorError>> + Send + 'a>,
    >;
}

/// In-place L2 normalization. Returns `false` when the norm is zero.
pub fn l2_normalize(v: &mut [f32]) -> bool {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return false;
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
    true
}

/// Cosine similarity with a zero-norm guard. Mismatched lengths compare
/// over the shared prefix.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 { 0.0 } else { dot / denom }
}

/// Embeds `texts` with bounded parallelism, preserving input order.
pub async fn embed_many(
    provider: &dyn EmbeddingsProvider,
    texts: &[String],
    concurrency: usize,
) -> Result<Vec<Vec<f32>>, VectorError> {
    debug!(
        total = texts.len(),
        concurrency, "embed_many: running bounded fan-out"
    );

    let mut results: Vec<(usize, Vec<f32>)> = stream::iter(texts.iter().enumerate())
        .map(|(i, text)| async move {
            let v = provider.embed(text).await?;
            Ok::<(usize, Vec<f32>), VectorError>((i, v))
        })
        .buffer_unordered(concurrency.max(1))
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<Vec<_>, VectorError>>()?;

    results.sort_by_key(|(i, _)| *i);
    Ok(results.into_iter().map(|(_, v)| v).collect())
}

type CacheKey = [u8; 32];

/// The production embedder: shared Ollama profiles + LRU + normalization.
pub struct CachedEmbedder {
    svc: Arc<LlmServiceProfiles>,
    model: String,
    expected_dim: Option<usize>,
    cache: Mutex<LruCache<CacheKey, Arc<Vec<f32>>>>,
}

impl CachedEmbedder {
    /// Default cache capacity; a work's chunks plus the trope catalog fit
    /// comfortably.
    pub const DEFAULT_CACHE_CAP: usize = 8192;

    pub fn new(
        svc: Arc<LlmServiceProfiles>,
        expected_dim: Option<usize>,
        cache_capacity: usize,
    ) -> Self {
        let model = svc.profiles().1.model.clone();
        let cap = NonZeroUsize::new(cache_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            svc,
            model,
            expected_dim,
            cache: Mutex::new(LruCache::new(cap)),
        }
    }

    fn cache_key(&self, text: &str) -> CacheKey {
        let mut hasher = Sha256::new();
        hasher.update(self.model.as_bytes());
        hasher.update([0u8]);
        hasher.update(text.as_bytes());
        hasher.finalize().into()
    }

    fn cache_get(&self, key: &CacheKey) -> Option<Arc<Vec<f32>>> {
        match self.cache.lock() {
            Ok(mut guard) => guard.get(key).cloned(),
            Err(_) => None,
        }
    }

    fn cache_put(&self, key: CacheKey, value: Arc<Vec<f32>>) {
        if let Ok(mut guard) = self.cache.lock() {
            guard.put(key, value);
        }
    }
}

impl EmbeddingsProvider for CachedEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    fn embed<'a>(
        &'a self,
        text: &'a str,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Vec<f32>, VectorError>> + Send + 'a>,
    > {
        Box::pin(async move {
            let key = self.cache_key(text);
            if let Some(hit) = self.cache_get(&key) {
                trace!(len = text.len(), "embed cache hit");
                return Ok(hit.as_ref().clone());
            }

            let mut vector = self
                .svc
                .embed(text)
                .await
                .map_err(|e| VectorError::EmbedUnavailable(e.to_string()))?;

            if vector.is_empty() {
                return Err(VectorError::EmbedEmpty);
            }
            if let Some(want) = self.expected_dim {
                if vector.len() != want {
                    return Err(VectorError::VectorSizeMismatch {
                        got: vector.len(),
                        want,
                    });
                }
            }
            if !l2_normalize(&mut vector) {
                // An all-zero vector cannot participate in cosine space.
                return Err(VectorError::EmbedEmpty);
            }

            self.cache_put(key, Arc::new(vector.clone()));
            Ok(vector)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l2_normalize_produces_unit_vectors() {
        let mut v = vec![3.0, 4.0];
        assert!(l2_normalize(&mut v));
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn l2_normalize_rejects_zero() {
        let mut v = vec![0.0, 0.0];
        assert!(!l2_normalize(&mut v));
    }

    #[test]
    fn cosine_of_normalized_equals_dot() {
        let mut a = vec![1.0, 2.0, 3.0];
        let mut b = vec![-2.0, 0.5, 1.0];
        l2_normalize(&mut a);
        l2_normalize(&mut b);
        let dot: f32 = a.iter().zip(&b).map(|(x, y)| x * y).sum();
        assert!((cosine(&a, &b) - dot).abs() < 1e-6);
    }

    struct FixedEmbedder;

    impl EmbeddingsProvider for FixedEmbedder {
        fn model(&self) -> &str {
            "fixed"
        }

        fn embed<'a>(
            &'a self,
            text: &'a str,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<Vec<f32>, VectorError>> + Send + 'a>,
        > {
            let n = text.len() as f32;
            Box::pin(async move { Ok(vec![n, 1.0]) })
        }
    }

    #[tokio::test]
    async fn embed_many_preserves_order() {
        let texts: Vec<String> = vec!["a".into(), "bb".into(), "ccc".into()];
        let out = embed_many(&FixedEmbedder, &texts, 2).await.unwrap();
        assert_eq!(out[0][0], 1.0);
        assert_eq!(out[1][0], 2.0);
        assert_eq!(out[2][0], 3.0);
    }
}
