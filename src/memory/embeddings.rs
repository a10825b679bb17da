//! Embedding generation and caching for the archival memory.
//!
//! This module provides:
//! - [`EmbeddingProvider`] — async trait for computing text embeddings
//! - [`HashEmbeddingProvider`] — deterministic token-hash embeddings for
//!   tests and offline operation
//! - [`LruEmbeddingCache`] — LRU-cached wrapper over any provider
//! - [`cosine_distance`] — the similarity measure used for dedup and forget
//!
//! All embeddings within one category must come from a single model;
//! switching models requires rebuilding the category.

use std::{num::NonZeroUsize, sync::Mutex};

use async_trait::async_trait;
use lru::LruCache;

/// Embedding dimension used throughout the memory subsystem.
pub const EMBEDDING_DIM: usize = 384;

// ─── EmbeddingProvider ───────────────────────────────────────────────────────

/// Async trait for computing fixed-dimension, unit-normalised text embeddings.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, String>;
}

// ─── cosine ──────────────────────────────────────────────────────────────────

/// Cosine similarity between two vectors, clamped to `[0, 1]`.
/// Returns `0.0` for mismatched lengths or all-zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        0.0
    } else {
        (dot / (mag_a * mag_b)).clamp(0.0, 1.0)
    }
}

/// Cosine distance (`1 − similarity`).  Distances below `0.15` are treated
/// as "same content" by the forget path.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

// ─── HashEmbeddingProvider ───────────────────────────────────────────────────

/// Deterministic bag-of-tokens embedding provider.
///
/// Each lowercased token is hashed into a dimension; texts sharing tokens
/// land near each other.  Useful for tests and as an offline fallback —
/// never mixed into a category built with a real model.
#[derive(Debug, Default)]
pub struct HashEmbeddingProvider;

impl HashEmbeddingProvider {
    pub fn new() -> Self {
        Self
    }

    fn token_dim(token: &str) -> usize {
        // FNV-1a, folded into the dimension count.
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for b in token.bytes() {
            hash ^= u64::from(b);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        (hash % EMBEDDING_DIM as u64) as usize
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, String> {
        let mut raw = vec![0.0f32; EMBEDDING_DIM];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            raw[Self::token_dim(token)] += 1.0;
        }
        let mag: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        if mag > 0.0 {
            for v in &mut raw {
                *v /= mag;
            }
        }
        Ok(raw)
    }
}

// ─── LruEmbeddingCache ───────────────────────────────────────────────────────

/// LRU-cached wrapper over any [`EmbeddingProvider`], keyed by input text.
pub struct LruEmbeddingCache<P> {
    inner: P,
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl<P: EmbeddingProvider> LruEmbeddingCache<P> {
    pub fn new(inner: P, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }
}

#[async_trait]
impl<P: EmbeddingProvider> EmbeddingProvider for LruEmbeddingCache<P> {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, String> {
        if let Ok(mut cache) = self.cache.lock()
            && let Some(hit) = cache.get(text)
        {
            return Ok(hit.clone());
        }
        let vector = self.inner.embed(text).await?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(text.to_owned(), vector.clone());
        }
        Ok(vector)
    }
}
