//! Three-tier memory: core working memory (always in prompt), auto-RAG
//! retrieval (pre-flight, see `chat`), and archival vector memory.

pub mod archival;
pub mod core;
pub mod embeddings;

pub use archival::{
    ArchivalMemory, CognitiveMapEntry, FORGET_DISTANCE, MemoryHit, MemorizeOutcome,
    normalise_category,
};
pub use core::{AppendOutcome, CORE_MEMORY_LIMIT, CoreMemory, TRUNCATION_MARKER};
pub use embeddings::{
    EMBEDDING_DIM, EmbeddingProvider, HashEmbeddingProvider, LruEmbeddingCache, cosine_distance,
    cosine_similarity,
};
